//! Provisioning block primitives.
//!
//! A [`Block`] is one unit of idempotent provisioning work on a node:
//! installing the container runtime, writing the kubelet unit, forming the
//! etcd cluster. Blocks are composed into a flat, ordered plan and driven by
//! [`run_blocks`]. Two composites change how a block executes without changing
//! the interface:
//!
//! - [`Retryable`] re-runs `ensure` with exponential backoff while a retry
//!   predicate matches the returned error.
//! - [`ConcurrentBlock`] fans its children out to independent tasks and
//!   aggregates every failure.
//!
//! # Invariants
//!
//! - `ensure` converges: calling it on an already-provisioned resource succeeds
//!   without changing anything.
//! - `purge` is idempotent: tearing down something that is absent succeeds.
//! - A composite never swallows a child's error.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info};

mod concurrent;
mod error;
mod retry;

pub use concurrent::ConcurrentBlock;
pub use error::{AggregateError, BlockError};
pub use retry::{retry_on_sentinel, with_default_retry, Backoff, RetryPredicate, Retryable, MAX_DELAY, RETRY_WORD};

/// Execution context handed to every block operation.
///
/// Cancellation is advisory. The sequential runner and the retry decorator
/// check it between steps; a block that has already started is never
/// interrupted.
#[derive(Debug, Clone)]
pub struct Context {
    shutdown: watch::Receiver<bool>,
}

impl Context {
    /// Create a context that observes the given shutdown signal.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// A context that is never cancelled.
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { shutdown: rx }
    }

    /// Returns true once shutdown has been signaled.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// A unit of idempotent provisioning work.
#[async_trait]
pub trait Block: Send + Sync {
    /// Human readable name used in logs and error context.
    fn name(&self) -> String;

    /// Drive the resource toward its installed and configured state.
    async fn ensure(&self, ctx: &Context) -> Result<(), BlockError>;

    /// Tear the resource down.
    async fn purge(&self, ctx: &Context) -> Result<(), BlockError>;

    /// Secondary best-effort cleanup.
    ///
    /// Most provisioners do not implement it yet and report
    /// [`BlockError::NotImplemented`].
    async fn clean_up(&self, _ctx: &Context) -> Result<(), BlockError> {
        Err(BlockError::NotImplemented {
            block: self.name(),
            operation: "clean_up",
        })
    }
}

/// Run `ensure` on each block in order, stopping at the first failure.
///
/// The failing stage's name is attached to the returned error.
pub async fn run_blocks(blocks: &[Arc<dyn Block>], ctx: &Context) -> Result<(), BlockError> {
    for (index, block) in blocks.iter().enumerate() {
        let stage = block.name();
        if ctx.is_cancelled() {
            return Err(BlockError::Cancelled(stage));
        }

        info!(stage = %stage, index, total = blocks.len(), "running block");
        if let Err(e) = block.ensure(ctx).await {
            error!(stage = %stage, error = %e, "block failed, aborting plan");
            return Err(BlockError::Stage {
                stage,
                source: Box::new(e),
            });
        }
        debug!(stage = %stage, "block finished");
    }
    Ok(())
}

/// Run `purge` on each block in order, stopping at the first failure.
pub async fn purge_blocks(blocks: &[Arc<dyn Block>], ctx: &Context) -> Result<(), BlockError> {
    for block in blocks {
        let stage = block.name();
        info!(stage = %stage, "purging block");
        block.purge(ctx).await.map_err(|e| BlockError::Stage {
            stage: format!("purge {}", stage),
            source: Box::new(e),
        })?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Block whose `ensure` results are scripted up front.
    ///
    /// Once the script runs out every further call succeeds.
    pub struct ScriptedBlock {
        pub name: String,
        pub script: Mutex<Vec<Result<(), String>>>,
        pub delay: Duration,
        pub ensures: AtomicUsize,
        pub purges: AtomicUsize,
        pub log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl ScriptedBlock {
        pub fn ok(name: &str) -> Self {
            Self::scripted(name, vec![])
        }

        pub fn failing(name: &str, message: &str) -> Self {
            let mut block = Self::scripted(name, vec![]);
            block.script = Mutex::new(vec![Err(message.to_string()); 64]);
            block
        }

        pub fn scripted(name: &str, script: Vec<Result<(), String>>) -> Self {
            Self {
                name: name.to_string(),
                script: Mutex::new(script.into_iter().rev().collect()),
                delay: Duration::ZERO,
                ensures: AtomicUsize::new(0),
                purges: AtomicUsize::new(0),
                log: None,
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn with_log(mut self, log: Arc<Mutex<Vec<String>>>) -> Self {
            self.log = Some(log);
            self
        }

        pub fn ensure_count(&self) -> usize {
            self.ensures.load(Ordering::SeqCst)
        }

        fn record(&self, op: &str) {
            if let Some(log) = &self.log {
                log.lock().unwrap().push(format!("{} {}", op, self.name));
            }
        }
    }

    #[async_trait]
    impl Block for ScriptedBlock {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
            self.ensures.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.record("ensure");
            let next = self.script.lock().unwrap().pop();
            match next {
                Some(Err(message)) => Err(BlockError::Failed(anyhow::anyhow!(message))),
                _ => Ok(()),
            }
        }

        async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
            self.purges.fetch_add(1, Ordering::SeqCst);
            self.record("purge");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::testing::ScriptedBlock;
    use super::*;

    #[tokio::test]
    async fn test_run_blocks_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let blocks: Vec<Arc<dyn Block>> = vec![
            Arc::new(ScriptedBlock::ok("a").with_log(Arc::clone(&log))),
            Arc::new(ScriptedBlock::ok("b").with_log(Arc::clone(&log))),
            Arc::new(ScriptedBlock::ok("c").with_log(Arc::clone(&log))),
        ];

        run_blocks(&blocks, &Context::background()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["ensure a", "ensure b", "ensure c"]
        );
    }

    #[tokio::test]
    async fn test_run_blocks_fails_fast() {
        let first = Arc::new(ScriptedBlock::ok("first"));
        let broken = Arc::new(ScriptedBlock::failing("broken", "disk full"));
        let never = Arc::new(ScriptedBlock::ok("never"));
        let blocks: Vec<Arc<dyn Block>> = vec![first.clone(), broken.clone(), never.clone()];

        let err = run_blocks(&blocks, &Context::background())
            .await
            .unwrap_err();

        assert!(matches!(err, BlockError::Stage { ref stage, .. } if stage == "broken"));
        assert!(err.to_string().contains("disk full"));
        assert_eq!(first.ensure_count(), 1);
        assert_eq!(broken.ensure_count(), 1);
        assert_eq!(never.ensure_count(), 0);
    }

    #[tokio::test]
    async fn test_run_blocks_observes_cancellation() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let block = Arc::new(ScriptedBlock::ok("skipped"));
        let blocks: Vec<Arc<dyn Block>> = vec![block.clone()];

        let err = run_blocks(&blocks, &Context::new(rx)).await.unwrap_err();

        assert!(matches!(err, BlockError::Cancelled(_)));
        assert_eq!(block.ensure_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_blocks_in_given_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let blocks: Vec<Arc<dyn Block>> = vec![
            Arc::new(ScriptedBlock::ok("kubelet").with_log(Arc::clone(&log))),
            Arc::new(ScriptedBlock::ok("etcd").with_log(Arc::clone(&log))),
        ];

        purge_blocks(&blocks, &Context::background()).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["purge kubelet", "purge etcd"]);
    }

    #[tokio::test]
    async fn test_clean_up_defaults_to_not_implemented() {
        let block = ScriptedBlock::ok("runtime");
        let err = block.clean_up(&Context::background()).await.unwrap_err();
        assert!(matches!(
            err,
            BlockError::NotImplemented { operation: "clean_up", .. }
        ));
    }
}
