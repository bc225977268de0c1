//! Fan-out composite.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{AggregateError, Block, BlockError, Context};

/// Runs every child concurrently and waits for all of them.
///
/// A failing child does not cancel its siblings. Every failure is collected,
/// prefixed with the child's name, into one [`AggregateError`].
pub struct ConcurrentBlock {
    name: String,
    children: Vec<Arc<dyn Block>>,
}

impl ConcurrentBlock {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn Block>>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }

    pub fn children(&self) -> &[Arc<dyn Block>] {
        &self.children
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Ensure,
    Purge,
}

impl ConcurrentBlock {
    async fn fan_out(&self, op: Op, ctx: &Context) -> Result<(), BlockError> {
        let mut handles = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let child = Arc::clone(child);
            let ctx = ctx.clone();
            let stage = child.name();
            debug!(group = %self.name, child = %stage, ?op, "spawning block");
            let handle = tokio::spawn(async move {
                match op {
                    Op::Ensure => child.ensure(&ctx).await,
                    Op::Purge => child.purge(&ctx).await,
                }
            });
            handles.push((stage, handle));
        }

        let mut failures = AggregateError::default();
        for (stage, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(BlockError::Join(e.to_string())),
            };
            if let Err(e) = result {
                warn!(group = %self.name, child = %stage, ?op, error = %e, "concurrent block failed");
                failures.push(BlockError::Stage {
                    stage,
                    source: Box::new(e),
                });
            }
        }
        failures.into_result()
    }
}

#[async_trait]
impl Block for ConcurrentBlock {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn ensure(&self, ctx: &Context) -> Result<(), BlockError> {
        self.fan_out(Op::Ensure, ctx).await
    }

    async fn purge(&self, ctx: &Context) -> Result<(), BlockError> {
        self.fan_out(Op::Purge, ctx).await
    }
}
