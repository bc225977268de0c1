//! Retry decorator for blocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::{Block, BlockError, Context};

/// Substring marking an error as worth another attempt.
pub const RETRY_WORD: &str = "please retry";

/// Longest single delay a schedule will sleep.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Decides whether an error should trigger another attempt.
pub type RetryPredicate = Arc<dyn Fn(&BlockError) -> bool + Send + Sync>;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub duration: Duration,

    /// Multiplier applied to the delay after each attempt.
    pub factor: f64,

    /// Jitter fraction (0.0 to 1.0) applied symmetrically to each delay.
    pub jitter: f64,

    /// Total number of attempts, including the first.
    pub steps: u32,

    /// Upper bound for a single delay.
    pub cap: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.0,
            steps: 4,
            cap: None,
        }
    }
}

impl Backoff {
    /// Delay to wait after the given failed attempt (zero based).
    ///
    /// Without a `cap` the delay saturates at [`MAX_DELAY`], so long
    /// schedules never overflow.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.cap.unwrap_or(MAX_DELAY).min(MAX_DELAY).as_secs_f64();
        let raw = self.duration.as_secs_f64() * self.factor.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let mut delay = if raw.is_finite() { raw.min(ceiling) } else { ceiling };
        if self.jitter > 0.0 {
            let spread = delay * self.jitter.min(1.0);
            delay += rand::rng().random_range(-spread..=spread);
        }
        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(MAX_DELAY)
    }

    /// Every delay the schedule sleeps between attempts.
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.steps.saturating_sub(1))
            .map(|attempt| self.delay(attempt))
            .collect()
    }
}

/// Matches any error whose message carries [`RETRY_WORD`].
pub fn retry_on_sentinel() -> RetryPredicate {
    Arc::new(|err: &BlockError| err.to_string().contains(RETRY_WORD))
}

/// Wrap a block with the default backoff and the sentinel predicate.
pub fn with_default_retry(block: Arc<dyn Block>) -> Arc<dyn Block> {
    Arc::new(Retryable::new(
        block,
        Backoff::default(),
        vec![retry_on_sentinel()],
    ))
}

/// Block decorator retrying `ensure` while any predicate matches.
///
/// `purge` and `clean_up` are passed through unchanged.
pub struct Retryable {
    inner: Arc<dyn Block>,
    backoff: Backoff,
    retry_on: Vec<RetryPredicate>,
}

impl Retryable {
    pub fn new(inner: Arc<dyn Block>, backoff: Backoff, retry_on: Vec<RetryPredicate>) -> Self {
        Self {
            inner,
            backoff,
            retry_on,
        }
    }

    fn should_retry(&self, err: &BlockError) -> bool {
        if err.is_config() {
            return false;
        }
        self.retry_on.iter().any(|need| need(err))
    }
}

#[async_trait]
impl Block for Retryable {
    fn name(&self) -> String {
        self.inner.name()
    }

    async fn ensure(&self, ctx: &Context) -> Result<(), BlockError> {
        let steps = self.backoff.steps.max(1);
        let mut attempt = 0;
        loop {
            let err = match self.inner.ensure(ctx).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            attempt += 1;

            if !self.should_retry(&err) {
                return Err(err);
            }
            if attempt >= steps || ctx.is_cancelled() {
                warn!(
                    block = %self.inner.name(),
                    attempts = attempt,
                    error = %err,
                    "retry budget exhausted"
                );
                return Err(err);
            }

            let delay = self.backoff.delay(attempt - 1);
            warn!(
                block = %self.inner.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retry on error"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn purge(&self, ctx: &Context) -> Result<(), BlockError> {
        self.inner.purge(ctx).await
    }

    async fn clean_up(&self, ctx: &Context) -> Result<(), BlockError> {
        self.inner.clean_up(ctx).await
    }
}
