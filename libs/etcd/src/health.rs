//! Consecutive-success health gate.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::ctl::EtcdCtl;
use crate::error::{EtcdError, Result};

/// Counts consecutive successful probes. Any failure resets the count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthStreak {
    required: u32,
    current: u32,
}

impl HealthStreak {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            current: 0,
        }
    }

    /// Record one probe result. Returns true once the streak is long enough.
    pub fn record(&mut self, healthy: bool) -> bool {
        if healthy {
            self.current += 1;
        } else {
            self.current = 0;
        }
        self.is_healthy()
    }

    pub fn is_healthy(&self) -> bool {
        self.current >= self.required
    }

    pub fn current(&self) -> u32 {
        self.current
    }
}

/// Probe `endpoints` every `interval` until `required` consecutive probes
/// pass, or fail once `deadline` has elapsed.
pub async fn wait_for_streak(
    ctl: &dyn EtcdCtl,
    endpoints: &[String],
    required: u32,
    interval: Duration,
    deadline: Duration,
) -> Result<()> {
    let started = Instant::now();
    let mut streak = HealthStreak::new(required);
    let mut last_error: Option<String> = None;

    loop {
        if started.elapsed() >= deadline {
            let what = match last_error {
                Some(e) => format!("etcd endpoints {:?} to become healthy, last error: {}", endpoints, e),
                None => format!("etcd endpoints {:?} to become healthy", endpoints),
            };
            return Err(EtcdError::Timeout {
                what,
                after: deadline,
            });
        }

        tokio::time::sleep(interval).await;
        let healthy = match ctl.endpoint_health(endpoints).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "waiting for etcd to become healthy");
                last_error = Some(e.to_string());
                false
            }
        };
        if streak.record(healthy) {
            info!(?endpoints, probes = streak.current(), "etcd healthy");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streak_resets_on_failure() {
        let probes = [false, true, true, false, true, true, true];
        let mut streak = HealthStreak::new(3);

        let verdicts: Vec<bool> = probes.iter().map(|p| streak.record(*p)).collect();

        assert_eq!(
            verdicts,
            vec![false, false, false, false, false, false, true]
        );
    }

    #[test]
    fn test_two_successes_are_not_enough() {
        let mut streak = HealthStreak::new(3);
        streak.record(true);
        streak.record(true);
        assert!(!streak.is_healthy());
        assert_eq!(streak.current(), 2);
    }
}
