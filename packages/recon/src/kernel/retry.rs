//! Bounded retry with exponential backoff and jitter for transient store
//! failures.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::common::StoreResult;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the backoff anchor used as the jitter half-width.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Un-jittered delay after the given failed attempt (1-based).
    pub fn anchor_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 || self.config.base_delay_ms == 0 {
            return 0;
        }
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let scaled = (self.config.base_delay_ms as f64) * 2f64.powi(exp);
        scaled.min(self.config.max_delay_ms as f64).max(0.0) as u64
    }

    /// Delay for `attempt` with `unit` in `[0, 1]` picking a point in the
    /// jitter window around the anchor.
    pub fn jittered_delay_ms(&self, attempt: u32, unit: f64) -> u64 {
        let anchor = self.anchor_delay_ms(attempt);
        if anchor == 0 {
            return 0;
        }

        let span = (anchor as f64) * self.config.jitter_ratio.max(0.0);
        let lower = (anchor as f64 - span).max(0.0);
        let upper = (anchor as f64 + span).min(self.config.max_delay_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        (lower + (upper - lower) * unit.clamp(0.0, 1.0)).round() as u64
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.jittered_delay_ms(attempt, fastrand::f64()))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "store operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config)
    }
}
