//! # Backoff Calculator
//!
//! Retry delays for transiently failed tasks.
//!
//! - **Exponential backoff**: `base_delay * multiplier^attempts`, capped at `max_delay`
//! - **Server-requested backoff**: an adapter's `retry_after` wins over the curve (still capped)
//! - **Jitter**: optional ± fraction of the delay so retries of a burst spread out

use crate::config::BackoffConfig;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Computes when a failed task becomes claimable again
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffConfig,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

impl BackoffCalculator {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay on the exponential curve without jitter.
    ///
    /// `attempts` is the number of attempts already consumed before this failure.
    pub fn exponential_delay(&self, attempts: i32) -> Duration {
        let exponent = attempts.clamp(0, 64);
        let delay_ms = self.config.base_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = delay_ms.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before the next attempt, honouring a server-requested delay when present
    pub fn calculate_delay(&self, attempts: i32, retry_after: Option<Duration>) -> Duration {
        let max_delay = Duration::from_millis(self.config.max_delay_ms);
        if let Some(requested) = retry_after {
            return requested.min(max_delay);
        }

        let delay = self.exponential_delay(attempts);
        if !self.config.jitter_enabled || self.config.max_jitter <= 0.0 {
            return delay;
        }

        let spread = delay.as_millis() as f64 * self.config.max_jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (delay.as_millis() as f64 + offset).max(0.0) as u64;
        Duration::from_millis(jittered).min(max_delay)
    }

    pub fn next_retry_at(
        &self,
        now: DateTime<Utc>,
        attempts: i32,
        retry_after: Option<Duration>,
    ) -> DateTime<Utc> {
        let delay = self.calculate_delay(attempts, retry_after);
        now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
