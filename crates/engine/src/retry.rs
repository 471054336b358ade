//! Retry policy for transient delivery failures.

use std::time::Duration;

use cadence_core::config::DeliveryConfig;
use chrono::{DateTime, Utc};

/// Exponential backoff for transient delivery failures.
///
/// The delay before attempt N+1 is `min(base_delay * 2^(N-1), max_delay)`.
/// With defaults (base 1 minute, cap 1 hour): 1m, 2m, 4m, 8m, then the step
/// is marked Failed. Only the failing step is rescheduled; later steps keep
/// their original fire times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the initial one. Default: 5.
    pub max_attempts: u32,
    /// Base delay for exponential backoff. Default: 1 minute.
    pub base_delay: Duration,
    /// Cap on the exponential growth. Default: 1 hour.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_secs(config.retry_base_secs),
            max_delay: Duration::from_secs(config.retry_max_secs),
        }
    }

    /// Delay before the next attempt, given the attempt that just failed
    /// (1-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Absolute time of the next attempt.
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.backoff_duration(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64))
    }

    /// Whether another attempt should be made after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
