//! Retry policy for failed entries

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, ConfigError};

/// Backoff applied to an entry's `available_time` after a handler failure
///
/// The number of retries is bounded by
/// [`QueueConfig::max_failure_retries`](crate::QueueConfig::max_failure_retries);
/// this policy only decides how long each retry waits.
///
/// # Example
///
/// ```
/// use everruns_queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_retry(1), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_retry(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (1.0 for fixed delay)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

/// What to do with an entry whose handler just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the entry available again after `delay`, with the new error count
    Retry { error_count: u32, delay: Duration },
    /// Retries are used up; the entry goes to `FAILED`
    Exhausted,
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy with fixed intervals (no backoff, no jitter)
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Retry immediately
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry that follows failure number `error_count` (1-based)
    pub fn delay_for_retry(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return Duration::ZERO;
        }

        let exponent = (error_count - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        // Apply jitter
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let jittered = if jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_interval)
    }

    /// Check that the policy produces sane delays
    ///
    /// Fields are public and deserializable, so the builder clamps alone
    /// do not guarantee this.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(ConfigError::InvalidBounds(format!(
                "retry backoff_coefficient ({}) must be a finite value >= 1.0",
                self.backoff_coefficient
            )));
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidBounds(format!(
                "retry jitter ({}) must be within 0.0..=1.0",
                self.jitter
            )));
        }

        if self.initial_interval > self.max_interval {
            return Err(ConfigError::InvalidBounds(format!(
                "retry initial_interval ({:?}) exceeds max_interval ({:?})",
                self.initial_interval, self.max_interval
            )));
        }

        Ok(())
    }

    /// Decide the outcome of a handler failure
    ///
    /// `error_count` is the entry's count before this failure. Once it has
    /// reached `max_failure_retries` the entry is exhausted and the count is
    /// left unchanged.
    pub fn decide(&self, error_count: u32, max_failure_retries: u32) -> RetryDecision {
        if error_count >= max_failure_retries {
            return RetryDecision::Exhausted;
        }

        let error_count = error_count + 1;
        RetryDecision::Retry {
            error_count,
            delay: self.delay_for_retry(error_count),
        }
    }

    /// Next `available_time` for a retry
    ///
    /// Never earlier than the entry's current `available_time`.
    pub fn next_available_time(
        now: DateTime<Utc>,
        current: DateTime<Utc>,
        delay: Duration,
    ) -> DateTime<Utc> {
        let scheduled = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        scheduled.max(current)
    }
}
