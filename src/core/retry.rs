//! Retry policy for the running stage.
//!
//! Exponential backoff with a cap, bounded by a total attempt count.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for execution attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    /// `max_attempts = 3` means one initial attempt and up to two retries.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(with = "serde_duration")]
    pub initial_delay: Duration,

    /// Upper bound for any single backoff delay.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,

    /// Factor applied to the delay after every failed attempt.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Exponential backoff starting at `initial_delay`, doubling up to `max_delay`.
    pub fn exponential(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Builder: set the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Check if a failed attempt number `attempts_made` may be followed by another.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay to wait after attempt number `failed_attempt` (1-indexed) fails.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        if failed_attempt == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = (failed_attempt - 1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

impl Default for RetryPolicy {
    /// Three attempts, 5s initial backoff capped at one minute.
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(5), Duration::from_secs(60))
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as fractional seconds.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
