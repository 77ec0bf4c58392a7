//! Retry backoff policy
//!
//! Applied by the store inside `fail_task`: a retriable task goes back to
//! `pending` with its `created_at` shifted forward by the computed delay, so
//! it is not immediately re-claimed.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for failed-task retries.
///
/// Supports exponential growth with jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use photoflow_queue::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_initial_interval(Duration::from_secs(5))
///     .with_max_interval(Duration::from_secs(300));
///
/// // First failure  -> retry after ~5 seconds
/// // Second failure -> retry after ~10 seconds
/// // Third failure  -> retry after ~20 seconds, capped at 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Ceiling for the computed delay.
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor per consumed attempt (e.g. 2.0 for doubling).
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness.
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults:
    ///
    /// - 5 second initial interval
    /// - 5 minute ceiling
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Fixed delay between retries (no growth, no jitter).
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Zero delay: a failed task is eligible for re-claim immediately.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Set the initial retry interval.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval.
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient.
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before a task that has consumed `attempts` attempts (1-based,
    /// counting the failure that just happened) becomes claimable again.
    pub fn delay_after_failure(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(attempts as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.initial_interval, Duration::from_secs(5));
        assert_eq!(policy.max_interval, Duration::from_secs(300));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_delay_growth() {
        let policy = RetryPolicy::exponential().with_jitter(0.0);

        assert_eq!(policy.delay_after_failure(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after_failure(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after_failure(3), Duration::from_secs(20));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(30))
            .with_jitter(0.0);

        assert_eq!(policy.delay_after_failure(10), Duration::from_secs(30));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(7));

        assert_eq!(policy.delay_after_failure(1), Duration::from_secs(7));
        assert_eq!(policy.delay_after_failure(4), Duration::from_secs(7));
    }

    #[test]
    fn test_immediate() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_after_failure(1), Duration::ZERO);
        assert_eq!(policy.delay_after_failure(5), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::exponential().with_jitter(0.1);

        for _ in 0..100 {
            let delay = policy.delay_after_failure(1).as_secs_f64();
            assert!(delay >= 4.5 && delay <= 5.5, "delay {delay} outside ±10%");
        }
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential().with_jitter(0.25);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }
}
