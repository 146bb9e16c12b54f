//! Backoff schedule for retrying transactions that lost a deadlock.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often and how patiently to retry a transaction that failed with a
/// deadlock or serialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Wait before the first retry; doubles for every further retry.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Wait after the `attempt`-th failed attempt (1-based):
    /// `retry_delay * 2^(attempt - 1)`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_double() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn huge_attempts_saturate_instead_of_overflowing() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }

    #[test]
    fn deserializes_humantime_durations() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_retries": 5, "retry_delay": "250ms"}"#).unwrap();
        assert_eq!(policy, RetryPolicy::new(5, Duration::from_millis(250)));
    }

    proptest! {
        #[test]
        fn each_wait_is_longer_than_the_previous(base_ms in 1u64..10_000, attempts in 2u32..16) {
            let policy = RetryPolicy::new(attempts, Duration::from_millis(base_ms));
            for attempt in 2..=attempts {
                prop_assert!(policy.delay_for(attempt) > policy.delay_for(attempt - 1));
            }
        }
    }
}
