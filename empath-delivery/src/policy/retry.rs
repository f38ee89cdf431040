//! Retry policy for delivery operations.
//!
//! This module provides a clean abstraction over retry configuration and logic,
//! making it easy to test and reason about retry behavior independently of the
//! delivery processor.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::queue::retry::calculate_next_retry_time;

/// Retry policy configuration for delivery operations.
///
/// Give-up is driven by wall-clock message age rather than attempt count
/// (§4.F): a message keeps retrying on the fixed step schedule until it has
/// been queued for longer than `give_up_send_after_secs`, at which point it
/// is marked `Failed` and a DSN is synthesized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// How long, in seconds, a message may sit undelivered before delivery
    /// is given up.
    ///
    /// Default: 72000 seconds (20 hours)
    #[serde(default = "defaults::give_up_send_after_secs")]
    pub give_up_send_after_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            give_up_send_after_secs: defaults::give_up_send_after_secs(),
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if another retry should be attempted for a message queued at
    /// `queued_at` (unix seconds).
    #[must_use]
    pub fn should_retry(&self, queued_at: u64) -> bool {
        !self.has_expired(queued_at)
    }

    /// Check whether a message queued at `queued_at` (unix seconds) is older
    /// than `give_up_send_after_secs` and should be given up on.
    #[must_use]
    pub fn has_expired(&self, queued_at: u64) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        now.saturating_sub(queued_at) > self.give_up_send_after_secs
    }

    /// Calculate when the next retry should occur, following the fixed step
    /// schedule (§4.F).
    ///
    /// # Arguments
    /// * `attempt_count` - Number of attempts made so far, 1-indexed
    #[must_use]
    pub fn calculate_next_retry(&self, attempt_count: u32) -> SystemTime {
        calculate_next_retry_time(attempt_count)
    }
}

mod defaults {
    pub const fn give_up_send_after_secs() -> u64 {
        72_000 // 20 hours
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.give_up_send_after_secs, 72_000);
    }

    fn secs_ago(secs: u64) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(secs)
    }

    #[test]
    fn test_should_retry_within_deadline() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(secs_ago(0)));
        assert!(policy.should_retry(secs_ago(3600)));
        assert!(policy.should_retry(secs_ago(71_999)));
    }

    #[test]
    fn test_should_not_retry_past_deadline() {
        let policy = RetryPolicy::default();

        assert!(!policy.should_retry(secs_ago(72_001)));
        assert!(!policy.should_retry(secs_ago(1_000_000)));
    }

    #[test]
    fn test_has_expired_matches_should_retry() {
        let policy = RetryPolicy {
            give_up_send_after_secs: 100,
        };

        assert!(!policy.has_expired(secs_ago(99)));
        assert!(policy.has_expired(secs_ago(101)));
        assert_eq!(policy.should_retry(secs_ago(101)), !policy.has_expired(secs_ago(101)));
    }

    #[test]
    #[cfg_attr(miri, ignore = "Calls an unsupported method")]
    fn test_calculate_next_retry() {
        let policy = RetryPolicy::default();

        let now = SystemTime::now();

        let next = policy.calculate_next_retry(1);
        let delay = next
            .duration_since(now)
            .expect("next retry should be in future")
            .as_secs();
        assert_eq!(delay, 60);

        let now = SystemTime::now();
        let next = policy.calculate_next_retry(2);
        let delay = next
            .duration_since(now)
            .expect("next retry should be in future")
            .as_secs();
        assert_eq!(delay, 300);
    }

    #[test]
    fn test_custom_retry_policy() {
        let policy = RetryPolicy {
            give_up_send_after_secs: 100,
        };

        assert!(policy.should_retry(secs_ago(50)));
        assert!(!policy.should_retry(secs_ago(150)));
    }
}
