//! Reconnect policy for the broker connection.
//!
//! The delay before reconnect attempt `n` (1-based) is
//! `base × 2^(n-1)`, clamped to `max_delay`. Once `max_attempts` retries
//! have failed the client stops retrying until the host calls `connect()`.

use std::time::Duration;

/// Bounded exponential backoff for broker reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Number of retries before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry `attempt`, or `None` once the ceiling is exceeded.
    ///
    /// `attempt` is 1-based; `0` is treated as `1`.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn test_delay_sequence_doubles() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_no_delay_past_ceiling() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay(6).is_none());
        assert!(policy.delay(u32::MAX).is_none());
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        };
        assert_eq!(policy.delay(2), Some(Duration::from_secs(20)));
        assert_eq!(policy.delay(3), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(10), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_huge_exponent_does_not_overflow() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(u64::MAX / 2),
            max_delay: Duration::from_secs(60),
            max_attempts: 40,
        };
        assert_eq!(policy.delay(40), Some(Duration::from_secs(60)));
    }
}
