//! Capped exponential backoff.

use std::time::Duration;

use crate::config::ExecutionConfig;

/// Backoff schedule for automatic retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_retries,
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.max_retries,
        )
    }

    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base... capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_doubling() {
        let policy = RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(1), 5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_and_capped(
            base_ms in 1u64..5_000,
            max_ms in 1u64..600_000,
            attempt in 1u32..64,
        ) {
            let policy = RetryPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
                3,
            );
            let delay = policy.delay_for(attempt);
            prop_assert!(delay <= policy.max);
            prop_assert!(delay >= policy.base.min(policy.max));
            prop_assert!(policy.delay_for(attempt + 1) >= delay);
        }
    }
}
