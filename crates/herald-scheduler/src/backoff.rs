use std::time::Duration;

use herald_core::config::{
    DeliveryConfig, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_MAX_SECS, DEFAULT_MAX_ATTEMPTS,
};

/// Retry budget and exponential backoff for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delivery attempts before a job settles in `Failed`.
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &DeliveryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base: Duration::from_secs(cfg.backoff_base_secs),
            max_delay: Duration::from_secs(cfg.backoff_max_secs),
        }
    }

    /// Delay before retrying after the `attempt`-th failure:
    /// `min(base * 2^attempt, max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            max_delay: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(30));
        assert_eq!(policy.delay(1), Duration::from_secs(60));
        assert_eq!(policy.delay(2), Duration::from_secs(120));
        assert_eq!(policy.delay(7), Duration::from_secs(3600));
        assert_eq!(policy.delay(40), Duration::from_secs(3600));
    }

    #[test]
    fn zero_attempts_in_config_still_allows_one() {
        let cfg = DeliveryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from_config(&cfg).max_attempts, 1);
    }
}
