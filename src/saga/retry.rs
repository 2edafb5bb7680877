use std::time::Duration;

use rand::Rng;

/// Exponential backoff for failed saga steps
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, without jitter. `attempt` starts at 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms);
        Duration::from_millis(delay)
    }

    /// Backoff plus up to 25% random jitter so a burst of failures does not retry in lockstep
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let spread = base.as_millis() as u64 / 4;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_ms: 1_000,
            max_ms: 60_000,
            max_attempts: 5,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(200), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = policy();
        for _ in 0..50 {
            let delay = policy.next_delay(3);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_budget() {
        let policy = policy();
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }
}
