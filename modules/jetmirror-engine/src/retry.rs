use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`, plus up to
/// a quarter of that again as random jitter so retries from many workers
/// don't land on the store in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// No waiting between attempts. Tests only need the attempt count.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0 = first retry).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() / 4) as u64;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1))
            .without_jitter();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(200), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::new(10, Duration::from_millis(400), Duration::from_secs(10));
        for _ in 0..100 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(500));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
