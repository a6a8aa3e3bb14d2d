//! Exponential backoff shared by pollers and replication retries.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound on any single delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(50),
            max: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, used where deterministic timing matters.
    pub fn without_jitter(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Delay for the given attempt number (0-based), never above `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let final_delay = (delay + jitter).clamp(0.0, self.max.as_millis() as f64);
        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = BackoffPolicy::without_jitter(Duration::from_millis(10), Duration::from_secs(10));

        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
            jitter: 0.5,
        };

        for attempt in 0..64 {
            assert!(policy.delay(attempt) <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.25,
        };

        for _ in 0..100 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_millis(75));
            assert!(d <= Duration::from_millis(125));
        }
    }
}
