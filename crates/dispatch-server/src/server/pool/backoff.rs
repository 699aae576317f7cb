//! Redial delays for backends that could not be reached.
//!
//! The delay for consecutive failure `n` (0-indexed) is `first × factor^n`,
//! clamped to `max`. Each delay is derived from the failure count alone.

use core::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub first: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Multiplicative growth per failure.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub const fn new(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Delay before retrying after `attempt` previous consecutive failures.
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_from_first() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(policy.next(0), Duration::from_millis(500));
        assert_eq!(policy.next(1), Duration::from_secs(1));
        assert_eq!(policy.next(2), Duration::from_secs(2));
        assert_eq!(policy.next(3), Duration::from_secs(4));
    }

    #[test]
    fn clamps_to_max() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(policy.next(3), Duration::from_secs(3));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn unit_factor_is_constant() {
        let policy = BackoffPolicy {
            factor: 1.0,
            ..BackoffPolicy::default()
        };
        for attempt in 0..8 {
            assert_eq!(policy.next(attempt), Duration::from_millis(500));
        }
    }
}
