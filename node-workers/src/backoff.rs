//! Inter-loop delays for looped workers
//!
//! After a successful iteration a worker waits out the rest of a fixed
//! interval. After a failure it waits a base delay, growing exponentially
//! once more than `errors_before_backoff` consecutive errors have occurred,
//! capped at a maximum. Time already spent in the iteration is subtracted
//! in both cases.

use crate::{Error, Result};
use std::time::Duration;

/// Delay policy between worker iterations
#[derive(Debug, Clone, PartialEq)]
pub struct DelayBetweenLoops {
    success_interval: Duration,
    base_delay_after_error: Duration,
    errors_before_backoff: u32,
    rate: f64,
    max_delay_after_error: Duration,
}

impl DelayBetweenLoops {
    /// Exponential backoff after errors.
    ///
    /// Rejects `base_delay_after_error > max_delay_after_error` and rates below 1.
    pub fn exponential(
        success_interval: Duration,
        base_delay_after_error: Duration,
        errors_before_backoff: u32,
        rate: f64,
        max_delay_after_error: Duration,
    ) -> Result<Self> {
        if base_delay_after_error > max_delay_after_error {
            return Err(Error::Config(format!(
                "base error delay {:?} exceeds maximum {:?}",
                base_delay_after_error, max_delay_after_error
            )));
        }
        if !rate.is_finite() || rate < 1.0 {
            return Err(Error::Config(format!(
                "backoff rate must be finite and at least 1, got {}",
                rate
            )));
        }

        Ok(Self {
            success_interval,
            base_delay_after_error,
            errors_before_backoff,
            rate,
            max_delay_after_error,
        })
    }

    /// Remaining part of the success interval
    pub fn delay_after_success(&self, elapsed: Duration) -> Duration {
        self.success_interval.saturating_sub(elapsed)
    }

    /// Delay after `consecutive_errors` failures, minus time already spent
    pub fn delay_after_error(&self, elapsed: Duration, consecutive_errors: u32) -> Duration {
        self.error_delay(consecutive_errors).saturating_sub(elapsed)
    }

    fn error_delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors <= self.errors_before_backoff {
            return self.base_delay_after_error;
        }

        let exponent = (consecutive_errors - self.errors_before_backoff).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay_after_error.as_secs_f64() * self.rate.powi(exponent);
        let max = self.max_delay_after_error.as_secs_f64();

        // Also catches overflow to infinity
        if !(scaled < max) {
            return self.max_delay_after_error;
        }
        Duration::from_secs_f64(scaled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DelayBetweenLoops {
        DelayBetweenLoops::exponential(
            Duration::from_millis(200),
            Duration::from_secs(1),
            1,
            2.0,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[test]
    fn test_delay_after_success() {
        let policy = policy();
        assert_eq!(policy.delay_after_success(Duration::ZERO), Duration::from_millis(200));
        assert_eq!(
            policy.delay_after_success(Duration::from_millis(150)),
            Duration::from_millis(50)
        );
        assert_eq!(policy.delay_after_success(Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn test_delay_after_error() {
        let policy = policy();
        assert_eq!(policy.delay_after_error(Duration::ZERO, 0), Duration::from_secs(1));
        assert_eq!(policy.delay_after_error(Duration::ZERO, 1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_error(Duration::ZERO, 2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_error(Duration::ZERO, 3), Duration::from_secs(4));
        assert_eq!(policy.delay_after_error(Duration::ZERO, 6), Duration::from_secs(30));
        assert_eq!(policy.delay_after_error(Duration::ZERO, u32::MAX), Duration::from_secs(30));
        assert_eq!(
            policy.delay_after_error(Duration::from_millis(500), 2),
            Duration::from_millis(1500)
        );
        assert_eq!(policy.delay_after_error(Duration::from_secs(60), 9), Duration::ZERO);
    }

    #[test]
    fn test_monotonic_and_bounded() {
        let policy = policy();
        let mut previous = Duration::ZERO;
        for errors in 0..200 {
            let delay = policy.delay_after_error(Duration::ZERO, errors);
            assert!(delay >= previous, "delay shrank at {} errors", errors);
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
    }

    #[test]
    fn test_rejects_base_above_max() {
        assert!(DelayBetweenLoops::exponential(
            Duration::ZERO,
            Duration::from_secs(10),
            0,
            2.0,
            Duration::from_secs(5),
        )
        .is_err());
        assert!(DelayBetweenLoops::exponential(
            Duration::ZERO,
            Duration::from_secs(1),
            0,
            0.5,
            Duration::from_secs(5),
        )
        .is_err());
    }
}
