//! Retry policies for fetch attempts.

use std::fmt::Debug;
use std::time::Duration;

/// Decides how many times a fetch is attempted and how long to wait between
/// attempts.
pub trait RetryPolicy: Debug + Send + Sync {
    /// Total number of attempts, including the first. Never less than one.
    fn max_attempts(&self) -> u32;

    /// Delay before attempt `attempt + 1`, where `attempt` counts the
    /// attempts that already failed (starting at 1).
    fn delay_after(&self, attempt: u32) -> Duration;
}

/// The same delay between every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub attempts: u32,
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl RetryPolicy for FixedDelay {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn delay_after(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Doubling delay capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let policy = FixedDelay::new(3, Duration::from_millis(250));
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(2), Duration::from_millis(250));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(FixedDelay::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let policy = ExponentialBackoff {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(40), Duration::from_millis(500));
    }
}
