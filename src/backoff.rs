//! Retry backoff strategies.
//!
//! A strategy maps a 1-based attempt number (attempt 1 is the first retry)
//! to the delay before that attempt may run. Both strategies are capped at
//! one hour.
//!
//! # Example
//!
//! ```
//! # use duroq::backoff::BackoffStrategy;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));
//!
//! assert_eq!(strategy.delay(1), TimeDelta::seconds(1));
//! assert_eq!(strategy.delay(2), TimeDelta::seconds(2));
//! assert_eq!(strategy.delay(3), TimeDelta::seconds(4));
//! assert_eq!(strategy.delay(13), TimeDelta::hours(1));
//! ```

use chrono::{DateTime, TimeDelta, Utc};

/// Ceiling applied to every computed delay, in milliseconds (one hour).
pub const MAX_BACKOFF_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Exponential,
    Fixed,
}

/// A backoff calculator: exponential (`base · 2^(attempt−1)`) or fixed
/// (always `base`), capped at [`MAX_BACKOFF_MS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStrategy {
    kind: Kind,
    base: TimeDelta,
}

impl BackoffStrategy {
    /// Doubles the delay with each attempt.
    ///
    /// # Example
    ///
    /// ```
    /// # use duroq::backoff::BackoffStrategy;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(500));
    ///
    /// assert_eq!(strategy.delay(1), TimeDelta::milliseconds(500));
    /// assert_eq!(strategy.delay(2), TimeDelta::milliseconds(1000));
    /// assert_eq!(strategy.delay(4), TimeDelta::milliseconds(4000));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self {
            kind: Kind::Exponential,
            base,
        }
    }

    /// Always returns the base delay.
    ///
    /// # Example
    ///
    /// ```
    /// # use duroq::backoff::BackoffStrategy;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::fixed(TimeDelta::seconds(10));
    ///
    /// assert_eq!(strategy.delay(1), TimeDelta::seconds(10));
    /// assert_eq!(strategy.delay(9), TimeDelta::seconds(10));
    /// ```
    pub const fn fixed(base: TimeDelta) -> Self {
        Self {
            kind: Kind::Fixed,
            base,
        }
    }

    /// The delay before the given attempt. `attempt` is 1-based; values
    /// below 1 are treated as 1.
    pub fn delay(&self, attempt: u32) -> TimeDelta {
        let attempt = attempt.max(1);
        let millis = match self.kind {
            Kind::Fixed => self.base.num_milliseconds(),
            Kind::Exponential => {
                // The factor saturates well past the one hour cap; clamping
                // the shift keeps it positive.
                let factor = 1i64 << (attempt - 1).min(62);
                self.base.num_milliseconds().saturating_mul(factor)
            }
        };
        TimeDelta::milliseconds(millis.min(MAX_BACKOFF_MS))
    }

    /// The earliest instant at which the given attempt may run.
    pub fn next_run_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.delay(attempt)
    }
}

impl Default for BackoffStrategy {
    /// Exponential with a one second base.
    fn default() -> Self {
        Self::exponential(TimeDelta::seconds(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff() {
        let strategy = BackoffStrategy::fixed(TimeDelta::seconds(2));

        for attempt in 1..100 {
            assert_eq!(strategy.delay(attempt), TimeDelta::seconds(2));
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));

        for attempt in 1..=12 {
            assert_eq!(
                strategy.delay(attempt),
                TimeDelta::seconds(1 << (attempt - 1))
            );
        }
    }

    #[test]
    fn exponential_backoff_caps_at_one_hour() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));

        // 2^12 seconds is already above the cap.
        assert_eq!(strategy.delay(13), TimeDelta::milliseconds(MAX_BACKOFF_MS));
        assert_eq!(strategy.delay(64), TimeDelta::milliseconds(MAX_BACKOFF_MS));
        assert_eq!(strategy.delay(200), TimeDelta::milliseconds(MAX_BACKOFF_MS));
    }

    #[test]
    fn fixed_backoff_caps_at_one_hour() {
        let strategy = BackoffStrategy::fixed(TimeDelta::hours(5));
        assert_eq!(strategy.delay(1), TimeDelta::milliseconds(MAX_BACKOFF_MS));
    }

    #[test]
    fn attempt_zero_is_treated_as_first_retry() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));
        assert_eq!(strategy.delay(0), strategy.delay(1));
    }

    #[test]
    fn next_run_at_offsets_from_now() {
        let now = Utc::now();
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1));
        assert_eq!(strategy.next_run_at(3, now), now + TimeDelta::seconds(4));
    }
}
