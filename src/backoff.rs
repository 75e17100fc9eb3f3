//! Delay schedules for retrying idempotent downstream calls.
//!
//! Attempt `0` is the initial call and never waits; retries start at attempt `1`. Arithmetic
//! saturates at [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use tollgate::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(50))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(50));
//! assert_eq!(backoff.delay(3), Duration::from_millis(200));
//! assert_eq!(backoff.delay(9), Duration::from_secs(1));
//! ```

use std::time::Duration;

/// Upper bound on any computed delay. Far longer than any request deadline.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackoffError {
    #[error("with_max is only valid for exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Constant(Duration),
    Exponential { base: Duration, max: Option<Duration> },
}

/// Delay schedule; cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    schedule: Schedule,
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Self { schedule: Schedule::Constant(delay) }
    }

    /// `base`, `2*base`, `4*base`, ...
    pub fn exponential(base: Duration) -> Self {
        Self { schedule: Schedule::Exponential { base, max: None } }
    }

    /// Cap an exponential schedule. Errors for constant schedules, a zero cap, or `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.schedule {
            Schedule::Exponential { base, max: existing } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            Schedule::Constant(_) => Err(BackoffError::ConstantDoesNotSupportMax),
        }
    }

    /// Delay before `attempt` (0 = initial call, no delay).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.schedule {
            Schedule::Constant(delay) => delay,
            Schedule::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let nanos = base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map_or(delay, |cap| delay.min(cap))
            }
        };
        raw.min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_attempt() {
        let backoff = Backoff::constant(Duration::from_millis(80));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_millis(80));
        assert_eq!(backoff.delay(40), Duration::from_millis(80));
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let backoff =
            Backoff::exponential(Duration::from_millis(50)).with_max(Duration::from_secs(1)).unwrap();
        let delays: Vec<u128> = (1..=6).map(|a| backoff.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![50, 100, 200, 400, 800, 1000]);
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validation() {
        assert_eq!(
            Backoff::constant(Duration::from_millis(1)).with_max(Duration::from_secs(1)),
            Err(BackoffError::ConstantDoesNotSupportMax)
        );
        assert_eq!(
            Backoff::exponential(Duration::from_millis(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }
}
