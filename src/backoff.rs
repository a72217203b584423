//! Backoff schedule for the retry executor.
//!
//! The schedule is a pure function of the retry index. Retry `0` is the sleep that follows the
//! first failed attempt, so the raw schedule is `initial * multiplier^retry`, clamped into
//! `[initial, max]`. Jitter is applied on top of this value by [`crate::Jitter`] and the result is
//! clamped again by the executor.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use backstop::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(2), 2.0)
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay(1), Duration::from_millis(200));
//! assert_eq!(backoff.delay(2), Duration::from_millis(400));
//! assert_eq!(backoff.delay(9), Duration::from_secs(2)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to `max`, which itself may not
//! exceed `MAX_BACKOFF` (1 day).

use std::fmt;
use std::time::Duration;

/// Upper bound for any configured delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    InitialMustBePositive,
    MaxLessThanInitial { initial: Duration, max: Duration },
    MaxTooLarge(Duration),
    InvalidMultiplier(f64),
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::InitialMustBePositive => write!(f, "initial delay must be greater than zero"),
            BackoffError::MaxLessThanInitial { initial, max } => {
                write!(f, "max ({:?}) must be >= initial ({:?})", max, initial)
            }
            BackoffError::MaxTooLarge(max) => {
                write!(f, "max ({:?}) must not exceed {:?}", max, MAX_BACKOFF)
            }
            BackoffError::InvalidMultiplier(m) => {
                write!(f, "multiplier must be finite and >= 1.0 (got {})", m)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Exponential backoff bounded below by `initial` and above by `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    /// Create an exponential schedule, validating the bounds and multiplier.
    pub fn exponential(
        initial: Duration,
        max: Duration,
        multiplier: f64,
    ) -> Result<Self, BackoffError> {
        if initial.is_zero() {
            return Err(BackoffError::InitialMustBePositive);
        }
        if max < initial {
            return Err(BackoffError::MaxLessThanInitial { initial, max });
        }
        if max > MAX_BACKOFF {
            return Err(BackoffError::MaxTooLarge(max));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        Ok(Self { initial, max, multiplier })
    }

    /// Lower bound of every delay.
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Upper bound of every delay.
    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Un-jittered delay for the given retry index (0 = first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let raw_nanos = self.initial.as_nanos() as f64 * factor;
        // NaN and infinity both land on the cap.
        let delay = if raw_nanos.is_finite() && raw_nanos < self.max.as_nanos() as f64 {
            Duration::from_nanos(raw_nanos.round() as u64)
        } else {
            self.max
        };
        self.clamp(delay)
    }

    /// Clamp an arbitrary delay into `[initial, max]`.
    pub fn clamp(&self, delay: Duration) -> Duration {
        delay.clamp(self.initial, self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_millis(100), max: Duration::from_secs(30), multiplier: 2.0 }
    }
}
