//! Jitter strategies to prevent synchronized retry storms.
//!
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Proportional`: uniform perturbation in `[-percent, +percent] * delay`. A `percent` of `0.10`
//!   spreads a 1s delay across `[900ms, 1100ms]`.
//!
//! RNG: `apply` uses `rand`'s thread-local RNG; executors hold a seeded `StdRng` and call
//! `apply_with_rng` so runs can be reproduced.
//!
//! Example:
//! ```rust
//! use backstop::Jitter;
//! use rand::{rngs::StdRng, SeedableRng};
//! use std::time::Duration;
//!
//! let jitter = Jitter::proportional(0.10).unwrap();
//! let mut rng = StdRng::seed_from_u64(7);
//! let d = jitter.apply_with_rng(Duration::from_secs(1), &mut rng);
//! assert!(d >= Duration::from_millis(900) && d <= Duration::from_millis(1100));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    None,
    /// Uniform jitter within `±percent` of the delay
    Proportional {
        /// Fraction of the delay, in `[0.0, 1.0)`
        percent: f64,
    },
}

impl Jitter {
    /// Create a proportional jitter strategy; `percent` must lie in `[0.0, 1.0)`.
    pub fn proportional(percent: f64) -> Result<Self, &'static str> {
        if !percent.is_finite() || !(0.0..1.0).contains(&percent) {
            return Err("proportional jitter: percent must be within [0.0, 1.0)");
        }
        Ok(Jitter::Proportional { percent })
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_with_rng(delay, &mut rng)
    }

    /// Apply jitter with a caller-provided RNG.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match *self {
            Jitter::None => delay,
            Jitter::Proportional { percent } => {
                if percent == 0.0 || delay.is_zero() {
                    return delay;
                }
                let offset = rng.random_range(-percent..=percent);
                let nanos = delay.as_nanos() as f64 * (1.0 + offset);
                if nanos.is_finite() && nanos < u64::MAX as f64 {
                    Duration::from_nanos(nanos.max(0.0).round() as u64)
                } else {
                    Duration::from_nanos(u64::MAX)
                }
            }
        }
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::Proportional { percent: 0.10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_jitter_returns_exact_delay() {
        let jitter = Jitter::None;
        let delay = Duration::from_secs(1);
        assert_eq!(jitter.apply(delay), delay);
    }

    #[test]
    fn proportional_jitter_stays_within_band() {
        let jitter = Jitter::proportional(0.10).unwrap();
        let delay = Duration::from_secs(1);

        for _ in 0..500 {
            let jittered = jitter.apply(delay);
            assert!(jittered >= Duration::from_millis(900), "{jittered:?} below band");
            assert!(jittered <= Duration::from_millis(1100), "{jittered:?} above band");
        }
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let jitter = Jitter::proportional(0.25).unwrap();
        let delay = Duration::from_millis(400);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);

        for _ in 0..16 {
            assert_eq!(jitter.apply_with_rng(delay, &mut a), jitter.apply_with_rng(delay, &mut b));
        }
    }

    #[test]
    fn jitter_actually_varies() {
        let jitter = Jitter::proportional(0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(9);
        let samples: Vec<_> =
            (0..32).map(|_| jitter.apply_with_rng(Duration::from_secs(1), &mut rng)).collect();
        assert!(samples.iter().any(|d| *d != samples[0]));
    }

    #[test]
    fn zero_percent_is_identity() {
        let jitter = Jitter::proportional(0.0).unwrap();
        assert_eq!(jitter.apply(Duration::from_millis(123)), Duration::from_millis(123));
    }

    #[test]
    fn jitter_handles_zero_delay() {
        let jitter = Jitter::proportional(0.5).unwrap();
        assert_eq!(jitter.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn constructor_rejects_out_of_range_percent() {
        for bad in [-0.1, 1.0, 2.0, f64::NAN] {
            let err = Jitter::proportional(bad).expect_err("percent should be rejected");
            assert_eq!(err, "proportional jitter: percent must be within [0.0, 1.0)");
        }
    }

    #[test]
    fn saturates_large_durations_without_panicking() {
        let huge = Duration::from_secs(u64::MAX);
        let jitter = Jitter::proportional(0.9).unwrap();
        let mut rng = StdRng::seed_from_u64(999);
        let _ = jitter.apply_with_rng(huge, &mut rng);
    }
}
