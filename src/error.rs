//! Error taxonomy for resilient execution.
//!
//! Every `execute` call ends in exactly one terminal outcome:
//!
//! - `Ok(T)`: the operation succeeded (possibly after retries).
//! - [`ResilienceError::Inner`]: the operation failed with an error classified as
//!   non-retryable. It is surfaced on the attempt that produced it.
//! - [`ResilienceError::RetryExhausted`]: every allowed attempt failed with a retryable error.
//! - [`ResilienceError::Cancelled`]: the caller cancelled, or the caller/total deadline passed.
//!   Never dead-lettered.
//! - [`ResilienceError::CircuitOpen`]: the breaker rejected the call before any attempt ran.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient failure: connection refused/reset, timeouts, 429/5xx gateway errors.
    Retryable,
    /// Permanent failure: client errors other than 429, malformed requests.
    NonRetryable,
}

/// Errors that know whether they are worth retrying.
pub trait Classify {
    fn classify(&self) -> ErrorClass;

    fn is_retryable(&self) -> bool {
        self.classify() == ErrorClass::Retryable
    }
}

/// A single attempt ran past its per-attempt deadline.
///
/// Operation error types convert from this via `From<AttemptTimeout>` so attempt timeouts are
/// classified like any other failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("attempt timed out after {limit:?}")]
pub struct AttemptTimeout {
    /// Budget the attempt was given.
    pub limit: Duration,
}

/// Why an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller fired its cancellation token.
    Cancelled,
    /// The caller's deadline or the total retry budget elapsed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Unified terminal error for resilient execution.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker is open; the operation was never invoked.
    CircuitOpen { failure_count: usize, open_duration: Duration },
    /// Execution stopped because of caller cancellation or an expired deadline.
    Cancelled { reason: CancelReason, attempts: usize, elapsed: Duration },
    /// All retry attempts were exhausted.
    RetryExhausted { attempts: usize, elapsed: Duration, failures: Arc<Vec<E>> },
    /// The operation failed with a non-retryable error.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { failure_count, open_duration } => {
                write!(
                    f,
                    "circuit breaker open ({} failures, open for {:?})",
                    failure_count, open_duration
                )
            }
            Self::Cancelled { reason, attempts, elapsed } => {
                write!(f, "operation {} after {} attempts in {:?}", reason, attempts, elapsed)
            }
            Self::RetryExhausted { attempts, elapsed, failures } => {
                if let Some(last) = failures.last() {
                    write!(
                        f,
                        "retry exhausted after {} attempts in {:?}; last error: {}",
                        attempts, elapsed, last
                    )
                } else {
                    write!(
                        f,
                        "retry exhausted after {} attempts in {:?}; no recorded failures",
                        attempts, elapsed
                    )
                }
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` variant keeping only the most recent `MAX_RETRY_FAILURES`.
    pub fn retry_exhausted(attempts: usize, elapsed: Duration, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            let skip = failures.len() - MAX_RETRY_FAILURES;
            failures.into_iter().skip(skip).collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted { attempts, elapsed, failures: Arc::new(trimmed) }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Recorded failures for RetryExhausted, oldest first.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// The underlying error that ended the run: the non-retryable error, or the last failure of
    /// an exhausted run.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => failures.last(),
            _ => None,
        }
    }

    /// Attempts made before the run ended; `None` for `CircuitOpen` and `Inner`.
    pub fn attempts(&self) -> Option<usize> {
        match self {
            Self::Cancelled { attempts, .. } | Self::RetryExhausted { attempts, .. } => {
                Some(*attempts)
            }
            _ => None,
        }
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Cancelled { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Access circuit-open duration if present.
    pub fn circuit_open_duration(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { open_duration, .. } => Some(*open_duration),
            _ => None,
        }
    }
}
