//! Convenient re-exports for common backstop types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState},
    config::{ConfigError, ResilienceConfig},
    dead_letter::{DeadLetterConfig, DeadLetterStore, FailedOperation, MemoryBackend},
    error::{CancelReason, Classify, ErrorClass, ResilienceError},
    executor::{Operation, ResilientExecutor},
    jitter::Jitter,
    metrics::{MemoryRecorder, MetricsRecorder, NoopRecorder, OperationStatus, RetryReason},
    retry::{Attempt, BuildError, CallContext, RetryExecutor},
    transport::{ResilientTransport, ToolRequest, ToolResponse, Transport, TransportError},
};
