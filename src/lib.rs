#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # backstop
//!
//! Resilience layer for calls from an application to a remote tool backend.
//!
//! ## Features
//!
//! - **Circuit breaker** per backend with closed, open, and half-open states
//! - **Retry executor** with exponential backoff, proportional jitter, error classification,
//!   per-attempt and total time budgets, and prompt cancellation
//! - **Dead letter store** for operations that exhausted their retries, queryable by recency,
//!   operation kind, and client, over any key-value backend with an ordered index
//! - **Metrics** via a pluggable recorder (in-memory, tracing, or Prometheus in
//!   `backstop-prometheus`)
//! - **Resilient transport** wrapping a tool backend client, usable as a tower `Service`
//!
//! ## Quick Start
//!
//! ```rust
//! use backstop::prelude::*;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let recorder = Arc::new(MemoryRecorder::new());
//! let store = DeadLetterStore::new(Arc::new(MemoryBackend::new()), DeadLetterConfig::default());
//! let executor = ResilientExecutor::<TransportError>::from_config(
//!     &ResilienceConfig::default(),
//!     recorder.clone(),
//! )
//! .unwrap()
//! .with_dead_letters(store);
//!
//! let op = Operation::new("list_tools", "client-1");
//! let tools = executor
//!     .execute(&CallContext::new(), &op, |_attempt| async {
//!         Ok::<_, TransportError>(vec!["search", "fetch"])
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(tools.len(), 2);
//! assert_eq!(recorder.snapshot().operation_count("list_tools", OperationStatus::Success), 1);
//! # });
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod executor;
pub mod jitter;
pub mod metrics;
pub mod prelude;
pub mod retry;
pub mod sleeper;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats,
    CircuitOpen, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{ConfigError, ResilienceConfig};
pub use dead_letter::{
    BackendError, DeadLetterBackend, DeadLetterConfig, DeadLetterError, DeadLetterStats,
    DeadLetterStore, FailedOperation, MemoryBackend,
};
pub use error::{AttemptTimeout, CancelReason, Classify, ErrorClass, ResilienceError};
pub use executor::{Operation, ResilientExecutor};
pub use jitter::Jitter;
pub use metrics::{
    HistogramSummary, LogRecorder, MemoryRecorder, MetricsRecorder, MetricsSnapshot,
    MulticastRecorder, NoopRecorder, OperationStatus, RetryReason,
};
pub use retry::{Attempt, BuildError, CallContext, RetryExecutor, RetryExecutorBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{
    ReplayError, ResilientTransport, ToolCall, ToolRequest, ToolResponse, Transport, TransportError,
};
