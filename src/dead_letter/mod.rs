//! Durable record of operations that exhausted their retries.
//!
//! [`DeadLetterStore`] holds the query logic; persistence goes through a [`DeadLetterBackend`],
//! a key-value store with per-key TTLs plus an ordered score index. [`MemoryBackend`] is the
//! embedded implementation; any store offering the same capabilities can be substituted.

mod backend;
mod store;

pub use backend::{BackendError, DeadLetterBackend, MemoryBackend, Order};
pub use store::{
    DeadLetterConfig, DeadLetterError, DeadLetterStats, DeadLetterStore, FailedOperation, DEFAULT_TTL,
};
