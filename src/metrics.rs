//! Best-effort metrics for resilient execution.
//!
//! The retry executor and the resilient executor report every transition to a
//! [`MetricsRecorder`]. Recorders aggregate in-process and never fail: a recorder that cannot
//! record a value drops it.
//!
//! Signals:
//! - retry attempts, labelled by operation and [`RetryReason`]
//! - operation outcomes, labelled by operation and [`OperationStatus`]
//! - backoff delay and operation duration histograms, labelled by operation
//! - dead-letter insertions, labelled by operation
//!
//! Implementations shipped here: [`NoopRecorder`], [`LogRecorder`], [`MemoryRecorder`], and
//! [`MulticastRecorder`] to feed two recorders at once. A Prometheus-backed recorder lives in the
//! `backstop-prometheus` crate.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why an attempt was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetryReason {
    /// The attempt failed with a retryable error.
    Retryable,
    /// The attempt failed with a non-retryable error.
    NonRetryable,
    /// The attempt succeeded after at least one earlier failure.
    SuccessAfterRetry,
    /// The run was cancelled or its deadline passed.
    Cancelled,
    /// The final allowed attempt failed.
    Exhausted,
}

impl RetryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryReason::Retryable => "retryable",
            RetryReason::NonRetryable => "non_retryable",
            RetryReason::SuccessAfterRetry => "success_after_retry",
            RetryReason::Cancelled => "cancelled",
            RetryReason::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of one `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationStatus {
    Success,
    /// The backend gave a verdict: retries exhausted or a non-retryable error.
    Failure,
    /// No verdict: circuit open or cancelled.
    Error,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Failure => "failure",
            OperationStatus::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for resilience metrics. Implementations must not block or panic.
pub trait MetricsRecorder: Send + Sync + fmt::Debug {
    fn record_retry_attempt(&self, operation: &str, reason: RetryReason);

    fn record_operation(&self, operation: &str, status: OperationStatus, duration: Duration);

    fn record_backoff(&self, operation: &str, delay: Duration);

    fn record_dead_letter(&self, operation: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_retry_attempt(&self, _operation: &str, _reason: RetryReason) {}

    fn record_operation(&self, _operation: &str, _status: OperationStatus, _duration: Duration) {}

    fn record_backoff(&self, _operation: &str, _delay: Duration) {}

    fn record_dead_letter(&self, _operation: &str) {}
}

/// Emits every signal as a `tracing` event at TRACE level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl MetricsRecorder for LogRecorder {
    fn record_retry_attempt(&self, operation: &str, reason: RetryReason) {
        tracing::trace!(operation, reason = %reason, "retry_attempt");
    }

    fn record_operation(&self, operation: &str, status: OperationStatus, duration: Duration) {
        tracing::trace!(operation, status = %status, duration_ms = duration.as_millis() as u64, "operation");
    }

    fn record_backoff(&self, operation: &str, delay: Duration) {
        tracing::trace!(operation, delay_ms = delay.as_millis() as u64, "backoff");
    }

    fn record_dead_letter(&self, operation: &str) {
        tracing::trace!(operation, "dead_letter");
    }
}

/// Forwards every signal to two recorders.
#[derive(Debug, Clone)]
pub struct MulticastRecorder<A, B> {
    a: A,
    b: B,
}

impl<A, B> MulticastRecorder<A, B> {
    pub fn new(a: A, b: B) -> Self {
        Self { a, b }
    }
}

impl<A: MetricsRecorder, B: MetricsRecorder> MetricsRecorder for MulticastRecorder<A, B> {
    fn record_retry_attempt(&self, operation: &str, reason: RetryReason) {
        self.a.record_retry_attempt(operation, reason);
        self.b.record_retry_attempt(operation, reason);
    }

    fn record_operation(&self, operation: &str, status: OperationStatus, duration: Duration) {
        self.a.record_operation(operation, status, duration);
        self.b.record_operation(operation, status, duration);
    }

    fn record_backoff(&self, operation: &str, delay: Duration) {
        self.a.record_backoff(operation, delay);
        self.b.record_backoff(operation, delay);
    }

    fn record_dead_letter(&self, operation: &str) {
        self.a.record_dead_letter(operation);
        self.b.record_dead_letter(operation);
    }
}

impl<R: MetricsRecorder + ?Sized> MetricsRecorder for Arc<R> {
    fn record_retry_attempt(&self, operation: &str, reason: RetryReason) {
        (**self).record_retry_attempt(operation, reason);
    }

    fn record_operation(&self, operation: &str, status: OperationStatus, duration: Duration) {
        (**self).record_operation(operation, status, duration);
    }

    fn record_backoff(&self, operation: &str, delay: Duration) {
        (**self).record_backoff(operation, delay);
    }

    fn record_dead_letter(&self, operation: &str) {
        (**self).record_dead_letter(operation);
    }
}

/// Summary of a latency histogram. Values are recorded at microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p99: Duration,
}

impl HistogramSummary {
    fn from_histogram(h: &Histogram<u64>) -> Self {
        Self {
            count: h.len(),
            min: Duration::from_micros(h.min()),
            max: Duration::from_micros(h.max()),
            mean: Duration::from_micros(h.mean().round() as u64),
            p50: Duration::from_micros(h.value_at_quantile(0.50)),
            p99: Duration::from_micros(h.value_at_quantile(0.99)),
        }
    }
}

/// Point-in-time copy of everything a [`MemoryRecorder`] has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub retry_attempts: BTreeMap<(String, RetryReason), u64>,
    pub operations: BTreeMap<(String, OperationStatus), u64>,
    pub dead_letters: BTreeMap<String, u64>,
    pub backoff: BTreeMap<String, HistogramSummary>,
    pub durations: BTreeMap<String, HistogramSummary>,
}

impl MetricsSnapshot {
    pub fn retry_count(&self, operation: &str, reason: RetryReason) -> u64 {
        self.retry_attempts.get(&(operation.to_string(), reason)).copied().unwrap_or(0)
    }

    pub fn operation_count(&self, operation: &str, status: OperationStatus) -> u64 {
        self.operations.get(&(operation.to_string(), status)).copied().unwrap_or(0)
    }

    pub fn dead_letter_count(&self, operation: &str) -> u64 {
        self.dead_letters.get(operation).copied().unwrap_or(0)
    }

    /// Number of backoff sleeps recorded for `operation`.
    pub fn backoff_count(&self, operation: &str) -> u64 {
        self.backoff.get(operation).map_or(0, |s| s.count)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    retry_attempts: BTreeMap<(String, RetryReason), u64>,
    operations: BTreeMap<(String, OperationStatus), u64>,
    dead_letters: BTreeMap<String, u64>,
    backoff: BTreeMap<String, Histogram<u64>>,
    durations: BTreeMap<String, Histogram<u64>>,
}

fn record_micros(map: &mut BTreeMap<String, Histogram<u64>>, operation: &str, value: Duration) {
    let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);
    if let Some(h) = map.get_mut(operation) {
        h.saturating_record(micros);
        return;
    }
    // Auto-resizing histogram with 3 significant digits.
    if let Ok(mut h) = Histogram::<u64>::new(3) {
        h.saturating_record(micros);
        map.insert(operation.to_string(), h);
    }
}

/// In-process recorder keeping counters and HDR histograms. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        MetricsSnapshot {
            retry_attempts: state.retry_attempts.clone(),
            operations: state.operations.clone(),
            dead_letters: state.dead_letters.clone(),
            backoff: state
                .backoff
                .iter()
                .map(|(k, h)| (k.clone(), HistogramSummary::from_histogram(h)))
                .collect(),
            durations: state
                .durations
                .iter()
                .map(|(k, h)| (k.clone(), HistogramSummary::from_histogram(h)))
                .collect(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = MemoryState::default();
    }
}

impl MetricsRecorder for MemoryRecorder {
    fn record_retry_attempt(&self, operation: &str, reason: RetryReason) {
        *self.state.lock().retry_attempts.entry((operation.to_string(), reason)).or_insert(0) += 1;
    }

    fn record_operation(&self, operation: &str, status: OperationStatus, duration: Duration) {
        let mut state = self.state.lock();
        *state.operations.entry((operation.to_string(), status)).or_insert(0) += 1;
        record_micros(&mut state.durations, operation, duration);
    }

    fn record_backoff(&self, operation: &str, delay: Duration) {
        record_micros(&mut self.state.lock().backoff, operation, delay);
    }

    fn record_dead_letter(&self, operation: &str) {
        *self.state.lock().dead_letters.entry(operation.to_string()).or_insert(0) += 1;
    }
}
