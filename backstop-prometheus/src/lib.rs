//! Prometheus recorder for `backstop`.
//! Bring your own `prometheus::Registry`; counters and histograms are registered on construction.

use backstop::{MetricsRecorder, OperationStatus, RetryReason};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

const BACKOFF_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const DURATION_BUCKETS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

#[derive(Clone, Debug)]
pub struct PrometheusRecorder {
    registry: Arc<Registry>,
    retries: IntCounterVec,
    operations: IntCounterVec,
    dead_letters: IntCounterVec,
    backoff: HistogramVec,
    duration: HistogramVec,
}

impl PrometheusRecorder {
    /// Create a recorder and register its metrics into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let retries = IntCounterVec::new(
            Opts::new("backstop_retry_attempts_total", "Retry decisions by reason"),
            &["operation", "reason"],
        )?;
        let operations = IntCounterVec::new(
            Opts::new("backstop_operations_total", "Completed operations by status"),
            &["operation", "status"],
        )?;
        let dead_letters = IntCounterVec::new(
            Opts::new("backstop_dead_letters_total", "Operations written to the dead letter store"),
            &["operation"],
        )?;
        let backoff = HistogramVec::new(
            HistogramOpts::new("backstop_backoff_delay_seconds", "Delay slept before a retry")
                .buckets(BACKOFF_BUCKETS.to_vec()),
            &["operation"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("backstop_operation_duration_seconds", "End-to-end operation latency")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )?;

        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(operations.clone()))?;
        registry.register(Box::new(dead_letters.clone()))?;
        registry.register(Box::new(backoff.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self { registry, retries, operations, dead_letters, backoff, duration })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registry contents in the text exposition format.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn inc(vec: &IntCounterVec, labels: &[&str]) {
    match vec.get_metric_with_label_values(labels) {
        Ok(counter) => counter.inc(),
        Err(e) => tracing::debug!(error = %e, "dropping metric sample"),
    }
}

fn observe(vec: &HistogramVec, operation: &str, value: Duration) {
    match vec.get_metric_with_label_values(&[operation]) {
        Ok(histogram) => histogram.observe(value.as_secs_f64()),
        Err(e) => tracing::debug!(error = %e, "dropping metric sample"),
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn record_retry_attempt(&self, operation: &str, reason: RetryReason) {
        inc(&self.retries, &[operation, reason.as_str()]);
    }

    fn record_operation(&self, operation: &str, status: OperationStatus, duration: Duration) {
        inc(&self.operations, &[operation, status.as_str()]);
        observe(&self.duration, operation, duration);
    }

    fn record_backoff(&self, operation: &str, delay: Duration) {
        observe(&self.backoff, operation, delay);
    }

    fn record_dead_letter(&self, operation: &str) {
        inc(&self.dead_letters, &[operation]);
    }
}
