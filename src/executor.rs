//! Composition root: circuit breaker around the retry executor around the caller's operation.
//!
//! Flow for one [`ResilientExecutor::execute`] call:
//! 1. The breaker gates the call. A rejection returns `CircuitOpen` without running anything.
//! 2. The retry executor drives the attempts.
//! 3. The terminal outcome is reported to the breaker:
//!    success and non-retryable errors count as successes (the backend answered), exhaustion
//!    counts as a failure, cancellation releases the admission without a verdict.
//! 4. Exhaustion writes a [`FailedOperation`] to the dead letter store. A store failure is
//!    logged and does not change the returned error.
//! 5. The outcome and duration are recorded on the metrics recorder.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{ConfigError, ResilienceConfig};
use crate::dead_letter::{DeadLetterStore, FailedOperation};
use crate::error::{AttemptTimeout, Classify};
use crate::metrics::{MetricsRecorder, OperationStatus};
use crate::retry::{Attempt, CallContext, RetryExecutor, RetryExecutorBuilder};
use crate::ResilienceError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// Identifies one protected call.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: String,
    pub client_id: String,
    pub endpoint: String,
    pub payload: serde_json::Value,
    /// Unix millis; defaults to the time `execute` starts.
    pub created_at: Option<u64>,
    /// Existing dead-letter record to update instead of creating a new one.
    pub dead_letter_id: Option<String>,
}

impl Operation {
    pub fn new(kind: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            client_id: client_id.into(),
            endpoint: String::new(),
            payload: serde_json::Value::Null,
            created_at: None,
            dead_letter_id: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_created_at(mut self, unix_millis: u64) -> Self {
        self.created_at = Some(unix_millis);
        self
    }

    pub fn with_dead_letter_id(mut self, id: impl Into<String>) -> Self {
        self.dead_letter_id = Some(id.into());
        self
    }
}

/// Circuit breaker, retry executor, dead letter store, and metrics wired together.
pub struct ResilientExecutor<E> {
    retry: RetryExecutor<E>,
    breaker: CircuitBreaker,
    dead_letters: Option<DeadLetterStore>,
    recorder: Arc<dyn MetricsRecorder>,
}

impl<E> Clone for ResilientExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            retry: self.retry.clone(),
            breaker: self.breaker.clone(),
            dead_letters: self.dead_letters.clone(),
            recorder: self.recorder.clone(),
        }
    }
}

impl<E> fmt::Debug for ResilientExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("retry", &self.retry)
            .field("breaker", &self.breaker)
            .field("dead_letters", &self.dead_letters)
            .finish()
    }
}

impl<E> ResilientExecutor<E>
where
    E: std::error::Error + Classify + From<AttemptTimeout> + Send + Sync + 'static,
{
    /// Metrics go to the retry executor's recorder.
    pub fn new(retry: RetryExecutor<E>, breaker: CircuitBreaker) -> Self {
        let recorder = retry.recorder().clone();
        Self { retry, breaker, dead_letters: None, recorder }
    }

    /// Retry executor and breaker built from `config`, reporting to `recorder`.
    pub fn from_config(
        config: &ResilienceConfig,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Result<Self, ConfigError> {
        let retry = RetryExecutorBuilder::from_config(config)?.with_recorder(recorder).build()?;
        let breaker = CircuitBreaker::new(config.circuit_breaker()?)?;
        Ok(Self::new(retry, breaker))
    }

    pub fn with_dead_letters(mut self, store: DeadLetterStore) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry(&self) -> &RetryExecutor<E> {
        &self.retry
    }

    pub fn dead_letters(&self) -> Option<&DeadLetterStore> {
        self.dead_letters.as_ref()
    }

    /// Run `f` under breaker and retry protection. `f` may run several times and must be
    /// idempotent.
    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &CallContext,
        operation: &Operation,
        f: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let kind = operation.kind.as_str();
        let created_at =
            operation.created_at.or_else(|| self.dead_letters.as_ref().map(DeadLetterStore::now_millis));

        let permit = match self.breaker.acquire() {
            Ok(permit) => permit,
            Err(open) => {
                tracing::debug!(
                    operation = kind,
                    client_id = %operation.client_id,
                    breaker = self.breaker.name(),
                    "rejected by open circuit"
                );
                self.recorder.record_operation(kind, OperationStatus::Error, started.elapsed());
                return Err(open.into());
            }
        };

        let result = self.retry.execute(ctx, kind, f).await;

        let status = match &result {
            Ok(_) => {
                permit.success();
                OperationStatus::Success
            }
            Err(ResilienceError::Inner(_)) => {
                permit.success();
                OperationStatus::Failure
            }
            Err(ResilienceError::RetryExhausted { .. }) => {
                permit.failure();
                OperationStatus::Failure
            }
            Err(_) => {
                drop(permit);
                OperationStatus::Error
            }
        };

        if let Err(err @ ResilienceError::RetryExhausted { .. }) = &result {
            self.dead_letter(operation, created_at, err).await;
        }

        self.recorder.record_operation(kind, status, started.elapsed());
        result
    }

    async fn dead_letter(&self, operation: &Operation, created_at: Option<u64>, err: &ResilienceError<E>) {
        let Some(store) = &self.dead_letters else {
            return;
        };
        let now = store.now_millis();
        let attempts = err.attempts().unwrap_or(1);
        let record = FailedOperation {
            id: operation
                .dead_letter_id
                .clone()
                .unwrap_or_else(|| store.next_id(&operation.kind, &operation.client_id)),
            client_id: operation.client_id.clone(),
            operation_kind: operation.kind.clone(),
            endpoint: operation.endpoint.clone(),
            request_payload: operation.payload.clone(),
            last_error: err.last_failure().map_or_else(|| err.to_string(), ToString::to_string),
            retry_count: u32::try_from(attempts.saturating_sub(1)).unwrap_or(u32::MAX),
            created_at: created_at.unwrap_or(now),
            last_attempt: now,
        };

        match store.store(&record).await {
            Ok(()) => {
                self.recorder.record_dead_letter(&operation.kind);
                tracing::warn!(
                    id = %record.id,
                    operation = %operation.kind,
                    client_id = %operation.client_id,
                    retry_count = record.retry_count,
                    "operation dead-lettered"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    operation = %operation.kind,
                    client_id = %operation.client_id,
                    "failed to persist dead letter"
                );
            }
        }
    }
}
