//! Retry executor for fallible async operations.
//!
//! Semantics:
//! - `max_retries` counts retries after the first attempt, so a run makes at most
//!   `max_retries + 1` attempts.
//! - Errors are classified with [`Classify`] (or an override predicate). Non-retryable errors end
//!   the run on the attempt that produced them, surfaced as [`ResilienceError::Inner`].
//! - Each attempt runs under `min(per_attempt_timeout, remaining total budget, caller deadline)`.
//!   An attempt that overruns its own budget fails with the operation's error type built from
//!   [`AttemptTimeout`], which is normally retryable.
//! - Cancellation and deadline expiry are checked once at the top of every iteration and
//!   interrupt both a running attempt and a backoff sleep immediately. They end the run with
//!   [`ResilienceError::Cancelled`], never with exhaustion.
//! - The sleep after failed attempt `a` is `clamp(jitter(backoff.delay(a)))`.
//!
//! Invariants:
//! - Attempts never exceed `max_retries + 1`.
//! - The run never outlives the total budget by more than scheduler latency.
//! - Every attempt outcome is reported to the [`MetricsRecorder`].
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use backstop::{Backoff, CallContext, InstantSleeper, Jitter, RetryExecutor, TransportError};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retry = RetryExecutor::<TransportError>::builder()
//!     .max_retries(2)
//!     .backoff(Backoff::exponential(Duration::from_millis(10), Duration::from_secs(1), 2.0).unwrap())
//!     .jitter(Jitter::None)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//!
//! let result = retry
//!     .execute(&CallContext::new(), "call_tool", |_attempt| async {
//!         Err::<(), _>(TransportError::Status { status: 503, message: "busy".into() })
//!     })
//!     .await;
//! assert_eq!(result.unwrap_err().attempts(), Some(3));
//! # });
//! ```

use crate::config::{ConfigError, ResilienceConfig};
use crate::error::{AttemptTimeout, CancelReason, Classify, ErrorClass, MAX_RETRY_FAILURES};
use crate::metrics::{MetricsRecorder, NoopRecorder, RetryReason};
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Caller-side cancellation and deadline for one `execute` call.
///
/// Cloning shares the cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing cancellation token, e.g. one shared with a request scope.
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Descriptor handed to the operation for each attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    index: u32,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Attempt {
    /// Zero-based attempt number.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_retry(&self) -> bool {
        self.index > 0
    }

    /// Instant by which this attempt is abandoned.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the attempt is abandoned.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Child of the caller's token; cancelled when the attempt is abandoned.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Errors produced while building a retry executor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("per_attempt_timeout must be > 0")]
    ZeroPerAttemptTimeout,
    #[error("total_timeout must be > 0")]
    ZeroTotalTimeout,
    #[error("invalid jitter: {0}")]
    InvalidJitter(&'static str),
}

type ClassifyFn<E> = Arc<dyn Fn(&E) -> ErrorClass + Send + Sync>;

/// Retry executor combining backoff, jitter, classification, time budgets, and a sleeper.
///
/// Clones share the jitter RNG, sleeper, and recorder.
pub struct RetryExecutor<E> {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    total_timeout: Option<Duration>,
    per_attempt_timeout: Option<Duration>,
    classify: Option<ClassifyFn<E>>,
    sleeper: Arc<dyn Sleeper>,
    recorder: Arc<dyn MetricsRecorder>,
    rng: Arc<Mutex<StdRng>>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            max_retries: self.max_retries,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            total_timeout: self.total_timeout,
            per_attempt_timeout: self.per_attempt_timeout,
            classify: self.classify.clone(),
            sleeper: self.sleeper.clone(),
            recorder: self.recorder.clone(),
            rng: self.rng.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("total_timeout", &self.total_timeout)
            .field("per_attempt_timeout", &self.per_attempt_timeout)
            .field("sleeper", &self.sleeper)
            .field("recorder", &self.recorder)
            .field("classify", &self.classify.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl<E> RetryExecutor<E>
where
    E: std::error::Error + Classify + From<AttemptTimeout> + Send + Sync + 'static,
{
    pub fn builder() -> RetryExecutorBuilder<E> {
        RetryExecutorBuilder::new()
    }

    /// Build an executor from the retry section of a [`ResilienceConfig`].
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ConfigError> {
        Ok(RetryExecutorBuilder::from_config(config)?.build()?)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn recorder(&self) -> &Arc<dyn MetricsRecorder> {
        &self.recorder
    }

    /// Classify an error using the override predicate if set, otherwise [`Classify`].
    pub fn classify(&self, error: &E) -> ErrorClass {
        match &self.classify {
            Some(f) => f(error),
            None => error.classify(),
        }
    }

    /// Jittered, clamped sleep that follows failed attempt `retry`.
    pub fn next_delay(&self, retry: u32) -> Duration {
        let base = self.backoff.delay(retry);
        let jittered = self.jitter.apply_with_rng(base, &mut *self.rng.lock());
        self.backoff.clamp(jittered)
    }

    /// Run `op` until it succeeds, fails permanently, exhausts its retries, or is cancelled.
    ///
    /// `operation` labels logs and metrics. `op` is invoked once per attempt with an [`Attempt`]
    /// descriptor and must be idempotent.
    pub async fn execute<T, Fut, Op>(
        &self,
        ctx: &CallContext,
        operation: &str,
        mut op: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let budget = self.total_timeout.and_then(|t| started.checked_add(t));
        let overall = earliest(budget, ctx.deadline());
        let mut failures: Vec<E> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(self.cancelled(operation, CancelReason::Cancelled, attempt, started));
            }
            let attempt_start = Instant::now();
            if overall.is_some_and(|d| attempt_start >= d) {
                return Err(self.cancelled(operation, CancelReason::DeadlineExceeded, attempt, started));
            }

            let own_deadline = self.per_attempt_timeout.and_then(|t| attempt_start.checked_add(t));
            let deadline = earliest(own_deadline, overall);
            let token = ctx.token().child_token();
            let fut = op(Attempt { index: attempt, deadline, token: token.clone() });

            let result = tokio::select! {
                biased;
                _ = ctx.token().cancelled() => {
                    token.cancel();
                    return Err(self.cancelled(operation, CancelReason::Cancelled, attempt + 1, started));
                }
                r = async {
                    match deadline {
                        Some(d) => tokio::time::timeout_at(d, fut).await.ok(),
                        None => Some(fut.await),
                    }
                } => r,
            };

            let result = match result {
                Some(r) => r,
                None => {
                    token.cancel();
                    if overall.is_some_and(|d| Instant::now() >= d) {
                        return Err(self.cancelled(
                            operation,
                            CancelReason::DeadlineExceeded,
                            attempt + 1,
                            started,
                        ));
                    }
                    let limit = deadline.map_or(Duration::ZERO, |d| d - attempt_start);
                    Err(E::from(AttemptTimeout { limit }))
                }
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        self.recorder.record_retry_attempt(operation, RetryReason::SuccessAfterRetry);
                        tracing::debug!(operation, attempts = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if self.classify(&error) == ErrorClass::NonRetryable {
                self.recorder.record_retry_attempt(operation, RetryReason::NonRetryable);
                tracing::debug!(operation, attempt, error = %error, "non-retryable error");
                return Err(ResilienceError::Inner(error));
            }

            if attempt >= self.max_retries {
                self.recorder.record_retry_attempt(operation, RetryReason::Exhausted);
                let elapsed = started.elapsed();
                tracing::warn!(
                    operation,
                    attempts = attempt + 1,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %error,
                    "retries exhausted"
                );
                failures.push(error);
                return Err(ResilienceError::retry_exhausted(
                    attempt as usize + 1,
                    elapsed,
                    failures,
                ));
            }

            self.recorder.record_retry_attempt(operation, RetryReason::Retryable);
            let delay = self.next_delay(attempt);
            self.recorder.record_backoff(operation, delay);
            tracing::debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable error, backing off"
            );
            failures.push(error);
            if failures.len() > MAX_RETRY_FAILURES {
                failures.remove(0);
            }

            let sleep = self.sleeper.sleep(delay);
            let interrupted = tokio::select! {
                biased;
                _ = ctx.token().cancelled() => Some(CancelReason::Cancelled),
                _ = sleep_until_opt(overall) => Some(CancelReason::DeadlineExceeded),
                _ = sleep => None,
            };
            if let Some(reason) = interrupted {
                return Err(self.cancelled(operation, reason, attempt + 1, started));
            }
            attempt += 1;
        }
    }

    fn cancelled(
        &self,
        operation: &str,
        reason: CancelReason,
        attempts: u32,
        started: Instant,
    ) -> ResilienceError<E> {
        let elapsed = started.elapsed();
        self.recorder.record_retry_attempt(operation, RetryReason::Cancelled);
        tracing::debug!(operation, attempts, reason = %reason, "retry loop stopped");
        ResilienceError::Cancelled { reason, attempts: attempts as usize, elapsed }
    }
}

/// Builder for [`RetryExecutor`].
pub struct RetryExecutorBuilder<E> {
    max_retries: u32,
    backoff: Backoff,
    jitter: Jitter,
    total_timeout: Option<Duration>,
    per_attempt_timeout: Option<Duration>,
    classify: Option<ClassifyFn<E>>,
    sleeper: Arc<dyn Sleeper>,
    recorder: Arc<dyn MetricsRecorder>,
    seed: Option<u64>,
}

impl<E> RetryExecutorBuilder<E>
where
    E: std::error::Error + Classify + From<AttemptTimeout> + Send + Sync + 'static,
{
    /// Defaults: 3 retries, 100ms..30s doubling backoff, ±10% jitter, 5 minute total budget,
    /// 30 second attempt budget.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            jitter: Jitter::default(),
            total_timeout: Some(Duration::from_secs(300)),
            per_attempt_timeout: Some(Duration::from_secs(30)),
            classify: None,
            sleeper: Arc::new(TokioSleeper),
            recorder: Arc::new(NoopRecorder),
            seed: None,
        }
    }

    /// Start from the retry settings of a [`ResilienceConfig`].
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new()
            .max_retries(config.max_retries)
            .backoff(config.backoff()?)
            .jitter(config.jitter()?)
            .total_timeout(config.total_retry_timeout())
            .per_attempt_timeout(config.per_attempt_timeout()))
    }

    /// Retries after the first attempt. Zero disables retrying.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Budget for the whole run, sleeps included.
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn no_total_timeout(mut self) -> Self {
        self.total_timeout = None;
        self
    }

    /// Budget for a single attempt.
    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = Some(timeout);
        self
    }

    pub fn no_per_attempt_timeout(mut self) -> Self {
        self.per_attempt_timeout = None;
        self
    }

    /// Override classification for this executor.
    pub fn classify_with<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> ErrorClass + Send + Sync + 'static,
    {
        self.classify = Some(Arc::new(predicate));
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Seed the jitter RNG for reproducible delays.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<RetryExecutor<E>, BuildError> {
        if self.per_attempt_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BuildError::ZeroPerAttemptTimeout);
        }
        if self.total_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BuildError::ZeroTotalTimeout);
        }
        if let Jitter::Proportional { percent } = self.jitter {
            Jitter::proportional(percent).map_err(BuildError::InvalidJitter)?;
        }
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(RetryExecutor {
            max_retries: self.max_retries,
            backoff: self.backoff,
            jitter: self.jitter,
            total_timeout: self.total_timeout,
            per_attempt_timeout: self.per_attempt_timeout,
            classify: self.classify,
            sleeper: self.sleeper,
            recorder: self.recorder,
            rng: Arc::new(Mutex::new(rng)),
        })
    }
}

impl<E> Default for RetryExecutorBuilder<E>
where
    E: std::error::Error + Classify + From<AttemptTimeout> + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
