//! Circuit breaker guarding a single backend.
//!
//! One breaker exists per protected backend and is shared (via `Clone`) by every caller of that
//! backend. All counter mutations happen under one mutex so transitions are linearizable; the
//! current state is mirrored into an atomic so [`CircuitBreaker::state`] never blocks.
//!
//! Transitions:
//! - **Closed**: every call passes. `failure_threshold` consecutive failures open the circuit;
//!   any success resets the failure streak.
//! - **Open**: calls are rejected until `open_timeout` has elapsed since the circuit opened. The
//!   first admission after that moves the breaker to half-open and is itself the first probe.
//! - **HalfOpen**: at most `half_open_max_calls` probes run concurrently. `success_threshold`
//!   consecutive successes close the circuit; any failure reopens it and restarts the timer.
//!
//! Every transition to Open starts a new generation. A [`CallPermit`] settles only against the
//! generation and state it was admitted in, so a slow call admitted while Closed cannot close a
//! later half-open window or free one of its probe slots.
//!
//! Only transient failures count against the backend. [`CircuitBreaker::execute`] classifies the
//! operation's error with [`Classify`]: a non-retryable error (e.g. HTTP 400) proves the backend
//! is answering and is recorded as a success.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{Classify, ErrorClass};
use crate::ResilienceError;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open timeout elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Stable label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("success_threshold must be > 0 (got {provided})")]
    InvalidSuccessThreshold { provided: usize },
    #[error("open_timeout must be > 0 unless breaker is disabled (got {0:?})")]
    InvalidOpenTimeout(Duration),
    #[error("half_open_max_calls must be > 0 (got {provided})")]
    InvalidHalfOpenLimit { provided: usize },
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    success_threshold: usize,
    open_timeout: Duration,
    half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    /// Create a config with validation. The half-open probe limit defaults to 1.
    pub fn new(
        failure_threshold: usize,
        success_threshold: usize,
        open_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        let cfg = Self { failure_threshold, success_threshold, open_timeout, half_open_max_calls: 1 };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Override the maximum number of concurrent half-open probes; must be > 0.
    pub fn with_half_open_limit(mut self, limit: usize) -> Result<Self, CircuitBreakerError> {
        if limit == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: limit });
        }
        self.half_open_max_calls = limit;
        Ok(self)
    }

    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            success_threshold: 1,
            open_timeout: Duration::MAX,
            half_open_max_calls: usize::MAX,
        }
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    /// Duration to stay Open before probes are admitted.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }

    fn is_disabled(&self) -> bool {
        self.failure_threshold == usize::MAX
    }

    fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if self.success_threshold == 0 {
            return Err(CircuitBreakerError::InvalidSuccessThreshold { provided: 0 });
        }
        if self.half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 });
        }
        if self.open_timeout.is_zero() && !self.is_disabled() {
            return Err(CircuitBreakerError::InvalidOpenTimeout(self.open_timeout));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    /// Clock reading (millis) when the circuit last opened; `None` while closed.
    pub opened_at_millis: Option<u64>,
    pub half_open_in_flight: usize,
}

/// Rejection returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker open ({failure_count} failures, open for {open_duration:?})")]
pub struct CircuitOpen {
    pub failure_count: usize,
    pub open_duration: Duration,
}

impl<E> From<CircuitOpen> for ResilienceError<E> {
    fn from(open: CircuitOpen) -> Self {
        ResilienceError::CircuitOpen {
            failure_count: open.failure_count,
            open_duration: open.open_duration,
        }
    }
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    opened_at_millis: Option<u64>,
    half_open_in_flight: usize,
    /// Bumped on every transition to Open and on reset. Permits from an older generation no
    /// longer influence the state machine.
    generation: u64,
}

impl Counters {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at_millis: None,
            half_open_in_flight: 0,
            generation: 0,
        }
    }

    fn close(&mut self) {
        *self = Self { generation: self.generation, ..Self::closed() };
    }

    fn open(&mut self, now: u64) {
        self.state = CircuitState::Open;
        self.opened_at_millis = Some(now);
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Admission {
    generation: u64,
    probe: bool,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    counters: Mutex<Counters>,
}

/// Circuit breaker policy guarding an async operation.
///
/// Clones share the same underlying state, so all handles observe and affect the same circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    name: Arc<str>,
}

impl CircuitBreaker {
    /// Create a breaker from a config, validating the values.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_CLOSED),
                counters: Mutex::new(Counters::closed()),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            name: Arc::from("default"),
        })
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Name of the protected backend, used in log fields.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Last published state, read without locking.
    ///
    /// An open circuit whose timeout has elapsed still reads `Open` until the next admission
    /// moves it to half-open.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Snapshot of state and counters.
    ///
    /// Takes the counters lock, which is only ever held for a few field updates and never across
    /// an await, so the call does not wait on in-flight operations. Use [`state`](Self::state)
    /// for a lock-free read.
    pub fn stats(&self) -> CircuitBreakerStats {
        let c = self.shared.counters.lock();
        CircuitBreakerStats {
            state: c.state,
            consecutive_failures: c.consecutive_failures,
            consecutive_successes: c.consecutive_successes,
            opened_at_millis: c.opened_at_millis,
            half_open_in_flight: c.half_open_in_flight,
        }
    }

    /// Gate a call. Returns `true` if the call may proceed; the caller must then report the
    /// outcome with [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure). Those outcomes apply to whatever state the
    /// breaker is in when they arrive; use [`acquire`](Self::acquire) for calls that may outlive
    /// a transition.
    pub fn allow(&self) -> bool {
        self.admit().is_ok()
    }

    /// Gate a call, returning a permit that reports the outcome.
    ///
    /// A permit dropped without an outcome (cancellation, panic) frees its half-open probe slot
    /// without counting as success or failure.
    ///
    /// The permit remembers the breaker generation it was admitted in. Outcomes of a call admitted
    /// before the circuit last opened are ignored, so only probes admitted in the current
    /// half-open window can close the circuit or free a probe slot.
    pub fn acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let admission = self.admit()?;
        Ok(CallPermit { breaker: self, admission, settled: false })
    }

    /// Record a successful call against the current state.
    pub fn record_success(&self) {
        let mut c = self.shared.counters.lock();
        self.on_success(&mut c);
    }

    /// Record a failed call against the current state.
    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut c = self.shared.counters.lock();
        self.on_failure(&mut c, now);
    }

    /// Force the breaker back to Closed, clearing all counters.
    pub fn reset(&self) {
        let mut c = self.shared.counters.lock();
        c.close();
        c.generation = c.generation.wrapping_add(1);
        self.publish(CircuitState::Closed);
        tracing::info!(breaker = %self.name, "Circuit breaker reset → closed");
    }

    /// Executes the operation under breaker protection.
    ///
    /// Retryable errors count as failures; non-retryable errors count as successes and are
    /// returned as `ResilienceError::Inner`.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        E: Classify,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.acquire()?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                match e.classify() {
                    ErrorClass::Retryable => permit.failure(),
                    ErrorClass::NonRetryable => permit.success(),
                }
                Err(ResilienceError::Inner(e))
            }
        }
    }

    fn admit(&self) -> Result<Admission, CircuitOpen> {
        let now = self.clock.now_millis();
        let mut c = self.shared.counters.lock();
        let generation = c.generation;
        match c.state {
            CircuitState::Closed => Ok(Admission { generation, probe: false }),
            CircuitState::Open => {
                let elapsed = now.saturating_sub(c.opened_at_millis.unwrap_or(now));
                if u128::from(elapsed) >= self.config.open_timeout.as_millis() {
                    c.state = CircuitState::HalfOpen;
                    c.consecutive_successes = 0;
                    c.half_open_in_flight = 1;
                    self.publish(CircuitState::HalfOpen);
                    tracing::info!(breaker = %self.name, elapsed_ms = elapsed, "Circuit breaker → half-open");
                    Ok(Admission { generation, probe: true })
                } else {
                    Err(CircuitOpen {
                        failure_count: c.consecutive_failures,
                        open_duration: Duration::from_millis(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if c.half_open_in_flight >= self.config.half_open_max_calls {
                    let elapsed = now.saturating_sub(c.opened_at_millis.unwrap_or(now));
                    return Err(CircuitOpen {
                        failure_count: c.consecutive_failures,
                        open_duration: Duration::from_millis(elapsed),
                    });
                }
                c.half_open_in_flight += 1;
                tracing::debug!(
                    breaker = %self.name,
                    in_flight = c.half_open_in_flight,
                    max = self.config.half_open_max_calls,
                    "Circuit breaker: half-open probe"
                );
                Ok(Admission { generation, probe: true })
            }
        }
    }

    /// Whether an outcome from `admission` still applies to the current state.
    fn is_current(c: &Counters, admission: Admission) -> bool {
        let expected = if admission.probe { CircuitState::HalfOpen } else { CircuitState::Closed };
        c.generation == admission.generation && c.state == expected
    }

    /// Apply a permit's outcome; `None` releases the admission without a verdict.
    fn settle(&self, admission: Admission, success: Option<bool>) {
        let now = self.clock.now_millis();
        let mut c = self.shared.counters.lock();
        if !Self::is_current(&c, admission) {
            tracing::trace!(
                breaker = %self.name,
                generation = admission.generation,
                current = c.generation,
                "Circuit breaker: ignoring outcome from an earlier window"
            );
            return;
        }
        match success {
            Some(true) => self.on_success(&mut c),
            Some(false) => self.on_failure(&mut c, now),
            None if admission.probe => {
                c.half_open_in_flight = c.half_open_in_flight.saturating_sub(1);
            }
            None => {}
        }
    }

    fn on_success(&self, c: &mut Counters) {
        match c.state {
            CircuitState::Closed => {
                c.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                c.half_open_in_flight = c.half_open_in_flight.saturating_sub(1);
                c.consecutive_successes += 1;
                if c.consecutive_successes >= self.config.success_threshold {
                    c.close();
                    self.publish(CircuitState::Closed);
                    tracing::info!(breaker = %self.name, "Circuit breaker → closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, c: &mut Counters, now: u64) {
        match c.state {
            CircuitState::Closed => {
                c.consecutive_failures = c.consecutive_failures.saturating_add(1);
                if c.consecutive_failures >= self.config.failure_threshold {
                    c.open(now);
                    self.publish(CircuitState::Open);
                    tracing::error!(
                        breaker = %self.name,
                        failures = c.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                }
            }
            CircuitState::HalfOpen => {
                c.consecutive_failures = c.consecutive_failures.saturating_add(1);
                c.open(now);
                self.publish(CircuitState::Open);
                tracing::warn!(
                    breaker = %self.name,
                    failures = c.consecutive_failures,
                    "Circuit breaker: probe failed → open"
                );
            }
            CircuitState::Open => {}
        }
    }

    fn publish(&self, state: CircuitState) {
        self.shared.state.store(state.to_u8(), Ordering::Release);
    }
}

/// Admission ticket from [`CircuitBreaker::acquire`].
#[must_use = "a permit must be settled with success() or failure(), or dropped to release it"]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call was admitted as a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.admission.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.admission, Some(true));
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.admission, Some(false));
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(self.admission, None);
        }
    }
}
