use async_trait::async_trait;
use backstop::{
    Attempt, Backoff, CircuitBreaker, CircuitBreakerConfig, DeadLetterConfig, DeadLetterStore,
    InstantSleeper, Jitter, ManualClock, MemoryBackend, MetricsRecorder, RetryExecutor, ToolRequest,
    ToolResponse, Transport, TransportError,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Wall-clock start for dead-letter timestamps in tests (2024-01-01T00:00:00Z).
pub const EPOCH_MS: u64 = 1_704_067_200_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("backstop=debug").try_init();
}

pub fn status(code: u16) -> Result<ToolResponse, TransportError> {
    Ok(ToolResponse { status: code, body: json!({ "status": code }) })
}

#[derive(Debug, Default)]
struct Script {
    queue: VecDeque<Result<ToolResponse, TransportError>>,
    fallback: Option<Result<ToolResponse, TransportError>>,
    requests: Vec<ToolRequest>,
}

/// Transport that replays a scripted sequence of responses, then a fallback.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
}

impl ScriptedTransport {
    pub fn statuses(codes: &[u16]) -> Self {
        let t = Self::default();
        for code in codes {
            t.push(status(*code));
        }
        t
    }

    pub fn always(code: u16) -> Self {
        let t = Self::default();
        t.set_fallback(status(code));
        t
    }

    pub fn push(&self, response: Result<ToolResponse, TransportError>) {
        self.script.lock().queue.push_back(response);
    }

    pub fn set_fallback(&self, response: Result<ToolResponse, TransportError>) {
        self.script.lock().fallback = Some(response);
    }

    pub fn calls(&self) -> usize {
        self.script.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.script.lock().requests.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ToolRequest, _attempt: &Attempt) -> Result<ToolResponse, TransportError> {
        let mut script = self.script.lock();
        script.requests.push(request);
        match script.queue.pop_front() {
            Some(next) => next,
            None => script
                .fallback
                .clone()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into()))),
        }
    }
}

pub fn fast_retry(max_retries: u32, recorder: Arc<dyn MetricsRecorder>) -> RetryExecutor<TransportError> {
    RetryExecutor::builder()
        .max_retries(max_retries)
        .backoff(
            Backoff::exponential(Duration::from_millis(10), Duration::from_secs(1), 2.0)
                .expect("valid backoff"),
        )
        .jitter(Jitter::None)
        .with_sleeper(InstantSleeper)
        .with_recorder(recorder)
        .build()
        .expect("valid retry executor")
}

pub fn breaker(failures: usize, successes: usize, open_timeout: Duration, clock: &ManualClock) -> CircuitBreaker {
    let config = CircuitBreakerConfig::new(failures, successes, open_timeout).expect("valid breaker config");
    CircuitBreaker::new(config).expect("valid breaker").with_name("tools").with_clock(clock.clone())
}

pub fn dead_letters(clock: &ManualClock) -> DeadLetterStore {
    let backend = MemoryBackend::new().with_clock(clock.clone());
    DeadLetterStore::new(Arc::new(backend), DeadLetterConfig::default()).with_clock(clock.clone())
}
