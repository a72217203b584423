//! Tool-backend transport and its resilient wrapper.
//!
//! [`Transport`] is the single capability a backend client must provide: send one request and
//! return the HTTP-like response. [`ResilientTransport`] composes a transport with a
//! [`ResilientExecutor`] and exposes the tool endpoints (`connect`, `call_tool`, `list_tools`) plus
//! [`replay`](ResilientTransport::replay) for dead-lettered operations.
//!
//! Non-2xx responses are turned into [`TransportError::Status`] and classified by status code.

use crate::dead_letter::DeadLetterError;
use crate::error::{AttemptTimeout, Classify, ErrorClass};
use crate::executor::{Operation, ResilientExecutor};
use crate::retry::{Attempt, CallContext};
use crate::ResilienceError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_service::Service;

/// Failure of a single backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// HTTP status code, if the backend answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Classify for TransportError {
    fn classify(&self) -> ErrorClass {
        match self {
            TransportError::ConnectionRefused(_)
            | TransportError::ConnectionReset(_)
            | TransportError::Timeout(_)
            | TransportError::Network(_) => ErrorClass::Retryable,
            TransportError::Status { status: 429 | 500 | 502 | 503 | 504, .. } => {
                ErrorClass::Retryable
            }
            TransportError::Status { .. }
            | TransportError::MalformedRequest(_)
            | TransportError::Other(_) => ErrorClass::NonRetryable,
        }
    }
}

impl From<AttemptTimeout> for TransportError {
    fn from(t: AttemptTimeout) -> Self {
        TransportError::Timeout(t.limit)
    }
}

/// Request sent to the tool backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub endpoint: String,
    pub payload: Value,
}

/// Response from the tool backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub status: u16,
    pub body: Value,
}

impl ToolResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// One backend call. Implementations should honour `attempt.deadline()` and
/// `attempt.token()`; the executor abandons the call when either fires.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, request: ToolRequest, attempt: &Attempt) -> Result<ToolResponse, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: ToolRequest, attempt: &Attempt) -> Result<ToolResponse, TransportError> {
        (**self).send(request, attempt).await
    }
}

/// Errors from [`ResilientTransport::replay`].
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("no dead letter store configured")]
    NoDeadLetterStore,
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error("replay failed: {0}")]
    Call(#[from] ResilienceError<TransportError>),
}

/// A request routed through [`ResilientTransport`] as a tower service.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub kind: String,
    pub endpoint: String,
    pub payload: Value,
    pub context: CallContext,
}

/// Transport protected by a circuit breaker, retries, and a dead letter store.
#[derive(Debug)]
pub struct ResilientTransport<T> {
    transport: Arc<T>,
    executor: ResilientExecutor<TransportError>,
    base_url: String,
    client_id: String,
}

impl<T> Clone for ResilientTransport<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            executor: self.executor.clone(),
            base_url: self.base_url.clone(),
            client_id: self.client_id.clone(),
        }
    }
}

impl<T: Transport + 'static> ResilientTransport<T> {
    pub fn new(
        transport: T,
        executor: ResilientExecutor<TransportError>,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            transport: Arc::new(transport),
            executor,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    pub fn executor(&self) -> &ResilientExecutor<TransportError> {
        &self.executor
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Open a session with the backend.
    pub async fn connect(
        &self,
        ctx: &CallContext,
        params: Value,
    ) -> Result<Value, ResilienceError<TransportError>> {
        self.send(ctx, "connect", self.endpoint("connect"), params).await
    }

    pub async fn call_tool(
        &self,
        ctx: &CallContext,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ResilienceError<TransportError>> {
        let payload = json!({ "name": name, "arguments": arguments });
        self.send(ctx, "call_tool", self.endpoint("tools/call"), payload).await
    }

    pub async fn list_tools(&self, ctx: &CallContext) -> Result<Value, ResilienceError<TransportError>> {
        self.send(ctx, "list_tools", self.endpoint("tools/list"), Value::Null).await
    }

    /// Send an arbitrary request through the resilient path.
    pub async fn send(
        &self,
        ctx: &CallContext,
        kind: &str,
        endpoint: String,
        payload: Value,
    ) -> Result<Value, ResilienceError<TransportError>> {
        let operation = Operation::new(kind, self.client_id.clone())
            .with_endpoint(endpoint)
            .with_payload(payload);
        self.run(ctx, &operation).await
    }

    /// Re-issue a dead-lettered operation.
    ///
    /// The record is left in place on success; delete it once the replay has been verified. A
    /// replay that exhausts its retries updates the same record.
    pub async fn replay(&self, ctx: &CallContext, id: &str) -> Result<Value, ReplayError> {
        let store = self.executor.dead_letters().ok_or(ReplayError::NoDeadLetterStore)?;
        let record = store.get(id).await?;
        tracing::info!(id, operation = %record.operation_kind, "replaying dead letter");
        let operation = Operation::new(record.operation_kind, record.client_id)
            .with_endpoint(record.endpoint)
            .with_payload(record.request_payload)
            .with_created_at(record.created_at)
            .with_dead_letter_id(record.id);
        Ok(self.run(ctx, &operation).await?)
    }

    async fn run(
        &self,
        ctx: &CallContext,
        operation: &Operation,
    ) -> Result<Value, ResilienceError<TransportError>> {
        let transport = &self.transport;
        self.executor
            .execute(ctx, operation, |attempt| {
                let request = ToolRequest {
                    endpoint: operation.endpoint.clone(),
                    payload: operation.payload.clone(),
                };
                async move {
                    let response = transport.send(request, &attempt).await?;
                    if response.is_success() {
                        Ok(response.body)
                    } else {
                        Err(TransportError::Status {
                            status: response.status,
                            message: response.body.to_string(),
                        })
                    }
                }
            })
            .await
    }
}

impl<T: Transport + 'static> Service<ToolCall> for ResilientTransport<T> {
    type Response = Value;
    type Error = ResilienceError<TransportError>;
    type Future = BoxFuture<'static, Result<Value, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: ToolCall) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { this.send(&call.context, &call.kind, call.endpoint, call.payload).await })
    }
}
