mod common;

use backstop::{
    CallContext, CircuitBreaker, CircuitBreakerConfig, DeadLetterError, ManualClock, MemoryRecorder,
    ReplayError, ResilientExecutor, ResilientTransport, ToolCall,
};
use common::test_helpers::{dead_letters, fast_retry, status, ScriptedTransport, EPOCH_MS};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;

fn client(
    transport: &ScriptedTransport,
    clock: &ManualClock,
    with_store: bool,
) -> ResilientTransport<ScriptedTransport> {
    let mut executor = ResilientExecutor::new(
        fast_retry(1, Arc::new(MemoryRecorder::new())),
        CircuitBreaker::new(CircuitBreakerConfig::disabled()).unwrap(),
    );
    if with_store {
        executor = executor.with_dead_letters(dead_letters(clock));
    }
    ResilientTransport::new(transport.clone(), executor, "http://localhost:8080/", "replayer")
}

#[tokio::test]
async fn endpoints_are_built_under_base_url() {
    let transport = ScriptedTransport::always(200);
    let clock = ManualClock::new(EPOCH_MS);
    let client = client(&transport, &clock, true);
    let ctx = CallContext::new();

    client.connect(&ctx, json!({ "session": "s1" })).await.unwrap();
    client.list_tools(&ctx).await.unwrap();
    client.call_tool(&ctx, "fetch", json!({ "url": "https://example.com" })).await.unwrap();

    let endpoints: Vec<_> = transport.requests().into_iter().map(|r| r.endpoint).collect();
    assert_eq!(
        endpoints,
        [
            "http://localhost:8080/connect",
            "http://localhost:8080/tools/list",
            "http://localhost:8080/tools/call",
        ]
    );
    assert_eq!(
        transport.requests()[2].payload,
        json!({ "name": "fetch", "arguments": { "url": "https://example.com" } })
    );
}

#[tokio::test]
async fn successful_replay_keeps_the_record() {
    let transport = ScriptedTransport::statuses(&[503, 503]);
    transport.set_fallback(status(200));
    let clock = ManualClock::new(EPOCH_MS);
    let client = client(&transport, &clock, true);
    let ctx = CallContext::new();

    assert!(client.call_tool(&ctx, "search", json!({ "q": 1 })).await.is_err());
    let store = client.executor().dead_letters().unwrap();
    let id = store.list(1).await.unwrap()[0].id.clone();

    let body = client.replay(&ctx, &id).await.unwrap();
    assert_eq!(body, json!({ "status": 200 }));
    assert_eq!(transport.requests()[2].payload, json!({ "name": "search", "arguments": { "q": 1 } }));
    assert!(store.get(&id).await.is_ok(), "replay never deletes the record");

    assert!(store.delete(&id).await.unwrap());
    assert!(store.is_empty().await.unwrap());
}

#[tokio::test]
async fn failed_replay_updates_the_same_record() {
    let transport = ScriptedTransport::always(504);
    let clock = ManualClock::new(EPOCH_MS);
    let client = client(&transport, &clock, true);
    let ctx = CallContext::new();

    let _ = client.connect(&ctx, json!({})).await;
    let store = client.executor().dead_letters().unwrap();
    let original = store.list(1).await.unwrap().remove(0);

    clock.advance(60_000);
    let err = client.replay(&ctx, &original.id).await.unwrap_err();
    assert!(matches!(err, ReplayError::Call(ref e) if e.is_retry_exhausted()), "{err:?}");

    assert_eq!(store.len().await.unwrap(), 1);
    let updated = store.get(&original.id).await.unwrap();
    assert_eq!(updated.created_at, original.created_at);
    assert_eq!(updated.last_attempt, EPOCH_MS + 60_000);
    assert_eq!(updated.retry_count, 1);
}

#[tokio::test]
async fn replay_of_unknown_id_is_not_found() {
    let transport = ScriptedTransport::always(200);
    let clock = ManualClock::new(EPOCH_MS);
    let client = client(&transport, &clock, true);

    let err = client.replay(&CallContext::new(), "missing").await.unwrap_err();
    assert!(matches!(err, ReplayError::DeadLetter(DeadLetterError::NotFound(_))));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn replay_requires_a_store() {
    let transport = ScriptedTransport::always(200);
    let clock = ManualClock::new(EPOCH_MS);
    let client = client(&transport, &clock, false);

    let err = client.replay(&CallContext::new(), "any").await.unwrap_err();
    assert!(matches!(err, ReplayError::NoDeadLetterStore));
}

#[tokio::test]
async fn works_as_a_tower_service() {
    let transport = ScriptedTransport::statuses(&[500]);
    transport.set_fallback(status(201));
    let clock = ManualClock::new(EPOCH_MS);
    let client = client(&transport, &clock, true);

    let call = ToolCall {
        kind: "call_tool".into(),
        endpoint: client.endpoint("tools/call"),
        payload: json!({ "name": "echo" }),
        context: CallContext::new(),
    };
    let body = client.clone().oneshot(call).await.unwrap();

    assert_eq!(body, json!({ "status": 201 }));
    assert_eq!(transport.calls(), 2);
}
