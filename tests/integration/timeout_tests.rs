//! Integration tests for request timeout policies.
//!
//! All tests run on a paused tokio clock, so the timings asserted here are
//! virtual and deterministic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agent_conduit::acp::connection::TimeoutPolicy;
use agent_conduit::EngineError;

use super::test_helpers::connect;

// ── Fixed deadlines ──────────────────────────────────────────────────────────

/// A fixed timeout against a silent agent fails with `Timeout`, naming the
/// method and carrying the elapsed duration.
#[tokio::test(start_paused = true)]
async fn fixed_timeout_fires_against_silent_agent() {
    let (conn, _dispatcher, mut agent) = connect();

    let pending = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move {
            conn.request(
                "op/slow",
                json!({}),
                TimeoutPolicy::Fixed(Duration::from_millis(50)),
            )
            .await
        }
    });
    let _ = agent.recv().await;

    let outcome = pending.await.expect("task must not panic");
    match outcome {
        Err(EngineError::Timeout { method, elapsed }) => {
            assert_eq!(method, "op/slow");
            assert!(
                elapsed >= Duration::from_millis(50),
                "elapsed must cover the deadline, got {elapsed:?}"
            );
        }
        other => panic!("expected Err(EngineError::Timeout), got: {other:?}"),
    }
}

/// After a timeout the pending entry is gone: the response arriving later
/// resolves nothing and is ignored.
#[tokio::test(start_paused = true)]
async fn expired_entry_is_removed_from_the_pending_table() {
    let (conn, _dispatcher, mut agent) = connect();

    let outcome = conn
        .request(
            "op/expired",
            json!({}),
            TimeoutPolicy::Fixed(Duration::from_millis(20)),
        )
        .await;
    assert!(matches!(outcome, Err(EngineError::Timeout { .. })));

    // Deliver the response late; the reader drops it as unknown.
    let request = agent.recv().await;
    agent
        .send(&json!({ "jsonrpc": "2.0", "id": request["id"], "result": {} }))
        .await;
    tokio::task::yield_now().await;

    // The connection stays healthy for subsequent requests.
    let follow_up = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move {
            conn.request(
                "op/next",
                json!({}),
                TimeoutPolicy::Fixed(Duration::from_secs(5)),
            )
            .await
        }
    });
    let doc = agent.recv().await;
    agent
        .send(&json!({ "jsonrpc": "2.0", "id": doc["id"], "result": { "ok": true } }))
        .await;

    let result = follow_up
        .await
        .expect("task must not panic")
        .expect("follow-up request must resolve");
    assert_eq!(result["ok"], true);
}

// ── Progress-based liveness ──────────────────────────────────────────────────

/// An idle timeout of 50 ms with `session/update` notifications every 30 ms
/// never fires across 500 ms of virtual time; once the notifications stop,
/// the request times out within 60 ms of the last one.
#[tokio::test(start_paused = true)]
async fn idle_timeout_restarts_on_streaming_updates() {
    let (conn, _dispatcher, mut agent) = connect();
    let started = tokio::time::Instant::now();

    let pending = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move {
            conn.request(
                "session/prompt",
                json!({ "sessionId": "s-1", "prompt": [] }),
                TimeoutPolicy::Idle(Duration::from_millis(50)),
            )
            .await
        }
    });
    let _ = agent.recv().await;

    // 16 updates at 30 ms intervals: the last lands at t = 480 ms, so the
    // idle window stays covered through the 500 ms mark.
    for _ in 0..16 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        agent
            .send(&json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": { "sessionId": "s-1", "update": { "kind": "thinking" } },
            }))
            .await;
    }

    let outcome = pending.await.expect("task must not panic");
    let failed_at = started.elapsed();

    assert!(
        matches!(outcome, Err(EngineError::Timeout { .. })),
        "prompt must eventually time out once updates stop, got: {outcome:?}"
    );
    assert!(
        failed_at >= Duration::from_millis(500),
        "timeout must never fire while updates keep arriving, fired at {failed_at:?}"
    );
    assert!(
        failed_at <= Duration::from_millis(480 + 60),
        "timeout must fire within 60 ms of the last update, fired at {failed_at:?}"
    );
}

/// With no updates at all, the idle timeout behaves like a fixed deadline
/// measured from the send.
#[tokio::test(start_paused = true)]
async fn idle_timeout_fires_without_any_updates() {
    let (conn, _dispatcher, mut agent) = connect();
    let started = tokio::time::Instant::now();

    let pending = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move {
            conn.request(
                "session/prompt",
                json!({ "sessionId": "s-1", "prompt": [] }),
                TimeoutPolicy::Idle(Duration::from_millis(50)),
            )
            .await
        }
    });
    let _ = agent.recv().await;

    let outcome = pending.await.expect("task must not panic");
    assert!(matches!(outcome, Err(EngineError::Timeout { .. })));
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "idle deadline must cover the configured window"
    );
}

/// A response racing the idle deadline wins: the request resolves normally.
#[tokio::test(start_paused = true)]
async fn response_beats_idle_deadline() {
    let (conn, _dispatcher, mut agent) = connect();

    let pending = tokio::spawn({
        let conn = Arc::clone(&conn);
        async move {
            conn.request(
                "session/prompt",
                json!({ "sessionId": "s-1", "prompt": [] }),
                TimeoutPolicy::Idle(Duration::from_millis(50)),
            )
            .await
        }
    });
    let request = agent.recv().await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    agent
        .send(&json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": { "stopReason": "end_turn" },
        }))
        .await;

    let result = pending
        .await
        .expect("task must not panic")
        .expect("response inside the idle window must resolve the request");
    assert_eq!(result["stopReason"], "end_turn");
}
