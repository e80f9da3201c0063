//! Unit tests for the inbound call dispatcher.
//!
//! Covers permission auto-approval and policy override, local file I/O with
//! structured error replies, the single-subscriber update slot, and silent
//! skipping of unknown methods.

use std::future::Future;
use std::pin::Pin;
use std::sync::mpsc;

use serde_json::{json, Value};

use agent_conduit::acp::dispatch::{
    AllowAll, InboundDispatcher, PermissionDecision, PermissionPolicy, PermissionRequest,
};

fn dispatcher() -> InboundDispatcher {
    InboundDispatcher::new(Box::new(AllowAll))
}

// ── Permission requests ──────────────────────────────────────────────────────

/// The default policy auto-approves, selecting the agent-offered allow
/// option and echoing the request id.
#[tokio::test]
async fn permission_request_is_auto_allowed() {
    let params = json!({
        "sessionId": "s-1",
        "toolCall": { "name": "bash" },
        "options": [
            { "optionId": "allow-once", "name": "Allow", "kind": "allow_once" },
            { "optionId": "reject-once", "name": "Reject", "kind": "reject_once" },
        ],
    });

    let reply = dispatcher()
        .handle_request(&json!(41), "session/request_permission", params)
        .await
        .expect("permission requests must be answered");

    assert_eq!(reply["id"], 41, "reply must echo the request id");
    assert_eq!(reply["result"]["outcome"]["outcome"], "selected");
    assert_eq!(reply["result"]["outcome"]["optionId"], "allow-once");
}

/// Without agent-offered options the allow verdict falls back to a literal.
#[tokio::test]
async fn permission_allow_without_options_uses_literal() {
    let reply = dispatcher()
        .handle_request(&json!(5), "session/request_permission", json!({}))
        .await
        .expect("permission requests must be answered");

    assert_eq!(reply["result"]["outcome"]["outcome"], "selected");
    assert_eq!(reply["result"]["outcome"]["optionId"], "allow");
}

/// A custom policy can deny; the reply then selects the reject option.
#[tokio::test]
async fn deny_policy_overrides_the_default() {
    struct DenyAll;
    impl PermissionPolicy for DenyAll {
        fn decide(
            &self,
            _request: PermissionRequest,
        ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send + '_>> {
            Box::pin(std::future::ready(PermissionDecision::Deny))
        }
    }

    let dispatcher = InboundDispatcher::new(Box::new(DenyAll));
    let params = json!({
        "options": [
            { "optionId": "allow-once", "kind": "allow_once" },
            { "optionId": "reject-once", "kind": "reject_once" },
        ],
    });

    let reply = dispatcher
        .handle_request(&json!(6), "session/request_permission", params)
        .await
        .expect("permission requests must be answered");

    assert_eq!(reply["result"]["outcome"]["optionId"], "reject-once");

    let reply = dispatcher
        .handle_request(&json!(7), "session/request_permission", json!({}))
        .await
        .expect("permission requests must be answered");
    assert_eq!(
        reply["result"]["outcome"]["outcome"], "cancelled",
        "deny without options must cancel"
    );
}

// ── File system requests ─────────────────────────────────────────────────────

/// `fs/read_text_file` returns the file content.
#[tokio::test]
async fn fs_read_returns_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("note.txt");
    std::fs::write(&path, "alpha\nbeta\ngamma\n").expect("write fixture");

    let reply = dispatcher()
        .handle_request(
            &json!(1),
            "fs/read_text_file",
            json!({ "path": path.to_string_lossy() }),
        )
        .await
        .expect("fs requests must be answered");

    assert_eq!(reply["result"]["content"], "alpha\nbeta\ngamma\n");
}

/// The optional `line`/`limit` window selects a slice of the file.
#[tokio::test]
async fn fs_read_applies_line_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("note.txt");
    std::fs::write(&path, "one\ntwo\nthree\nfour\n").expect("write fixture");

    let reply = dispatcher()
        .handle_request(
            &json!(2),
            "fs/read_text_file",
            json!({ "path": path.to_string_lossy(), "line": 2, "limit": 2 }),
        )
        .await
        .expect("fs requests must be answered");

    assert_eq!(reply["result"]["content"], "two\nthree");
}

/// A missing file becomes a structured error reply, not a crash.
#[tokio::test]
async fn fs_read_failure_becomes_error_reply() {
    let reply = dispatcher()
        .handle_request(
            &json!(3),
            "fs/read_text_file",
            json!({ "path": "/nonexistent/definitely/missing.txt" }),
        )
        .await
        .expect("fs requests must be answered");

    assert_eq!(reply["error"]["code"], -32603);
    assert!(
        reply["error"]["message"]
            .as_str()
            .is_some_and(|m| m.contains("missing.txt")),
        "error must name the path, got: {reply}"
    );
}

/// Missing required params are rejected with the invalid-params code.
#[tokio::test]
async fn fs_read_malformed_params_are_rejected() {
    let reply = dispatcher()
        .handle_request(&json!(4), "fs/read_text_file", json!({ "lines": true }))
        .await
        .expect("fs requests must be answered");

    assert_eq!(reply["error"]["code"], -32602);
}

/// `fs/write_text_file` writes the file and acknowledges with a null result.
#[tokio::test]
async fn fs_write_persists_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out.txt");

    let reply = dispatcher()
        .handle_request(
            &json!(8),
            "fs/write_text_file",
            json!({ "path": path.to_string_lossy(), "content": "written by agent" }),
        )
        .await
        .expect("fs requests must be answered");

    assert!(reply["result"].is_null(), "write ack must be null, got: {reply}");
    let on_disk = std::fs::read_to_string(&path).expect("file must exist");
    assert_eq!(on_disk, "written by agent");
}

/// A write into a nonexistent directory becomes a structured error reply.
#[tokio::test]
async fn fs_write_failure_becomes_error_reply() {
    let reply = dispatcher()
        .handle_request(
            &json!(9),
            "fs/write_text_file",
            json!({ "path": "/nonexistent/dir/out.txt", "content": "x" }),
        )
        .await
        .expect("fs requests must be answered");

    assert_eq!(reply["error"]["code"], -32603);
}

// ── Updates and unknown methods ──────────────────────────────────────────────

/// `session/update` payloads reach the registered callback slot.
#[test]
fn session_update_reaches_the_callback() {
    let dispatcher = dispatcher();
    let (tx, rx) = mpsc::channel();
    dispatcher.set_update_handler(Box::new(move |update| {
        tx.send(update).expect("test receiver alive");
    }));

    dispatcher.handle_notification(
        "session/update",
        json!({ "sessionId": "s-1", "update": { "kind": "agent_message_chunk" } }),
    );

    let update = rx.try_recv().expect("update must be delivered synchronously");
    assert_eq!(update.session_id, "s-1");
    assert_eq!(update.update["kind"], "agent_message_chunk");
}

/// A new registration replaces the previous subscriber (single-subscriber
/// contract), and clearing the slot drops delivery entirely.
#[test]
fn update_slot_is_single_subscriber() {
    let dispatcher = dispatcher();
    let (first_tx, first_rx) = mpsc::channel();
    let (second_tx, second_rx) = mpsc::channel();

    dispatcher.set_update_handler(Box::new(move |u| {
        let _ = first_tx.send(u);
    }));
    dispatcher.set_update_handler(Box::new(move |u| {
        let _ = second_tx.send(u);
    }));

    dispatcher.handle_notification(
        "session/update",
        json!({ "sessionId": "s-1", "update": {} }),
    );

    assert!(first_rx.try_recv().is_err(), "replaced subscriber must see nothing");
    assert!(second_rx.try_recv().is_ok(), "current subscriber must see the update");

    dispatcher.clear_update_handler();
    dispatcher.handle_notification(
        "session/update",
        json!({ "sessionId": "s-1", "update": {} }),
    );
    assert!(second_rx.try_recv().is_err(), "cleared slot must drop updates");
}

/// Updates arriving with no subscriber are dropped without error.
#[test]
fn update_without_subscriber_is_dropped() {
    dispatcher().handle_notification(
        "session/update",
        json!({ "sessionId": "s-1", "update": {} }),
    );
}

/// Unknown inbound requests are ignored silently — no reply at all.
#[tokio::test]
async fn unknown_request_method_is_ignored() {
    let reply = dispatcher()
        .handle_request(&json!(10), "terminal/create", json!({}))
        .await;
    assert!(reply.is_none(), "unknown methods must produce no reply");
}

/// Unknown notifications are ignored silently.
#[test]
fn unknown_notification_is_ignored() {
    dispatcher().handle_notification("session/heartbeat", json!({}));
}
