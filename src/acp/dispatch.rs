//! Inbound call dispatcher.
//!
//! Routes agent-initiated traffic to fixed handlers:
//!
//! | Method                       | Handling                                  |
//! |------------------------------|-------------------------------------------|
//! | `session/update`             | Forwarded to the caller's update slot      |
//! | `session/request_permission` | Decided by the [`PermissionPolicy`]        |
//! | `fs/read_text_file`          | Local read, content or structured error    |
//! | `fs/write_text_file`         | Local write, ack or structured error       |
//! | *(any other)*                | Ignored silently (forward compatibility)   |
//!
//! Filesystem failures are converted to JSON-RPC error replies and never
//! escape the dispatcher. Handlers reply through the connection's writer
//! channel and never touch the pending-request table, so dispatching cannot
//! block on any in-flight request's resolution.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::acp::frame;

/// JSON-RPC error code for malformed parameters.
const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code for a failed local operation.
const INTERNAL_ERROR: i64 = -32603;

// ── Update delivery ───────────────────────────────────────────────────────────

/// Decoded `session/update` notification payload.
///
/// The `update` body is deliberately left as raw JSON: persistence and
/// transport collaborators receive it verbatim, and the engine assumes
/// nothing about them beyond "a function accepting the decoded payload".
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    /// Session the update belongs to.
    pub session_id: String,
    /// Streamed update body (agent thought, tool call, message chunk, …).
    pub update: Value,
}

/// Caller-supplied consumer for streamed session updates.
pub type UpdateCallback = Box<dyn Fn(SessionNotification) + Send + Sync>;

// ── Permission policy ─────────────────────────────────────────────────────────

/// One selectable option attached to a permission request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Identifier echoed back in the chosen outcome.
    pub option_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Option kind (`allow_once`, `allow_always`, `reject_once`, …).
    #[serde(default)]
    pub kind: String,
}

/// Decoded `session/request_permission` parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Session the request belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Tool call the agent wants cleared, verbatim.
    #[serde(default)]
    pub tool_call: Option<Value>,
    /// Outcomes offered by the agent.
    #[serde(default)]
    pub options: Vec<PermissionOption>,
}

/// Verdict on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Let the tool call proceed.
    Allow,
    /// Refuse the tool call.
    Deny,
}

/// Pluggable decision point for agent permission prompts.
///
/// The engine ships [`AllowAll`], which reproduces the upstream behavior of
/// auto-approving every prompt. That effectively disables agent sandboxing,
/// so hosts that care should install their own policy here.
pub trait PermissionPolicy: Send + Sync {
    /// Decide a single permission request.
    fn decide(
        &self,
        request: PermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send + '_>>;
}

/// Always-permit policy; the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionPolicy for AllowAll {
    fn decide(
        &self,
        _request: PermissionRequest,
    ) -> Pin<Box<dyn Future<Output = PermissionDecision> + Send + '_>> {
        Box::pin(std::future::ready(PermissionDecision::Allow))
    }
}

// ── Filesystem parameter types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadTextFileParams {
    path: String,
    /// 1-based first line of the requested window.
    #[serde(default)]
    line: Option<usize>,
    /// Maximum number of lines to return.
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteTextFileParams {
    path: String,
    content: String,
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Fixed-route dispatcher for agent-initiated calls on one connection.
pub struct InboundDispatcher {
    policy: Box<dyn PermissionPolicy>,
    /// Single-subscriber update slot; a new registration replaces the old.
    updates: Mutex<Option<UpdateCallback>>,
}

impl InboundDispatcher {
    /// Create a dispatcher with the given permission policy and no update
    /// subscriber.
    #[must_use]
    pub fn new(policy: Box<dyn PermissionPolicy>) -> Self {
        Self {
            policy,
            updates: Mutex::new(None),
        }
    }

    /// Register the update callback slot, replacing any previous one.
    pub fn set_update_handler(&self, callback: UpdateCallback) {
        *self
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Clear the update callback slot.
    pub fn clear_update_handler(&self) {
        *self
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Route an inbound notification. No reply is ever produced.
    pub fn handle_notification(&self, method: &str, params: Value) {
        if method == "session/update" {
            match serde_json::from_value::<SessionNotification>(params) {
                Ok(update) => {
                    let slot = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
                    if let Some(callback) = slot.as_ref() {
                        callback(update);
                    }
                }
                Err(err) => warn!(%err, "malformed session/update payload, dropping"),
            }
            return;
        }
        debug!(method, "skipping unknown inbound notification");
    }

    /// Route an agent-initiated request, producing the reply document to
    /// write back, or `None` for unknown methods (ignored silently).
    pub async fn handle_request(&self, id: &Value, method: &str, params: Value) -> Option<Value> {
        match method {
            "session/request_permission" => Some(self.handle_permission(id, params).await),
            "fs/read_text_file" => Some(handle_fs_read(id, params).await),
            "fs/write_text_file" => Some(handle_fs_write(id, params).await),
            other => {
                debug!(method = other, "skipping unknown inbound request");
                None
            }
        }
    }

    async fn handle_permission(&self, id: &Value, params: Value) -> Value {
        let request: PermissionRequest = match serde_json::from_value(params) {
            Ok(request) => request,
            Err(err) => {
                return frame::error_response(
                    id,
                    INVALID_PARAMS,
                    &format!("malformed permission request: {err}"),
                );
            }
        };

        let options = request.options.clone();
        let decision = self.policy.decide(request).await;
        debug!(?decision, "permission request decided");
        frame::response(id, permission_outcome(decision, &options))
    }
}

/// Build the `session/request_permission` result for a decision.
///
/// Picks the agent-offered option whose kind matches the decision when one
/// exists; falls back to a literal verdict otherwise.
fn permission_outcome(decision: PermissionDecision, options: &[PermissionOption]) -> Value {
    let wanted = match decision {
        PermissionDecision::Allow => "allow",
        PermissionDecision::Deny => "reject",
    };
    let chosen = options
        .iter()
        .find(|option| option.kind.starts_with(wanted))
        .map(|option| option.option_id.clone());

    match (decision, chosen) {
        (_, Some(option_id)) => json!({
            "outcome": { "outcome": "selected", "optionId": option_id }
        }),
        (PermissionDecision::Allow, None) => json!({
            "outcome": { "outcome": "selected", "optionId": "allow" }
        }),
        (PermissionDecision::Deny, None) => json!({
            "outcome": { "outcome": "cancelled" }
        }),
    }
}

// ── Filesystem handlers ───────────────────────────────────────────────────────

async fn handle_fs_read(id: &Value, params: Value) -> Value {
    let params: ReadTextFileParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(err) => {
            return frame::error_response(
                id,
                INVALID_PARAMS,
                &format!("malformed fs/read_text_file params: {err}"),
            );
        }
    };

    match tokio::fs::read_to_string(&params.path).await {
        Ok(content) => {
            let windowed = window_lines(&content, params.line, params.limit);
            frame::response(id, json!({ "content": windowed }))
        }
        Err(err) => frame::error_response(
            id,
            INTERNAL_ERROR,
            &format!("cannot read '{}': {err}", params.path),
        ),
    }
}

async fn handle_fs_write(id: &Value, params: Value) -> Value {
    let params: WriteTextFileParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(err) => {
            return frame::error_response(
                id,
                INVALID_PARAMS,
                &format!("malformed fs/write_text_file params: {err}"),
            );
        }
    };

    match tokio::fs::write(&params.path, params.content.as_bytes()).await {
        Ok(()) => frame::response(id, Value::Null),
        Err(err) => frame::error_response(
            id,
            INTERNAL_ERROR,
            &format!("cannot write '{}': {err}", params.path),
        ),
    }
}

/// Apply the optional `line`/`limit` window to file content.
fn window_lines(content: &str, line: Option<usize>, limit: Option<usize>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_owned();
    }
    let skip = line.map_or(0, |l| l.saturating_sub(1));
    let take = limit.unwrap_or(usize::MAX);
    content
        .lines()
        .skip(skip)
        .take(take)
        .collect::<Vec<_>>()
        .join("\n")
}
