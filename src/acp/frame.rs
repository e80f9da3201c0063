//! JSON-RPC wire types and inbound frame classification.
//!
//! Every decoded line is one JSON-RPC 2.0 document. [`classify`] tags it as a
//! [`InboundFrame::Request`] (method + id, reply expected), a
//! [`InboundFrame::Notification`] (method, no id), or a
//! [`InboundFrame::Response`] (id matching a host-issued request). Documents
//! that fit none of these shapes are dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version constant carried on every outbound document.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error object (`code` + `message`, optional `data`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JsonRpcError {
    /// Numeric JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single decoded inbound document, tagged by protocol role.
#[derive(Debug)]
pub enum InboundFrame {
    /// Agent-initiated call expecting a reply with the same `id`.
    Request {
        /// Correlation id to echo on the reply, verbatim.
        id: Value,
        /// Method name (e.g. `fs/read_text_file`).
        method: String,
        /// Method parameters.
        params: Value,
    },
    /// Agent-initiated message expecting no reply.
    Notification {
        /// Method name (e.g. `session/update`).
        method: String,
        /// Method parameters.
        params: Value,
    },
    /// Reply to a host-issued request.
    Response {
        /// Host-allocated numeric request id.
        id: u64,
        /// `Ok(result)` or `Err(error object)`.
        outcome: std::result::Result<Value, JsonRpcError>,
    },
}

/// Classify a decoded JSON document into an [`InboundFrame`].
///
/// Returns `None` when the document matches no JSON-RPC shape — e.g. a bare
/// scalar, a response whose `id` is not an unsigned integer, or a response
/// carrying neither `result` nor `error`. Such documents are skipped by the
/// reader without disturbing the stream.
#[must_use]
pub fn classify(doc: Value) -> Option<InboundFrame> {
    let Value::Object(mut obj) = doc else {
        return None;
    };

    if let Some(method) = obj.remove("method") {
        let method = method.as_str()?.to_owned();
        let params = obj.remove("params").unwrap_or(Value::Null);
        let id = obj.remove("id").filter(|id| !id.is_null());
        return Some(match id {
            Some(id) => InboundFrame::Request { id, method, params },
            None => InboundFrame::Notification { method, params },
        });
    }

    // No method: only a response to one of our own requests makes sense, and
    // we only ever allocate unsigned integer ids.
    let id = obj.get("id").and_then(Value::as_u64)?;
    if let Some(error) = obj.remove("error") {
        let error: JsonRpcError = serde_json::from_value(error).ok()?;
        return Some(InboundFrame::Response {
            id,
            outcome: Err(error),
        });
    }
    obj.remove("result").map(|result| InboundFrame::Response {
        id,
        outcome: Ok(result),
    })
}

// ── Outbound builders ─────────────────────────────────────────────────────────

/// Build an outbound request document.
#[must_use]
pub fn request(id: u64, method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    })
}

/// Build an outbound notification document (no `id`, no reply expected).
#[must_use]
pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

/// Build a success reply to an agent-initiated request, echoing its `id`.
#[must_use]
pub fn response(id: &Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error reply to an agent-initiated request, echoing its `id`.
#[must_use]
pub fn error_response(id: &Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
}
