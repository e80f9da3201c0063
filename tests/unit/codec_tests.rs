//! Unit tests for the NDJSON wire codec.
//!
//! Covers line framing: single and batched messages, partial delivery
//! buffered across reads, oversized lines, and the guarantee that one
//! corrupt line never desynchronizes the frames that follow it.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use agent_conduit::acp::codec::{WireCodec, MAX_LINE_BYTES};
use agent_conduit::EngineError;

// ── Single message ───────────────────────────────────────────────────────────

/// A complete JSON object on a single newline-terminated line is decoded
/// without error and returned as the line content (without the `\n`).
#[test]
fn single_message_parses_correctly() {
    let mut codec = WireCodec::new();
    let mut buf = BytesMut::from("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n");

    let result = codec
        .decode(&mut buf)
        .expect("decode must succeed for a valid NDJSON line");

    assert_eq!(
        result,
        Some("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}".to_owned()),
        "codec must return the line content without the trailing newline"
    );
}

// ── Batched messages ─────────────────────────────────────────────────────────

/// Two documents delivered in a single buffer are decoded as two separate
/// items by successive `decode` calls.
#[test]
fn batched_messages_are_each_parsed() {
    let mut codec = WireCodec::new();
    let raw = concat!(
        "{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{}}\n",
        "{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":null}\n",
    );
    let mut buf = BytesMut::from(raw);

    let first = codec.decode(&mut buf).expect("first decode must succeed");
    assert!(first.is_some(), "first line must be decoded");

    let second = codec.decode(&mut buf).expect("second decode must succeed");
    assert!(second.is_some(), "second line must be decoded");

    let third = codec
        .decode(&mut buf)
        .expect("buffer now empty, decode must return None");
    assert!(third.is_none(), "no further lines must be present");
}

// ── Partial delivery ─────────────────────────────────────────────────────────

/// A document split across two reads — `{"a":1` then `}\n` — yields exactly
/// one decoded object once the newline arrives.
#[test]
fn split_chunks_yield_exactly_one_object() {
    let mut codec = WireCodec::new();

    let mut buf = BytesMut::from("{\"a\":1");
    let result = codec
        .decode(&mut buf)
        .expect("partial decode must not error");
    assert!(
        result.is_none(),
        "partial line must not be emitted before the newline arrives"
    );

    buf.extend_from_slice(b"}\n");
    let line = codec
        .decode(&mut buf)
        .expect("decode must succeed after newline")
        .expect("complete line must be emitted");

    let parsed: serde_json::Value =
        serde_json::from_str(&line).expect("buffered line must be valid JSON");
    assert_eq!(parsed, serde_json::json!({ "a": 1 }));

    let further = codec.decode(&mut buf).expect("no more data");
    assert!(further.is_none(), "exactly one object must be produced");
}

// ── Corrupt line does not desynchronize ──────────────────────────────────────

/// A malformed line followed by a valid one: the codec yields both strings,
/// so the JSON layer can drop the first and still see the second intact.
#[test]
fn malformed_line_does_not_desynchronize_stream() {
    let mut codec = WireCodec::new();
    let mut buf = BytesMut::from("{bad\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n");

    let first = codec
        .decode(&mut buf)
        .expect("framing must survive a corrupt line")
        .expect("corrupt line is still a line");
    assert_eq!(first, "{bad");
    assert!(
        serde_json::from_str::<serde_json::Value>(&first).is_err(),
        "first line is deliberately not JSON"
    );

    let second = codec
        .decode(&mut buf)
        .expect("second decode must succeed")
        .expect("valid line must follow");
    let parsed: serde_json::Value =
        serde_json::from_str(&second).expect("second line must parse");
    assert_eq!(parsed["id"], 1);
}

// ── Max line length ──────────────────────────────────────────────────────────

/// A line exceeding `MAX_LINE_BYTES` causes `decode` to return
/// `EngineError::Protocol` containing `"line too long"`.
#[test]
fn max_line_length_exceeded_returns_error() {
    let mut codec = WireCodec::new();
    let big_line = "a".repeat(MAX_LINE_BYTES + 1) + "\n";
    let mut buf = BytesMut::from(big_line.as_str());

    match codec.decode(&mut buf) {
        Err(EngineError::Protocol(msg)) => assert!(
            msg.contains("line too long"),
            "error must mention 'line too long', got: {msg}"
        ),
        other => panic!("expected Err(EngineError::Protocol), got: {other:?}"),
    }
}
