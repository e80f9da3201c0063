//! Unit tests for the engine error taxonomy.

use std::time::Duration;

use agent_conduit::EngineError;

/// Timeout errors name the method and carry the elapsed duration.
#[test]
fn timeout_display_names_method_and_elapsed() {
    let err = EngineError::Timeout {
        method: "session/prompt".into(),
        elapsed: Duration::from_millis(1500),
    };
    let display = format!("{err}");
    assert!(display.contains("session/prompt"), "got: {display}");
    assert!(display.contains("1.5s"), "got: {display}");
}

/// Remote errors surface the agent's JSON-RPC code and message.
#[test]
fn remote_display_carries_code_and_message() {
    let err = EngineError::Remote {
        code: -32601,
        message: "method not found".into(),
    };
    let display = format!("{err}");
    assert!(display.contains("-32601"), "got: {display}");
    assert!(display.contains("method not found"), "got: {display}");
}

/// Each variant renders with its category prefix.
#[test]
fn variant_prefixes_are_stable() {
    let cases = [
        (EngineError::Launch("no such binary".into()), "launch:"),
        (EngineError::Protocol("bad line".into()), "protocol:"),
        (EngineError::ProcessExited("code 1".into()), "process exited:"),
        (EngineError::Closed("terminated".into()), "closed:"),
        (EngineError::Config("bad toml".into()), "config:"),
        (EngineError::Io("pipe broken".into()), "io:"),
    ];
    for (err, prefix) in cases {
        let display = format!("{err}");
        assert!(
            display.starts_with(prefix),
            "expected '{display}' to start with '{prefix}'"
        );
    }
}

/// `std::io::Error` converts into the `Io` variant.
#[test]
fn io_error_converts_to_io_variant() {
    let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
    let err: EngineError = io_err.into();
    assert!(matches!(err, EngineError::Io(_)));
}

/// TOML parse failures convert into the `Config` variant.
#[test]
fn toml_error_converts_to_config_variant() {
    let toml_err = toml::from_str::<toml::Value>("not [ valid").expect_err("must not parse");
    let err: EngineError = toml_err.into();
    assert!(matches!(err, EngineError::Config(_)));
}
