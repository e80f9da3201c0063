//! Error types shared across the engine.

use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine error enumeration covering all connection failure modes.
#[derive(Debug)]
pub enum EngineError {
    /// The agent binary could not be spawned.
    Launch(String),
    /// A stream line could not be decoded as protocol traffic.
    ///
    /// Always recovered locally — the offending line is dropped and framing
    /// continues. This variant never reaches a `request` caller.
    Protocol(String),
    /// A correlated request expired before its response arrived.
    Timeout {
        /// Method name of the expired request.
        method: String,
        /// Time elapsed between send and expiry.
        elapsed: Duration,
    },
    /// The agent answered with a JSON-RPC error object.
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message from the agent.
        message: String,
    },
    /// The agent process exited while requests were still pending.
    ProcessExited(String),
    /// The connection was terminated or never reached a usable state.
    Closed(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Timeout { method, elapsed } => {
                write!(f, "timeout: no response to '{method}' after {elapsed:?}")
            }
            Self::Remote { code, message } => {
                write!(f, "remote error {code}: {message}")
            }
            Self::ProcessExited(msg) => write!(f, "process exited: {msg}"),
            Self::Closed(msg) => write!(f, "closed: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
