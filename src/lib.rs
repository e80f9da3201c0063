#![forbid(unsafe_code)]

//! `agent-conduit` — ACP agent connection engine.
//!
//! Supervises external coding-agent processes reachable only through their
//! stdio streams, correlates concurrently in-flight JSON-RPC requests by id,
//! answers agent-initiated calls without blocking the request stream, and
//! pools one live session per logical agent identifier.

pub mod acp;
pub mod config;
pub mod errors;
pub mod pool;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
