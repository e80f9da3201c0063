//! Agent Client Protocol (ACP) connection engine.
//!
//! Manages bidirectional NDJSON JSON-RPC streams with coding-agent processes
//! spawned by the host. Each connection owns a read/write task pair over the
//! agent's stdio, an instance-scoped pending-request table, and a dispatcher
//! for agent-initiated calls.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based stream
//!   framing for NDJSON documents.
//! - `frame`: JSON-RPC wire types and inbound frame classification.
//! - `spawner`: process supervision — spawn, graceful terminate, exit
//!   monitoring, stderr draining.
//! - `connection`: request/response correlation with fixed and
//!   progress-restart timeouts.
//! - `dispatch`: fixed handlers for agent-initiated calls (permission
//!   prompts, file I/O, streaming updates).
//! - `session`: the bootstrap state machine from spawn to `Ready`.

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod frame;
pub mod session;
pub mod spawner;
