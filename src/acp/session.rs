//! Session lifecycle management.
//!
//! Sequences the bootstrap handshake over a fresh connection:
//!
//! ```text
//! Disconnected → Spawned → Initialized → SessionCreated → ModeSet
//!              → (optional) SkillsInjected → Ready
//! ```
//!
//! `Closed` is reachable from every state via [`AgentSession::terminate`] or
//! process exit. Each transition is one correlated call; a failure at any
//! step leaves the connection unusable — callers build a fresh connection
//! (normally through the pool) rather than retrying in place.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::acp::connection::{AgentConnection, TimeoutPolicy};
use crate::acp::dispatch::{InboundDispatcher, PermissionPolicy, UpdateCallback};
use crate::acp::spawner;
use crate::config::{AgentConfig, TimeoutConfig};
use crate::{EngineError, Result};

/// Protocol version this host speaks.
pub const PROTOCOL_VERSION: u64 = 1;

/// Lifecycle state of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No process yet.
    Disconnected,
    /// Process is up, no handshake performed.
    Spawned,
    /// `initialize` completed.
    Initialized,
    /// `session/new` completed; a session id is held.
    SessionCreated,
    /// `session/set_mode` completed.
    ModeSet,
    /// `session/skill_inject` accepted by the agent.
    SkillsInjected,
    /// Fully bootstrapped and accepting prompts.
    Ready,
    /// Terminated or failed; unusable.
    Closed,
}

/// One host capability announced to the agent after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SkillSpec {
    /// Stable identifier the agent can invoke the skill by.
    pub id: String,
    /// Display name.
    pub name: String,
    /// One-line description included in the announcement manifest.
    pub description: String,
}

/// Prompt content block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text content.
    Text {
        /// The text itself.
        text: String,
    },
}

impl ContentBlock {
    /// Build a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Terminal reason the agent reported for ending a prompt turn.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The turn completed normally.
    EndTurn,
    /// The model hit its output token limit.
    MaxTokens,
    /// The agent hit its per-turn request cap.
    MaxTurnRequests,
    /// The agent declined to continue.
    Refusal,
    /// The prompt was cancelled by the host.
    Cancelled,
    /// A stop reason this engine does not know about.
    #[serde(other)]
    Unknown,
}

/// Successful outcome of a `session/prompt` call.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptOutcome {
    /// Why the turn ended.
    pub stop_reason: StopReason,
}

/// Optional bootstrap steps.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Permission/autonomy mode to configure, when the agent supports modes.
    pub mode_id: Option<String>,
    /// Extra host capabilities to announce after the handshake.
    pub skills: Vec<SkillSpec>,
}

/// A bootstrapped agent session over one live connection.
pub struct AgentSession {
    conn: Arc<AgentConnection>,
    dispatcher: Arc<InboundDispatcher>,
    /// Present for real subprocess-backed sessions; absent when a test wires
    /// the session over in-memory streams.
    child: Option<Arc<tokio::sync::Mutex<Child>>>,
    session_id: Mutex<Option<String>>,
    state: Mutex<SessionState>,
    cwd: PathBuf,
    timeouts: TimeoutConfig,
}

impl AgentSession {
    /// Spawn an agent process, wire up its stdio, and run the full bootstrap
    /// sequence to `Ready`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Launch`] — the process could not be spawned.
    /// - Any error from the handshake calls; the process is terminated and
    ///   the session is left `Closed` before the error is returned.
    pub async fn bootstrap(
        agent: &AgentConfig,
        cwd: &Path,
        timeouts: TimeoutConfig,
        options: &SessionOptions,
        policy: Box<dyn PermissionPolicy>,
    ) -> Result<Arc<Self>> {
        let process = spawner::spawn_agent(agent, cwd).await?;

        let dispatcher = Arc::new(InboundDispatcher::new(policy));
        let conn = AgentConnection::from_streams(process.stdout, process.stdin, Arc::clone(&dispatcher));
        let child = Arc::new(tokio::sync::Mutex::new(process.child));

        let _monitor = spawner::monitor_exit(Arc::clone(&child), conn.cancel_token(), conn.exit_hook());
        let _stderr = spawner::drain_stderr(process.stderr, conn.cancel_token());

        let session = Arc::new(Self {
            conn,
            dispatcher,
            child: Some(child),
            session_id: Mutex::new(None),
            state: Mutex::new(SessionState::Spawned),
            cwd: cwd.to_path_buf(),
            timeouts,
        });

        if let Err(err) = session.run_handshake(options).await {
            warn!(%err, "bootstrap failed; terminating agent");
            session.terminate().await;
            return Err(err);
        }

        Ok(session)
    }

    /// Build a session over an already-connected stream pair.
    ///
    /// The session starts in `Spawned`; the caller drives the handshake via
    /// [`AgentSession::run_handshake`]. Used by tests and by hosts adopting
    /// an externally spawned process.
    #[must_use]
    pub fn from_connection(
        conn: Arc<AgentConnection>,
        dispatcher: Arc<InboundDispatcher>,
        cwd: &Path,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            conn,
            dispatcher,
            child: None,
            session_id: Mutex::new(None),
            state: Mutex::new(SessionState::Spawned),
            cwd: cwd.to_path_buf(),
            timeouts,
        }
    }

    /// Run the bootstrap sequence on a `Spawned` session.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error; the session is left in its
    /// pre-failure state and must be terminated by the caller.
    pub async fn run_handshake(&self, options: &SessionOptions) -> Result<()> {
        self.initialize().await?;
        self.new_session().await?;
        if let Some(mode_id) = &options.mode_id {
            self.set_mode(mode_id).await?;
        }
        if !options.skills.is_empty() {
            self.inject_skills(&options.skills).await;
        }
        self.set_state(SessionState::Ready);
        info!(session_id = self.session_id().as_deref(), "session ready");
        Ok(())
    }

    /// Negotiate protocol version and declare host capabilities.
    ///
    /// Must precede every other call on the connection.
    ///
    /// # Errors
    ///
    /// Surfaces the correlated request's error.
    pub async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientCapabilities": {
                "fs": { "readTextFile": true, "writeTextFile": true },
                "terminal": false,
            },
        });
        self.conn
            .request(
                "initialize",
                params,
                TimeoutPolicy::Fixed(self.timeouts.initialize()),
            )
            .await?;
        self.set_state(SessionState::Initialized);
        Ok(())
    }

    /// Create the session bound to this connection's working directory.
    ///
    /// # Errors
    ///
    /// Surfaces the correlated request's error, or
    /// [`EngineError::Protocol`] when the response carries no `sessionId`.
    pub async fn new_session(&self) -> Result<()> {
        let params = json!({
            "cwd": self.cwd.to_string_lossy(),
            "mcpServers": [],
        });
        let result = self
            .conn
            .request(
                "session/new",
                params,
                TimeoutPolicy::Fixed(self.timeouts.session_new()),
            )
            .await?;

        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Protocol("session/new response carries no sessionId".into())
            })?;
        *self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_owned());
        self.set_state(SessionState::SessionCreated);
        debug!(session_id, "session created");
        Ok(())
    }

    /// Configure the session's permission/autonomy mode.
    ///
    /// # Errors
    ///
    /// Surfaces the correlated request's error.
    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let params = json!({
            "sessionId": self.require_session_id()?,
            "modeId": mode_id,
        });
        self.conn
            .request(
                "session/set_mode",
                params,
                TimeoutPolicy::Fixed(self.timeouts.set_mode()),
            )
            .await?;
        self.set_state(SessionState::ModeSet);
        debug!(mode_id, "session mode set");
        Ok(())
    }

    /// Announce extra host capabilities to the agent, best-effort.
    ///
    /// The announcement is a non-fatal enhancement: agents that do not
    /// understand `session/skill_inject` simply never see the skills, so any
    /// failure here is logged and swallowed.
    pub async fn inject_skills(&self, skills: &[SkillSpec]) {
        let Ok(session_id) = self.require_session_id() else {
            return;
        };
        let manifest = skills
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n");
        let params = json!({
            "sessionId": session_id,
            "skills": skills,
            "manifest": manifest,
        });

        match self
            .conn
            .request(
                "session/skill_inject",
                params,
                TimeoutPolicy::Fixed(self.timeouts.skill_inject()),
            )
            .await
        {
            Ok(_) => self.set_state(SessionState::SkillsInjected),
            Err(err) => warn!(%err, "skill injection declined; continuing without"),
        }
    }

    /// Issue the long-running prompt call.
    ///
    /// Streaming updates arrive through the registered update handler while
    /// the call is in flight; the idle timeout restarts on each of them. The
    /// call resolves on the terminal stop reason in the matching response.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Closed`] — session is not `Ready`.
    /// - [`EngineError::Timeout`] — no response and no update within the
    ///   idle window.
    /// - [`EngineError::Remote`] / [`EngineError::ProcessExited`] — surfaced
    ///   from the connection.
    pub async fn prompt(&self, content: Vec<ContentBlock>) -> Result<PromptOutcome> {
        if self.state() != SessionState::Ready {
            return Err(EngineError::Closed(format!(
                "cannot prompt in state {:?}",
                self.state()
            )));
        }
        let params = json!({
            "sessionId": self.require_session_id()?,
            "prompt": content,
        });
        let result = self
            .conn
            .request(
                "session/prompt",
                params,
                TimeoutPolicy::Idle(self.timeouts.prompt_idle()),
            )
            .await?;

        serde_json::from_value(result)
            .map_err(|err| EngineError::Protocol(format!("malformed prompt response: {err}")))
    }

    /// Ask the agent to stop its current work (notification, no reply).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] when the connection is already dead.
    pub async fn cancel(&self) -> Result<()> {
        let params = json!({ "sessionId": self.require_session_id()? });
        self.conn.notify("session/cancel", params).await
    }

    /// Register the consumer for streamed `session/update` payloads.
    ///
    /// Single-subscriber: a new registration replaces the previous one.
    pub fn set_update_handler(&self, callback: UpdateCallback) {
        self.dispatcher.set_update_handler(callback);
    }

    /// Session identifier, once `session/new` has completed.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Working directory the session is bound to.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Whether the session can serve prompts right now.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state() == SessionState::Ready && self.conn.is_alive()
    }

    /// Terminate the session: fail all pending requests deterministically,
    /// stop the stream tasks, and bring the process down (graceful stop,
    /// bounded wait, force kill). Idempotent.
    pub async fn terminate(&self) {
        self.set_state(SessionState::Closed);
        self.dispatcher.clear_update_handler();
        self.conn.close();
        if let Some(child) = &self.child {
            let mut child = child.lock().await;
            if let Err(err) = spawner::terminate(&mut child, self.timeouts.terminate_grace()).await {
                warn!(%err, "agent termination failed");
            }
        }
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn require_session_id(&self) -> Result<String> {
        self.session_id()
            .ok_or_else(|| EngineError::Closed("no session established".into()))
    }
}

impl crate::pool::PooledConnection for AgentSession {
    fn is_healthy(&self) -> bool {
        Self::is_healthy(self)
    }

    fn terminate(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(Self::terminate(self))
    }
}
