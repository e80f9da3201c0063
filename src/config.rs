//! Engine configuration parsing and validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::{EngineError, Result};

/// Agent launch settings.
///
/// Agent-binary discovery is the caller's concern; the engine only needs a
/// command, its arguments, and a working directory.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Agent CLI binary (e.g. `claude-code-acp`, `gemini`).
    pub command: String,
    /// Arguments passed to the agent binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables set for the agent process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Default working directory for new sessions.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Configurable timeout values (milliseconds) for correlated requests.
///
/// The handshake calls complete in well under a second on a healthy agent;
/// `session/prompt` can legitimately run for many minutes as long as it keeps
/// streaming updates, which is why it gets an *idle* timeout that restarts on
/// every `session/update` rather than a fixed deadline.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// `initialize` request timeout.
    #[serde(default = "default_initialize_ms")]
    pub initialize_ms: u64,
    /// `session/new` request timeout.
    #[serde(default = "default_session_new_ms")]
    pub session_new_ms: u64,
    /// `session/set_mode` request timeout.
    #[serde(default = "default_set_mode_ms")]
    pub set_mode_ms: u64,
    /// `session/skill_inject` request timeout.
    #[serde(default = "default_skill_inject_ms")]
    pub skill_inject_ms: u64,
    /// `session/prompt` idle timeout — restarted on each streaming update.
    #[serde(default = "default_prompt_idle_ms")]
    pub prompt_idle_ms: u64,
    /// Grace period between the graceful stop signal and the force kill.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

fn default_initialize_ms() -> u64 {
    5_000
}

fn default_session_new_ms() -> u64 {
    15_000
}

fn default_set_mode_ms() -> u64 {
    5_000
}

fn default_skill_inject_ms() -> u64 {
    5_000
}

fn default_prompt_idle_ms() -> u64 {
    120_000
}

fn default_terminate_grace_ms() -> u64 {
    5_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialize_ms: default_initialize_ms(),
            session_new_ms: default_session_new_ms(),
            set_mode_ms: default_set_mode_ms(),
            skill_inject_ms: default_skill_inject_ms(),
            prompt_idle_ms: default_prompt_idle_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

impl TimeoutConfig {
    /// `initialize` timeout as a [`Duration`].
    #[must_use]
    pub fn initialize(&self) -> Duration {
        Duration::from_millis(self.initialize_ms)
    }

    /// `session/new` timeout as a [`Duration`].
    #[must_use]
    pub fn session_new(&self) -> Duration {
        Duration::from_millis(self.session_new_ms)
    }

    /// `session/set_mode` timeout as a [`Duration`].
    #[must_use]
    pub fn set_mode(&self) -> Duration {
        Duration::from_millis(self.set_mode_ms)
    }

    /// `session/skill_inject` timeout as a [`Duration`].
    #[must_use]
    pub fn skill_inject(&self) -> Duration {
        Duration::from_millis(self.skill_inject_ms)
    }

    /// `session/prompt` idle timeout as a [`Duration`].
    #[must_use]
    pub fn prompt_idle(&self) -> Duration {
        Duration::from_millis(self.prompt_idle_ms)
    }

    /// Terminate grace period as a [`Duration`].
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Agent launch settings.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Per-method request timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl EngineConfig {
    /// Parse an [`EngineConfig`] from a TOML document and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the document does not parse or a
    /// validation rule fails.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field-level constraints.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the agent command is empty or any
    /// timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(EngineError::Config("agent.command must not be empty".into()));
        }

        let timeouts = [
            ("timeouts.initialize_ms", self.timeouts.initialize_ms),
            ("timeouts.session_new_ms", self.timeouts.session_new_ms),
            ("timeouts.set_mode_ms", self.timeouts.set_mode_ms),
            ("timeouts.skill_inject_ms", self.timeouts.skill_inject_ms),
            ("timeouts.prompt_idle_ms", self.timeouts.prompt_idle_ms),
            ("timeouts.terminate_grace_ms", self.timeouts.terminate_grace_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be non-zero")));
            }
        }

        Ok(())
    }
}
