//! Agent process supervision.
//!
//! Spawns headless agent processes with:
//! - `kill_on_drop(true)` so processes are cleaned up automatically.
//! - `env_clear()` + a safe variable allowlist, so host secrets never leak
//!   into the child's environment; callers add what their agent needs via
//!   [`crate::config::AgentConfig::env`].
//! - A graceful [`terminate`]: stop signal, bounded wait, force kill.
//!
//! The supervisor never parses agent output itself — stdout belongs to the
//! connection reader and stderr is drained as free-text diagnostics by
//! [`drain_stderr`].

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::{EngineError, Result};

/// Environment variables inherited by the spawned agent process.
///
/// Every other variable from the host's environment is stripped via
/// `env_clear()` before the child is launched; extras come from the launch
/// configuration only.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Active stdio handles for a spawned agent process.
///
/// The caller is responsible for keeping `child` alive (it has
/// `kill_on_drop(true)`), wiring `stdin`/`stdout` into a connection, and
/// handing `stderr` to [`drain_stderr`].
#[derive(Debug)]
pub struct AgentProcess {
    /// Child process handle — kept alive so `kill_on_drop` works.
    pub child: Child,
    /// Agent's stdin for outbound protocol lines.
    pub stdin: ChildStdin,
    /// Agent's stdout carrying inbound protocol lines.
    pub stdout: ChildStdout,
    /// Agent's stderr — diagnostics only, never protocol.
    pub stderr: ChildStderr,
}

/// Spawn an agent process with piped stdio.
///
/// # Errors
///
/// - [`EngineError::Launch`] — the binary could not be spawned, or a stdio
///   handle could not be captured.
pub async fn spawn_agent(config: &AgentConfig, cwd: &Path) -> Result<AgentProcess> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    // Strip inherited environment, then inject only the safe allowlist.
    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    for (key, val) in &config.env {
        cmd.env(key, val);
    }

    cmd.current_dir(cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| EngineError::Launch(format!("failed to spawn '{}': {err}", config.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Launch("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Launch("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Launch("failed to capture agent stderr".into()))?;

    info!(command = %config.command, cwd = %cwd.display(), pid = child.id(), "agent process spawned");

    Ok(AgentProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

/// Terminate the agent process: graceful stop, bounded wait, force kill.
///
/// On unix the graceful stop is `SIGTERM`; elsewhere it goes straight to
/// `start_kill`. If the child is still alive after `grace`, it is killed.
/// Idempotent — terminating an already-exited child returns its status.
///
/// # Errors
///
/// Returns [`EngineError::Io`] when waiting on the child fails at the OS
/// level.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<Option<i32>> {
    match child.try_wait() {
        Ok(Some(status)) => return Ok(status.code()),
        Ok(None) => {}
        Err(err) => return Err(EngineError::Io(format!("wait failed: {err}"))),
    }

    send_stop_signal(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok(status.code()),
        Ok(Err(err)) => Err(EngineError::Io(format!("wait failed: {err}"))),
        Err(_elapsed) => {
            warn!(grace = ?grace, "agent ignored graceful stop; force killing");
            child
                .kill()
                .await
                .map_err(|err| EngineError::Io(format!("kill failed: {err}")))?;
            Ok(None)
        }
    }
}

#[cfg(unix)]
fn send_stop_signal(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(%err, "SIGTERM delivery failed; child may already be gone");
        }
    }
}

#[cfg(not(unix))]
fn send_stop_signal(child: &mut Child) {
    // No portable graceful signal; terminate() falls through to kill after
    // the grace period, and start_kill here shortens the wait.
    let _ = child.start_kill();
}

/// How often the exit monitor polls the child for an exit status.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Spawn a background task that watches for child-process exit and reports it.
///
/// The child handle is shared with [`terminate`], so the monitor polls
/// `try_wait` rather than parking in `wait`. `on_exit` receives a
/// human-readable reason (`"process exited with code 0"`, `"process
/// terminated by signal"`, …) at most once. The task respects `cancel`: when
/// the token fires the monitor exits without reporting — orderly shutdown
/// goes through [`terminate`] instead.
#[must_use]
pub fn monitor_exit<F>(
    child: std::sync::Arc<tokio::sync::Mutex<Child>>,
    cancel: CancellationToken,
    on_exit: F,
) -> JoinHandle<()>
where
    F: FnOnce(String) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("exit monitor cancelled");
                    return;
                }
                () = tokio::time::sleep(EXIT_POLL_INTERVAL) => {
                    let status = child.lock().await.try_wait();
                    match status {
                        Ok(Some(status)) => {
                            let reason = status.code().map_or_else(
                                || "process terminated by signal".to_owned(),
                                |c| format!("process exited with code {c}"),
                            );
                            on_exit(reason);
                            return;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            on_exit(format!("wait error: {err}"));
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Spawn a background task that drains agent stderr as diagnostics.
///
/// Each line is logged at `debug`; nothing on stderr is ever parsed as
/// protocol traffic. The task ends at stderr EOF or cancellation.
#[must_use]
pub fn drain_stderr(stderr: ChildStderr, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = lines.next_line() => match next {
                    Ok(Some(line)) => debug!(target: "agent_stderr", "{line}"),
                    Ok(None) | Err(_) => break,
                },
            }
        }
    })
}
