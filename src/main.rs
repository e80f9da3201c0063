#![forbid(unsafe_code)]

//! `agent-conduit` — CLI driver for the ACP connection engine.
//!
//! Bootstraps configuration, acquires one pooled agent session, sends a
//! single prompt, and relays streamed updates to stdout as NDJSON. Exists so
//! the engine can be exercised end-to-end against a real agent binary; any
//! serious host embeds the library instead.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::acp::session::{ContentBlock, SessionOptions};
use agent_conduit::pool::session_pool;
use agent_conduit::{EngineConfig, EngineError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "ACP agent connection engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent command to launch (overrides the config file).
    #[arg(long)]
    command: Option<String>,

    /// Working directory for the session (defaults to the current directory).
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Permission/autonomy mode to configure after session creation.
    #[arg(long)]
    mode: Option<String>,

    /// Logical agent identifier for the pool (defaults to a fresh UUID).
    #[arg(long)]
    agent_id: Option<String>,

    /// Prompt text to send once the session is ready.
    prompt: String,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| EngineError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| EngineError::Config(format!("cannot read config: {err}")))?;
            EngineConfig::from_toml_str(&text)?
        }
        None => EngineConfig::default(),
    };
    if let Some(command) = args.command {
        config.agent.command = command;
    }
    config.validate()?;

    let cwd = match args.cwd.or_else(|| config.agent.cwd.clone()) {
        Some(cwd) => cwd,
        None => std::env::current_dir()
            .map_err(|err| EngineError::Config(format!("cannot resolve cwd: {err}")))?,
    };
    let agent_id = args
        .agent_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // ── Acquire a session and stream the prompt ─────────
    let options = SessionOptions {
        mode_id: args.mode,
        skills: Vec::new(),
    };
    let pool = session_pool(config.agent.clone(), config.timeouts, options);

    let session = pool.acquire(&agent_id, &cwd).await?;
    session.set_update_handler(Box::new(|update| {
        // Relay each streamed update verbatim; consumers parse NDJSON.
        if let Ok(line) = serde_json::to_string(&update.update) {
            println!("{line}");
        }
    }));

    info!(agent_id = %agent_id, cwd = %cwd.display(), "session ready, sending prompt");
    match session.prompt(vec![ContentBlock::text(args.prompt)]).await {
        Ok(outcome) => {
            info!(stop_reason = ?outcome.stop_reason, "prompt completed");
        }
        Err(err) => {
            error!(%err, "prompt failed; evicting pooled session");
            pool.invalidate(&agent_id).await;
            pool.shutdown().await;
            return Err(err);
        }
    }

    pool.shutdown().await;
    Ok(())
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| EngineError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| EngineError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
