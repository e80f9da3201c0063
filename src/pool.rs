//! Connection pool — one live session per logical agent identifier.
//!
//! The pool directory is the only structure shared between agent
//! connections. Each agent id owns a slot guarded by its own async mutex, so
//! concurrent [`ConnectionPool::acquire`] calls for one cold id serialize:
//! the second caller waits on the first's in-flight bootstrap and reuses its
//! result instead of spawning a second process. Distinct agent ids never
//! contend.
//!
//! Entries are replaced wholesale, never patched: an unhealthy connection is
//! torn down and rebuilt, and a prompt failure evicts the entry so the next
//! acquire starts clean.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::Result;

/// Pool-facing surface of a bootstrapped connection.
///
/// [`crate::acp::session::AgentSession`] is the production implementation;
/// tests substitute counting fakes.
pub trait PooledConnection: Send + Sync + 'static {
    /// Whether the underlying process is alive and the session active.
    fn is_healthy(&self) -> bool;
    /// Tear the connection down, failing its pending requests.
    fn terminate(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Factory producing a Ready connection for `(agent_id, cwd)`.
pub type Connector<C> =
    Arc<dyn Fn(&str, &Path) -> Pin<Box<dyn Future<Output = Result<Arc<C>>> + Send>> + Send + Sync>;

/// One pooled connection plus its bookkeeping.
struct PoolEntry<C> {
    conn: Arc<C>,
    /// Monotonic rebuild counter for this agent id. Request ids restart per
    /// connection, so each generation gets a fresh id sequence.
    generation: u64,
    last_used_at: DateTime<Utc>,
}

/// Per-agent slot; its mutex serializes bootstrap for that id.
struct Slot<C> {
    gate: Mutex<SlotState<C>>,
}

struct SlotState<C> {
    entry: Option<PoolEntry<C>>,
    generation: u64,
}

/// Directory of live agent connections, keyed by agent id.
pub struct ConnectionPool<C: PooledConnection> {
    connector: Connector<C>,
    slots: Mutex<HashMap<String, Arc<Slot<C>>>>,
}

impl<C: PooledConnection> ConnectionPool<C> {
    /// Create an empty pool around a connector.
    #[must_use]
    pub fn new(connector: Connector<C>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return a Ready connection for `agent_id`, reusing the live one when
    /// its process is alive and its session active, rebuilding otherwise.
    ///
    /// # Errors
    ///
    /// Surfaces the connector's bootstrap error; the slot is left empty so
    /// the next acquire retries from scratch.
    pub async fn acquire(&self, agent_id: &str, cwd: &Path) -> Result<Arc<C>> {
        let slot = self.slot(agent_id).await;
        let mut state = slot.gate.lock().await;

        if let Some(entry) = &mut state.entry {
            if entry.conn.is_healthy() {
                entry.last_used_at = Utc::now();
                debug!(agent_id, generation = entry.generation, "reusing pooled connection");
                return Ok(Arc::clone(&entry.conn));
            }
        }
        if let Some(stale) = state.entry.take() {
            // Stale: tear down before rebuilding so the old process cannot
            // outlive its replacement.
            debug!(agent_id, "evicting stale pooled connection");
            stale.conn.terminate().await;
        }

        let conn = (self.connector)(agent_id, cwd).await?;
        state.generation += 1;
        info!(agent_id, generation = state.generation, "pooled connection established");
        state.entry = Some(PoolEntry {
            conn: Arc::clone(&conn),
            generation: state.generation,
            last_used_at: Utc::now(),
        });
        Ok(conn)
    }

    /// Evict `agent_id`'s entry, terminating its connection.
    ///
    /// Called after a prompt failure so a corrupted session never silently
    /// persists; the next [`ConnectionPool::acquire`] starts clean.
    /// Unknown ids are a no-op.
    pub async fn invalidate(&self, agent_id: &str) {
        let slot = {
            let slots = self.slots.lock().await;
            slots.get(agent_id).map(Arc::clone)
        };
        let Some(slot) = slot else { return };

        let mut state = slot.gate.lock().await;
        if let Some(entry) = state.entry.take() {
            info!(agent_id, generation = entry.generation, "invalidating pooled connection");
            entry.conn.terminate().await;
        }
    }

    /// Terminate every pooled connection and await completion.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Arc<Slot<C>>)> = {
            let mut map = self.slots.lock().await;
            map.drain().collect()
        };
        for (agent_id, slot) in slots {
            let mut state = slot.gate.lock().await;
            if let Some(entry) = state.entry.take() {
                debug!(agent_id = %agent_id, "terminating pooled connection on shutdown");
                entry.conn.terminate().await;
            }
        }
        info!("connection pool drained");
    }

    /// When `agent_id`'s live entry was last handed out, if it has one.
    pub async fn last_used(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        let slot = {
            let slots = self.slots.lock().await;
            slots.get(agent_id).map(Arc::clone)
        }?;
        let state = slot.gate.lock().await;
        state.entry.as_ref().map(|entry| entry.last_used_at)
    }

    /// Ids with a live entry right now, mainly for observability.
    pub async fn live_agents(&self) -> Vec<String> {
        let slots = self.slots.lock().await;
        let mut live = Vec::new();
        for (agent_id, slot) in &*slots {
            let state = slot.gate.lock().await;
            if state.entry.is_some() {
                live.push(agent_id.clone());
            }
        }
        live
    }

    /// Get or create the slot for `agent_id` (short directory lock only).
    async fn slot(&self, agent_id: &str) -> Arc<Slot<C>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(agent_id.to_owned()).or_insert_with(|| {
            Arc::new(Slot {
                gate: Mutex::new(SlotState {
                    entry: None,
                    generation: 0,
                }),
            })
        }))
    }
}

/// Convenience: build a pool whose connector bootstraps real agent sessions.
#[must_use]
pub fn session_pool(
    agent: crate::config::AgentConfig,
    timeouts: crate::config::TimeoutConfig,
    options: crate::acp::session::SessionOptions,
) -> ConnectionPool<crate::acp::session::AgentSession> {
    let connector: Connector<crate::acp::session::AgentSession> =
        Arc::new(move |agent_id: &str, cwd: &Path| {
            let agent = agent.clone();
            let options = options.clone();
            let agent_id = agent_id.to_owned();
            let cwd: PathBuf = cwd.to_path_buf();
            Box::pin(async move {
                debug!(agent_id = %agent_id, "bootstrapping agent session");
                crate::acp::session::AgentSession::bootstrap(
                    &agent,
                    &cwd,
                    timeouts,
                    &options,
                    Box::new(crate::acp::dispatch::AllowAll),
                )
                .await
            })
        });
    ConnectionPool::new(connector)
}
