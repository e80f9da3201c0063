//! Agent connection and request/response correlation.
//!
//! An [`AgentConnection`] owns one bidirectional NDJSON stream pair and the
//! pending-request table for that stream. Many requests may be in flight at
//! once over the single shared pipe; each is distinguished by a sequential
//! numeric id allocated here, and each caller suspends on its own completion
//! handle until the matching response, a timeout, or process exit.
//!
//! The table is instance-scoped — distinct agent connections share nothing.
//! Id allocation restarts at 1 for every connection, so a rebuilt process
//! generation can never collide with responses from a previous one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::WireCodec;
use crate::acp::dispatch::InboundDispatcher;
use crate::acp::frame::{self, InboundFrame};
use crate::{EngineError, Result};

/// Outbound channel depth before senders are backpressured.
const OUTBOUND_BUFFER: usize = 64;

/// Expiry behavior for a correlated request.
#[derive(Debug, Clone, Copy)]
pub enum TimeoutPolicy {
    /// Hard deadline measured from send.
    Fixed(Duration),
    /// Liveness deadline that restarts whenever a `session/update`
    /// notification arrives on this connection. Used for `session/prompt`,
    /// where legitimate work runs many minutes provided it keeps producing
    /// observable output.
    Idle(Duration),
}

/// One outstanding host-issued request.
struct PendingRequest {
    method: String,
    created_at: Instant,
    completion: oneshot::Sender<Result<Value>>,
}

/// State shared between the connection handle and its stream tasks.
struct Shared {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    /// Last observable progress on this connection; idle deadlines restart
    /// from here.
    activity: Mutex<Instant>,
    alive: AtomicBool,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_activity(&self) -> MutexGuard<'_, Instant> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch_activity(&self) {
        *self.lock_activity() = Instant::now();
    }

    /// Fail every pending entry with an error built by `make_err`, draining
    /// the table so no late response can resolve anything afterward.
    fn fail_all<F>(&self, make_err: F)
    where
        F: Fn(&str) -> EngineError,
    {
        let drained: Vec<(u64, PendingRequest)> = self.lock_pending().drain().collect();
        for (id, entry) in drained {
            debug!(id, method = %entry.method, "failing pending request");
            let _ = entry.completion.send(Err(make_err(&entry.method)));
        }
    }

    /// Mark the connection dead and fail all pending entries.
    fn mark_exited(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        self.fail_all(|_| EngineError::ProcessExited(reason.to_owned()));
    }
}

/// Live connection to one agent process (or scripted stream pair in tests).
pub struct AgentConnection {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    outbound: mpsc::Sender<Value>,
    cancel: CancellationToken,
}

impl AgentConnection {
    /// Build a connection over an arbitrary stream pair and start its reader
    /// and writer tasks.
    ///
    /// Production wires the agent's stdout/stdin here; tests substitute
    /// [`tokio::io::duplex`] halves to script the agent side.
    pub fn from_streams<R, W>(reader: R, writer: W, dispatcher: Arc<InboundDispatcher>) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            activity: Mutex::new(Instant::now()),
            alive: AtomicBool::new(true),
        });
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(run_writer(
            writer,
            outbound_rx,
            Arc::clone(&shared),
            cancel.clone(),
        ));
        tokio::spawn(run_reader(
            reader,
            Arc::clone(&shared),
            dispatcher,
            outbound_tx.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            shared,
            next_id: AtomicU64::new(0),
            outbound: outbound_tx,
            cancel,
        })
    }

    /// Issue a correlated request and await its outcome under `policy`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Closed`] — connection already dead or terminated.
    /// - [`EngineError::Timeout`] — `policy` expired; the pending entry is
    ///   removed, so a response arriving later resolves nothing.
    /// - [`EngineError::Remote`] — the agent answered with an error object.
    /// - [`EngineError::ProcessExited`] — the agent died while this request
    ///   was pending.
    pub async fn request(&self, method: &str, params: Value, policy: TimeoutPolicy) -> Result<Value> {
        if !self.is_alive() {
            return Err(EngineError::Closed(format!(
                "cannot send '{method}': connection is closed"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        self.shared.lock_pending().insert(
            id,
            PendingRequest {
                method: method.to_owned(),
                created_at,
                completion: tx,
            },
        );
        // Idle deadlines measure from send until the first update arrives.
        self.shared.touch_activity();

        let doc = frame::request(id, method, params);
        if self.outbound.send(doc).await.is_err() {
            self.shared.lock_pending().remove(&id);
            return Err(EngineError::Closed(format!(
                "cannot send '{method}': agent stdin is closed"
            )));
        }
        debug!(id, method, "request sent");

        self.await_response(id, method, rx, policy, created_at).await
    }

    /// Send a notification (no id, no reply expected).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] when the connection is dead.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        if !self.is_alive() {
            return Err(EngineError::Closed(format!(
                "cannot send '{method}': connection is closed"
            )));
        }
        self.outbound
            .send(frame::notification(method, params))
            .await
            .map_err(|_| {
                EngineError::Closed(format!("cannot send '{method}': agent stdin is closed"))
            })
    }

    /// Whether the stream pair is still believed healthy.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Terminate the connection: stop both stream tasks and deterministically
    /// fail every pending request rather than letting it time out.
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.shared.alive.swap(false, Ordering::SeqCst) {
            debug!("connection closed");
        }
        self.cancel.cancel();
        self.shared
            .fail_all(|method| EngineError::Closed(format!("'{method}' aborted: connection terminated")));
    }

    /// Token cancelling this connection's background tasks; hand it to the
    /// exit monitor and stderr drain so they stop with the connection.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hook for the process exit monitor: fails all pending requests with
    /// [`EngineError::ProcessExited`] and marks the connection dead.
    ///
    /// The stream tasks are left running so any output the dead process left
    /// buffered is still drained to EOF; with the pending table already
    /// cleared, a late response line resolves nothing.
    #[must_use]
    pub fn exit_hook(&self) -> impl FnOnce(String) + Send + 'static {
        let shared = Arc::clone(&self.shared);
        move |reason: String| {
            warn!(%reason, "agent process exited unexpectedly");
            shared.mark_exited(&reason);
        }
    }

    async fn await_response(
        &self,
        id: u64,
        method: &str,
        mut rx: oneshot::Receiver<Result<Value>>,
        policy: TimeoutPolicy,
        created_at: Instant,
    ) -> Result<Value> {
        match policy {
            TimeoutPolicy::Fixed(limit) => {
                match tokio::time::timeout(limit, &mut rx).await {
                    Ok(outcome) => flatten_completion(outcome),
                    Err(_elapsed) => self.expire(id, method, &mut rx, created_at),
                }
            }
            TimeoutPolicy::Idle(idle) => loop {
                let deadline = *self.shared.lock_activity() + idle;
                if deadline <= Instant::now() {
                    return self.expire(id, method, &mut rx, created_at);
                }
                tokio::select! {
                    outcome = &mut rx => return flatten_completion(outcome),
                    () = tokio::time::sleep_until(deadline) => {
                        // Re-check: an update may have pushed the deadline on.
                    }
                }
            },
        }
    }

    /// Remove the pending entry after an expiry, returning a response that
    /// raced in at the last instant if there is one.
    fn expire(
        &self,
        id: u64,
        method: &str,
        rx: &mut oneshot::Receiver<Result<Value>>,
        created_at: Instant,
    ) -> Result<Value> {
        self.shared.lock_pending().remove(&id);
        if let Ok(outcome) = rx.try_recv() {
            return outcome;
        }
        warn!(id, method, "request timed out");
        Err(EngineError::Timeout {
            method: method.to_owned(),
            elapsed: created_at.elapsed(),
        })
    }
}

/// Unwrap a completion-channel receive into the request outcome.
fn flatten_completion(
    outcome: std::result::Result<Result<Value>, oneshot::error::RecvError>,
) -> Result<Value> {
    match outcome {
        Ok(result) => result,
        // The entry vanished without a resolution; only close() racing a
        // response delivery can produce this.
        Err(_) => Err(EngineError::Closed("connection terminated".into())),
    }
}

// ── Stream tasks ──────────────────────────────────────────────────────────────

/// Writer task — serialises outbound documents and writes NDJSON lines.
async fn run_writer<W>(
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<Value>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("writer: cancellation received, stopping");
                break;
            }

            msg = outbound_rx.recv() => {
                let Some(value) = msg else {
                    debug!("writer: outbound channel closed, stopping");
                    break;
                };
                let mut bytes = match serde_json::to_vec(&value) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "writer: failed to serialise outbound message, dropping");
                        continue;
                    }
                };
                bytes.push(b'\n');
                if let Err(err) = writer.write_all(&bytes).await {
                    // Broken stdin pipe: fail in-flight requests immediately
                    // instead of letting them ride out their timeouts.
                    warn!(%err, "writer: write to agent stdin failed");
                    shared.alive.store(false, Ordering::SeqCst);
                    shared.fail_all(|method| {
                        EngineError::Io(format!("write of '{method}' failed: agent stdin broken"))
                    });
                    break;
                }
            }
        }
    }
}

/// Reader task — decodes inbound lines, classifies frames, and routes them.
///
/// Responses resolve pending entries; notifications bump the activity clock
/// and flow to the dispatcher's update slot; agent-initiated requests are
/// answered through the shared outbound channel. Malformed lines are logged
/// and dropped without disturbing subsequent framing. EOF or a stream error
/// fails all pending requests with [`EngineError::ProcessExited`].
async fn run_reader<R>(
    reader: R,
    shared: Arc<Shared>,
    dispatcher: Arc<InboundDispatcher>,
    outbound_tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framed = FramedRead::new(reader, WireCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("reader: EOF on agent stdout");
                        shared.mark_exited("agent stream closed");
                        return;
                    }
                    Some(Err(EngineError::Protocol(msg))) => {
                        // Oversized line: drop it, keep framing.
                        warn!(error = %msg, "reader: codec framing error, skipping line");
                    }
                    Some(Err(err)) => {
                        warn!(%err, "reader: stream error, stopping");
                        shared.mark_exited("agent stream error");
                        return;
                    }
                    Some(Ok(line)) => {
                        handle_line(&line, &shared, &dispatcher, &outbound_tx).await;
                    }
                }
            }
        }
    }
}

/// Parse and route a single inbound line.
async fn handle_line(
    line: &str,
    shared: &Arc<Shared>,
    dispatcher: &InboundDispatcher,
    outbound_tx: &mpsc::Sender<Value>,
) {
    if line.trim().is_empty() {
        return;
    }

    let doc: Value = match serde_json::from_str(line) {
        Ok(doc) => doc,
        Err(err) => {
            // Noisy agents interleave diagnostics with protocol output;
            // recover locally and keep the stream alive.
            debug!(%err, raw_line = line, "reader: undecodable line, skipping");
            return;
        }
    };

    let Some(frame) = frame::classify(doc) else {
        debug!(raw_line = line, "reader: unclassifiable document, skipping");
        return;
    };

    match frame {
        InboundFrame::Response { id, outcome } => {
            let entry = shared.lock_pending().remove(&id);
            match entry {
                Some(entry) => {
                    debug!(
                        id,
                        method = %entry.method,
                        elapsed = ?entry.created_at.elapsed(),
                        "response correlated"
                    );
                    let result = outcome.map_err(|e| EngineError::Remote {
                        code: e.code,
                        message: e.message,
                    });
                    let _ = entry.completion.send(result);
                }
                None => {
                    // Late response after timeout/exit cleanup, or an id we
                    // never issued. Ignored either way.
                    debug!(id, "response for unknown request id, ignoring");
                }
            }
        }
        InboundFrame::Notification { method, params } => {
            if method == "session/update" {
                shared.touch_activity();
            }
            dispatcher.handle_notification(&method, params);
        }
        InboundFrame::Request { id, method, params } => {
            if let Some(reply) = dispatcher.handle_request(&id, &method, params).await {
                if outbound_tx.send(reply).await.is_err() {
                    warn!(method, "reader: cannot deliver reply, writer is gone");
                }
            }
        }
    }
}
