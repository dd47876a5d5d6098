//! Language server sessions
//!
//! Each application has one [`LspSlot`]. Attaching while a session is active
//! terminates the old relay (and its process) before the new process starts,
//! so at most one language server runs per application. The relay copies bytes
//! verbatim in both directions and ends when the editor disconnects, the server
//! exits, the session is replaced or stopped, or nothing moves for the idle
//! timeout.

use crate::application::{AppContext, AppId};
use crate::config::LspConfig;
use crate::errors::{CradleError, Result};
use crate::observability::lsp_span;
use crate::runtime::{ContainerRuntime, ProcessHandle};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// How long a replaced relay gets to shut down before it is aborted
const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 64;
/// Upper bound on buffered, unframed server output
const MAX_FRAME_BUFFER: usize = 8 * 1024 * 1024;

/// Tracks the last JSON-RPC response the server sent
///
/// Server output is `Content-Length`-framed JSON. Partial frames are buffered
/// until complete.
#[derive(Debug, Default)]
pub struct ProtocolCursor {
    pending: Vec<u8>,
    last_acknowledged: Option<String>,
    messages: u64,
}

impl ProtocolCursor {
    pub fn observe(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some((body_start, length)) = Self::frame_header(&self.pending) {
            if self.pending.len() < body_start + length {
                break;
            }
            let body: Vec<u8> = self.pending.drain(..body_start + length).skip(body_start).collect();
            self.messages += 1;
            if let Ok(message) = serde_json::from_slice::<serde_json::Value>(&body) {
                let is_response = message.get("result").is_some() || message.get("error").is_some();
                if let (true, Some(id)) = (is_response, message.get("id")) {
                    self.last_acknowledged = Some(match id {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                }
            }
        }
        if self.pending.len() > MAX_FRAME_BUFFER {
            warn!("Discarding {} bytes of unframed server output", self.pending.len());
            self.pending.clear();
        }
    }

    /// Offset of the body and its length, once the header block is complete
    fn frame_header(buf: &[u8]) -> Option<(usize, usize)> {
        let end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
        let headers = std::str::from_utf8(&buf[..end]).ok()?;
        let length = headers.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })?;
        Some((end + 4, length))
    }

    pub fn last_acknowledged(&self) -> Option<&str> {
        self.last_acknowledged.as_deref()
    }

    pub fn messages(&self) -> u64 {
        self.messages
    }
}

/// Editor side of a session
#[derive(Debug)]
pub struct LspClient {
    pub session_id: u64,
    /// Bytes for the language server's stdin
    pub to_server: mpsc::Sender<Bytes>,
    /// Bytes from the language server's stdout; ends with the session
    pub from_server: mpsc::Receiver<Bytes>,
}

struct ActiveSession {
    id: u64,
    started_at: DateTime<Utc>,
    cursor: Arc<Mutex<ProtocolCursor>>,
    cancel: CancellationToken,
    relay: JoinHandle<&'static str>,
}

/// Per-application session state
enum LspSlot {
    Idle,
    Active(ActiveSession),
}

impl LspSlot {
    /// Active only while the relay is still running
    fn normalize(&mut self) {
        if matches!(self, Self::Active(session) if session.relay.is_finished()) {
            *self = Self::Idle;
        }
    }
}

/// Snapshot of an active session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub started_at: DateTime<Utc>,
    pub last_acknowledged: Option<String>,
    pub messages: u64,
}

/// Owns every application's language server slot
pub struct LspBroker {
    runtime: Arc<dyn ContainerRuntime>,
    config: LspConfig,
    slots: Mutex<HashMap<AppId, Arc<tokio::sync::Mutex<LspSlot>>>>,
    next_session: AtomicU64,
}

impl LspBroker {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: LspConfig) -> Self {
        Self {
            runtime,
            config,
            slots: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    fn slot(&self, app_id: &AppId) -> Arc<tokio::sync::Mutex<LspSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(app_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(LspSlot::Idle))),
        )
    }

    async fn shutdown(session: ActiveSession) {
        session.cancel.cancel();
        let mut relay = session.relay;
        match tokio::time::timeout(TERMINATE_GRACE, &mut relay).await {
            Ok(Ok(reason)) => debug!(session_id = session.id, reason, "LSP session ended"),
            Ok(Err(e)) => warn!(session_id = session.id, "LSP relay failed: {}", e),
            Err(_) => {
                warn!(session_id = session.id, "LSP relay did not stop in time, aborting");
                relay.abort();
                let _ = relay.await;
            }
        }
    }

    /// Start a session, replacing any active one
    pub async fn attach(&self, ctx: &AppContext) -> Result<LspClient> {
        let unavailable = |message: String| CradleError::LspUnavailable {
            app_id: ctx.app_id.to_string(),
            message,
        };
        let container_id = ctx
            .container_id
            .as_deref()
            .ok_or_else(|| unavailable("application has no container".to_string()))?;

        let slot = self.slot(&ctx.app_id);
        let mut slot = slot.lock().await;
        if let LspSlot::Active(previous) = std::mem::replace(&mut *slot, LspSlot::Idle) {
            info!(
                app_id = %ctx.app_id,
                session_id = previous.id,
                "Replacing active LSP session"
            );
            Self::shutdown(previous).await;
        }

        let process = self
            .runtime
            .spawn(container_id, &self.config.command)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let (to_server, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_client, from_server) = mpsc::channel(CHANNEL_CAPACITY);
        let cursor = Arc::new(Mutex::new(ProtocolCursor::default()));
        let cancel = CancellationToken::new();
        let relay = tokio::spawn(
            relay(
                process,
                from_client,
                to_client,
                cancel.clone(),
                Arc::clone(&cursor),
                self.config.idle_timeout,
                self.config.chunk_size,
            )
            .instrument(lsp_span(ctx.app_id.as_str(), id)),
        );

        *slot = LspSlot::Active(ActiveSession {
            id,
            started_at: Utc::now(),
            cursor,
            cancel,
            relay,
        });
        info!(app_id = %ctx.app_id, session_id = id, "LSP session attached");
        Ok(LspClient {
            session_id: id,
            to_server,
            from_server,
        })
    }

    /// End the active session, if any, and wait for its process to be killed
    pub async fn terminate(&self, app_id: &AppId) {
        let slot = self.slot(app_id);
        let mut slot = slot.lock().await;
        if let LspSlot::Active(session) = std::mem::replace(&mut *slot, LspSlot::Idle) {
            Self::shutdown(session).await;
        }
    }

    /// Terminate and forget a deleted application's slot
    pub async fn remove(&self, app_id: &AppId) {
        self.terminate(app_id).await;
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app_id);
    }

    pub async fn session(&self, app_id: &AppId) -> Option<SessionInfo> {
        let slot = self.slot(app_id);
        let mut slot = slot.lock().await;
        slot.normalize();
        match &*slot {
            LspSlot::Idle => None,
            LspSlot::Active(session) => {
                let cursor = session.cursor.lock().unwrap_or_else(PoisonError::into_inner);
                Some(SessionInfo {
                    session_id: session.id,
                    started_at: session.started_at,
                    last_acknowledged: cursor.last_acknowledged().map(str::to_string),
                    messages: cursor.messages(),
                })
            }
        }
    }
}

/// Copy bytes between the editor channels and the process until one side ends
async fn relay(
    mut process: ProcessHandle,
    mut from_client: mpsc::Receiver<Bytes>,
    to_client: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    cursor: Arc<Mutex<ProtocolCursor>>,
    idle_timeout: Duration,
    chunk_size: usize,
) -> &'static str {
    let mut buf = vec![0u8; chunk_size];
    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => break "terminated",
            _ = tokio::time::sleep(idle_timeout) => break "idle timeout",
            message = from_client.recv() => match message {
                Some(bytes) => {
                    if process.stdin.write_all(&bytes).await.is_err()
                        || process.stdin.flush().await.is_err()
                    {
                        break "server stdin closed";
                    }
                }
                None => break "client disconnected",
            },
            read = process.stdout.read(&mut buf) => match read {
                Ok(0) | Err(_) => break "server exited",
                Ok(n) => {
                    cursor
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .observe(&buf[..n]);
                    tokio::select! {
                        _ = cancel.cancelled() => break "terminated",
                        sent = to_client.send(Bytes::copy_from_slice(&buf[..n])) => {
                            if sent.is_err() {
                                break "client disconnected";
                            }
                        }
                    }
                }
            },
        }
    };
    if let Err(e) = process.control.kill().await {
        warn!("Failed to kill language server: {}", e);
    }
    debug!(reason, "LSP relay finished");
    reason
}
