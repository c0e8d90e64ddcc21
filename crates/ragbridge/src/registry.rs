//! Correlation registry - pending unary requests and open streaming sessions.
//!
//! Both maps live behind one mutex together with the `closed` flag, so a
//! failure sweep and a new registration can never interleave: anything
//! registered before the sweep is failed by it, anything after is refused.
//!
//! Removing an entry from its map is the claim on its completion. Whoever
//! removes it (response, error, timeout, sweep, or the caller dropping its
//! handle) settles it; everyone else finds nothing and does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::bridge::protocol::{CorrelationId, StreamChunk};
use crate::error::BridgeError;
use crate::supervisor::Termination;

pub(crate) type RequestResult = Result<Value, BridgeError>;
pub(crate) type SessionResult = Result<(), BridgeError>;

struct PendingRequest {
    action: String,
    completion: oneshot::Sender<RequestResult>,
    deadline: AbortHandle,
    sent_at: Instant,
}

struct StreamSession {
    action: String,
    chunks: mpsc::UnboundedSender<StreamChunk>,
    completion: oneshot::Sender<SessionResult>,
    deadline: AbortHandle,
    opened_at: Instant,
}

#[derive(Default)]
struct State {
    pending: HashMap<CorrelationId, PendingRequest>,
    sessions: HashMap<CorrelationId, StreamSession>,
    closed: Option<Termination>,
}

/// Which map an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Request,
    Session,
}

/// Outcome of routing a streaming chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkDelivery {
    Delivered,
    /// Terminal chunk; the session is closed.
    Finished,
    NotFound,
}

/// Receiving half of a registered session.
pub(crate) struct SessionReceiver {
    pub chunks: mpsc::UnboundedReceiver<StreamChunk>,
    pub completion: oneshot::Receiver<SessionResult>,
}

/// Number of entries failed by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Swept {
    pub requests: usize,
    pub sessions: usize,
}

#[derive(Default)]
pub(crate) struct Registry {
    state: StdMutex<State>,
}

impl Registry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Correlation registry mutex poisoned - continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    fn arm<F>(self: &Arc<Self>, timeout: Duration, expire: F) -> AbortHandle
    where
        F: FnOnce(&Registry) + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&registry);
        })
        .abort_handle()
    }

    /// Register a unary request; its timer starts now.
    pub(crate) fn register_request(
        self: &Arc<Self>,
        id: CorrelationId,
        action: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<RequestResult>, BridgeError> {
        let mut state = self.lock();
        if let Some(cause) = &state.closed {
            return Err(cause.to_error());
        }
        let (tx, rx) = oneshot::channel();
        let deadline = self.arm(timeout, move |r| r.expire_request(id, timeout));
        state.pending.insert(
            id,
            PendingRequest {
                action: action.to_string(),
                completion: tx,
                deadline,
                sent_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Register a streaming session; its timer starts now.
    pub(crate) fn register_session(
        self: &Arc<Self>,
        id: CorrelationId,
        action: &str,
        timeout: Duration,
    ) -> Result<SessionReceiver, BridgeError> {
        let mut state = self.lock();
        if let Some(cause) = &state.closed {
            return Err(cause.to_error());
        }
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let deadline = self.arm(timeout, move |r| r.expire_session(id, timeout));
        state.sessions.insert(
            id,
            StreamSession {
                action: action.to_string(),
                chunks: chunk_tx,
                completion: done_tx,
                deadline,
                opened_at: Instant::now(),
            },
        );
        Ok(SessionReceiver {
            chunks: chunk_rx,
            completion: done_rx,
        })
    }

    pub(crate) fn kind_of(&self, id: &CorrelationId) -> Option<EntryKind> {
        let state = self.lock();
        if state.pending.contains_key(id) {
            Some(EntryKind::Request)
        } else if state.sessions.contains_key(id) {
            Some(EntryKind::Session)
        } else {
            None
        }
    }

    /// Settle a unary request. False when nothing was pending under `id`.
    pub(crate) fn resolve_request(&self, id: &CorrelationId, result: RequestResult) -> bool {
        let Some(request) = self.lock().pending.remove(id) else {
            return false;
        };
        request.deadline.abort();
        tracing::debug!(
            target: "ragbridge::request",
            %id,
            action = %request.action,
            ok = result.is_ok(),
            elapsed_ms = request.sent_at.elapsed().as_millis() as u64,
            "Request settled"
        );
        let _ = request.completion.send(result);
        true
    }

    /// Route one chunk to its session, closing it on a terminal chunk.
    pub(crate) fn deliver_chunk(&self, id: &CorrelationId, chunk: StreamChunk) -> ChunkDelivery {
        let mut state = self.lock();
        if !chunk.is_terminal() {
            return match state.sessions.get(id) {
                Some(session) => {
                    // Receiver gone means the caller is dropping the stream.
                    let _ = session.chunks.send(chunk);
                    ChunkDelivery::Delivered
                }
                None => ChunkDelivery::NotFound,
            };
        }
        let Some(session) = state.sessions.remove(id) else {
            return ChunkDelivery::NotFound;
        };
        drop(state);
        session.deadline.abort();
        tracing::debug!(
            target: "ragbridge::request",
            %id,
            action = %session.action,
            elapsed_ms = session.opened_at.elapsed().as_millis() as u64,
            "Stream finished"
        );
        let _ = session.chunks.send(chunk);
        let _ = session.completion.send(Ok(()));
        ChunkDelivery::Finished
    }

    /// Fail an open session. False when nothing was open under `id`.
    pub(crate) fn fail_session(&self, id: &CorrelationId, error: BridgeError) -> bool {
        let Some(session) = self.lock().sessions.remove(id) else {
            return false;
        };
        session.deadline.abort();
        tracing::debug!(
            target: "ragbridge::request",
            %id,
            action = %session.action,
            error = %error,
            "Stream failed"
        );
        let _ = session.completion.send(Err(error));
        true
    }

    fn expire_request(&self, id: CorrelationId, timeout: Duration) {
        let Some(request) = self.lock().pending.remove(&id) else {
            return;
        };
        tracing::warn!(
            target: "ragbridge::request",
            %id,
            action = %request.action,
            timeout_ms = timeout.as_millis() as u64,
            "Request timed out"
        );
        let _ = request
            .completion
            .send(Err(BridgeError::RequestTimeout(timeout)));
    }

    fn expire_session(&self, id: CorrelationId, timeout: Duration) {
        let Some(session) = self.lock().sessions.remove(&id) else {
            return;
        };
        tracing::warn!(
            target: "ragbridge::request",
            %id,
            action = %session.action,
            timeout_ms = timeout.as_millis() as u64,
            "Streaming session timed out"
        );
        let _ = session
            .completion
            .send(Err(BridgeError::StreamingTimeout(timeout)));
    }

    /// Drop an entry whose caller went away. Nobody is notified.
    pub(crate) fn cancel(&self, id: &CorrelationId, kind: EntryKind) -> bool {
        let mut state = self.lock();
        let deadline = match kind {
            EntryKind::Request => state.pending.remove(id).map(|r| r.deadline),
            EntryKind::Session => state.sessions.remove(id).map(|s| s.deadline),
        };
        drop(state);
        match deadline {
            Some(deadline) => {
                deadline.abort();
                tracing::debug!(target: "ragbridge::request", %id, ?kind, "Caller dropped");
                true
            }
            None => false,
        }
    }

    /// Fail everything outstanding and refuse future registrations.
    ///
    /// Returns `None` if the registry was already closed.
    pub(crate) fn close(&self, cause: &Termination) -> Option<Swept> {
        let (pending, sessions) = {
            let mut state = self.lock();
            if state.closed.is_some() {
                return None;
            }
            state.closed = Some(cause.clone());
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.sessions),
            )
        };
        let swept = Swept {
            requests: pending.len(),
            sessions: sessions.len(),
        };
        let error = cause.to_error();
        for (_, request) in pending {
            request.deadline.abort();
            let _ = request.completion.send(Err(error.clone()));
        }
        for (_, session) in sessions {
            session.deadline.abort();
            let _ = session.completion.send(Err(error.clone()));
        }
        Some(swept)
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }
}

/// Deregisters an entry when the caller's future or stream is dropped.
pub(crate) struct EntryGuard {
    registry: Arc<Registry>,
    id: CorrelationId,
    kind: EntryKind,
}

impl EntryGuard {
    pub(crate) fn new(registry: Arc<Registry>, id: CorrelationId, kind: EntryKind) -> Self {
        Self { registry, id, kind }
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.registry.cancel(&self.id, self.kind);
    }
}
