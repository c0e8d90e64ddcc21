//! Engine bridge - one supervised worker multiplexed over its stdin/stdout.
//!
//! Three tasks per started bridge:
//! - the reader routes every stdout line (ready gate, requests, sessions)
//! - the supervisor watches for exit, end of output, write failure or stop,
//!   and runs the failure sweep exactly once
//! - the stderr forwarder re-emits worker logs
//!
//! Writes are serialized through one writer lock so lines never interleave.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bridge::codec::{Diagnostic, DiagnosticReason, InboundFrame, JsonLineCodec};
use crate::bridge::protocol::{
    CorrelationId, InboundMessage, MessageTarget, OutboundMessage, RESERVED_FIELDS,
    ResponseStatus, StreamChunk,
};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, StartupError};
use crate::readiness::{Readiness, ReadinessGate};
use crate::registry::{ChunkDelivery, EntryGuard, EntryKind, Registry};
use crate::stream::ChunkStream;
use crate::supervisor::{Termination, WorkerInput, WorkerIo, WorkerOutput, WorkerProcess};
use crate::worker_log;

type InputSink = FramedWrite<WorkerInput, JsonLineCodec>;
type OutputFrames = FramedRead<WorkerOutput, JsonLineCodec>;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Engine bridge mutex poisoned - continuing with inner state");
        poisoned.into_inner()
    })
}

struct Shared {
    config: BridgeConfig,
    gate: ReadinessGate,
    registry: Arc<Registry>,
    input: Mutex<Option<InputSink>>,
    handshake: StdMutex<Option<Value>>,
    shutdown: CancellationToken,
    write_failed: CancellationToken,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to a supervised worker.
///
/// Cheap to clone. When the last clone is dropped the worker is shut down as
/// if [`stop`](Self::stop) had been called.
#[derive(Clone)]
pub struct EngineBridge {
    shared: Arc<Shared>,
    _stop_on_drop: Arc<DropGuard>,
}

impl EngineBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let shutdown = CancellationToken::new();
        let guard = shutdown.clone().drop_guard();
        Self {
            shared: Arc::new(Shared {
                config,
                gate: ReadinessGate::new(),
                registry: Registry::new(),
                input: Mutex::new(None),
                handshake: StdMutex::new(None),
                shutdown,
                write_failed: CancellationToken::new(),
                supervisor: StdMutex::new(None),
            }),
            _stop_on_drop: Arc::new(guard),
        }
    }

    /// Spawn the worker and wait for its ready handshake.
    ///
    /// On failure the worker (if any) is stopped; the bridge cannot be restarted.
    pub async fn start(&self) -> Result<(), StartupError> {
        let shared = &self.shared;
        shared.gate.begin()?;

        let io = match shared.config.spawner.spawn() {
            Ok(io) => io,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start worker");
                shared.gate.fail(e.clone());
                shared.terminate(&Termination::Stopped);
                return Err(e);
            }
        };
        self.attach(io).await;

        let startup_timeout = shared.config.startup_timeout;
        tracing::debug!(
            timeout_ms = startup_timeout.as_millis() as u64,
            "Waiting for worker ready"
        );
        let outcome = match tokio::time::timeout(startup_timeout, shared.gate.wait_ready()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                shared.gate.fail(StartupError::Timeout(startup_timeout));
                // Ready may have won the race; the gate has the final word.
                shared.gate.wait_ready().await
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!("Engine ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker failed to become ready");
                self.stop().await;
                Err(e)
            }
        }
    }

    async fn attach(&self, io: WorkerIo) {
        let shared = &self.shared;
        let WorkerIo {
            stdin,
            stdout,
            stderr,
            process,
        } = io;
        tracing::info!(pid = ?process.id(), "Worker started");

        *shared.input.lock().await = Some(FramedWrite::new(stdin, JsonLineCodec::new()));
        if let Some(stderr) = stderr {
            worker_log::forward_stderr(stderr, shared.config.max_line_length);
        }

        let frames = FramedRead::new(
            stdout,
            JsonLineCodec::with_max_line_length(shared.config.max_line_length),
        );
        let reader = tokio::spawn(read_worker_output(Arc::clone(shared), frames));
        let supervisor = tokio::spawn(supervise(Arc::clone(shared), process, reader));
        *lock(&shared.supervisor) = Some(supervisor);
    }

    /// Stop the worker and fail everything outstanding with `EngineStopped`.
    ///
    /// Idempotent. Closes the worker's stdin, then escalates to SIGTERM and
    /// finally a kill if it does not exit within the shutdown grace.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let supervisor = lock(&self.shared.supervisor).take();
        match supervisor {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Worker supervisor task failed");
                }
            }
            None => self.shared.terminate(&Termination::Stopped),
        }
    }

    /// Unary request with the configured request timeout.
    pub async fn send(&self, action: &str, payload: Value) -> Result<Value, BridgeError> {
        self.send_with_timeout(action, payload, self.shared.config.request_timeout)
            .await
    }

    /// Unary request with an explicit timeout.
    ///
    /// `payload` must be a JSON object (or null); its fields are sent next to
    /// `id`, `action` and `timestamp`. Dropping the returned future abandons
    /// the request.
    pub async fn send_with_timeout(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let shared = &self.shared;
        shared.gate.ensure_ready()?;
        let fields = request_fields(payload)?;

        let id = CorrelationId::new();
        let mut completion = shared.registry.register_request(id, action, timeout)?;
        let _guard = EntryGuard::new(Arc::clone(&shared.registry), id, EntryKind::Request);

        tracing::debug!(target: "ragbridge::request", %id, action, "Sending request");
        let message = OutboundMessage::new(id, action, fields);
        tokio::select! {
            biased;
            settled = &mut completion => {
                return settled.unwrap_or(Err(BridgeError::EngineStopped));
            }
            () = shared.write(&message) => {}
        }
        completion.await.unwrap_or(Err(BridgeError::EngineStopped))
    }

    /// Open a streaming session.
    ///
    /// The session's timeout (`stream_timeout`) covers the whole exchange.
    pub async fn open_stream(&self, action: &str, payload: Value) -> Result<ChunkStream, BridgeError> {
        let shared = &self.shared;
        shared.gate.ensure_ready()?;
        let fields = request_fields(payload)?;

        let id = CorrelationId::new();
        let timeout = shared.config.stream_timeout;
        let receiver = shared.registry.register_session(id, action, timeout)?;
        let guard = EntryGuard::new(Arc::clone(&shared.registry), id, EntryKind::Session);

        tracing::debug!(target: "ragbridge::request", %id, action, "Opening stream");
        let message = OutboundMessage::new(id, action, fields);
        if tokio::time::timeout(timeout, shared.write(&message)).await.is_err() {
            // The session timer has already failed the stream.
            tracing::warn!(target: "ragbridge::request", %id, "Worker input blocked for the whole session");
        }
        Ok(ChunkStream::new(id, receiver, guard))
    }

    /// Streaming request delivering every chunk to `on_chunk` in arrival order.
    ///
    /// Resolves after the terminal chunk, or with the session's failure.
    pub async fn send_streaming<F>(
        &self,
        action: &str,
        payload: Value,
        on_chunk: F,
    ) -> Result<(), BridgeError>
    where
        F: FnMut(StreamChunk),
    {
        self.open_stream(action, payload)
            .await?
            .for_each_chunk(on_chunk)
            .await
    }

    /// Payload of the worker's ready message.
    pub fn handshake(&self) -> Option<Value> {
        lock(&self.shared.handshake).clone()
    }

    pub fn readiness(&self) -> Readiness {
        self.shared.gate.current()
    }

    pub fn is_ready(&self) -> bool {
        self.readiness().is_ready()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.registry.pending_requests()
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.registry.open_sessions()
    }
}

fn request_fields(payload: Value) -> Result<Map<String, Value>, BridgeError> {
    let fields = match payload {
        Value::Null => Map::new(),
        Value::Object(fields) => fields,
        other => {
            return Err(BridgeError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )));
        }
    };
    if let Some(key) = RESERVED_FIELDS.iter().find(|key| fields.contains_key(**key)) {
        return Err(BridgeError::InvalidPayload(format!(
            "`{key}` is set by the bridge"
        )));
    }
    Ok(fields)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Shared {
    /// Close the gate and sweep the registry. Only the first call has effect.
    fn terminate(&self, cause: &Termination) {
        self.gate.close(cause);
        if let Some(swept) = self.registry.close(cause) {
            if swept.requests + swept.sessions > 0 {
                tracing::warn!(
                    cause = ?cause,
                    requests = swept.requests,
                    sessions = swept.sessions,
                    "Failing outstanding work"
                );
            }
            tracing::info!(cause = ?cause, "Engine bridge closed");
        }
    }

    async fn write(&self, message: &OutboundMessage) {
        let mut input = self.input.lock().await;
        let Some(sink) = input.as_mut() else {
            // Input is only closed after the sweep, which already settled this entry.
            tracing::debug!(id = %message.id, "Worker input already closed");
            return;
        };
        if let Err(e) = sink.send(message).await {
            drop(input);
            tracing::error!(error = %e, "Failed to write to worker");
            self.terminate(&Termination::Transport(format!("write failed: {e}")));
            self.write_failed.cancel();
        }
    }

    async fn close_input(&self) {
        match tokio::time::timeout(self.config.shutdown_grace, self.input.lock()).await {
            Ok(mut input) => {
                input.take();
            }
            Err(_) => tracing::warn!("Worker input still busy; leaving it to the process exit"),
        }
    }

    fn route(&self, msg: InboundMessage) {
        match msg.target() {
            MessageTarget::Ready => self.on_ready(msg),
            MessageTarget::Request(id) => self.on_response(id, msg),
            MessageTarget::Unknown(other) => {
                tracing::warn!(
                    target: "ragbridge::diagnostic",
                    id = other,
                    status = ?msg.status,
                    error = ?msg.error,
                    "Message for an id the bridge never issued"
                );
            }
        }
    }

    fn on_ready(&self, msg: InboundMessage) {
        match msg.status {
            ResponseStatus::Success => {
                if self.gate.current() != Readiness::AwaitingReady {
                    tracing::warn!(target: "ragbridge::diagnostic", "Ignoring duplicate ready message");
                    return;
                }
                *lock(&self.handshake) = Some(msg.into_data());
                self.gate.mark_ready();
                tracing::debug!("Worker signalled ready");
            }
            ResponseStatus::Error => {
                let error = msg.into_worker_error();
                if self.gate.current() != Readiness::AwaitingReady {
                    tracing::warn!(
                        target: "ragbridge::diagnostic",
                        code = %error.code,
                        "Ignoring duplicate ready message with error status"
                    );
                    return;
                }
                tracing::error!(code = %error.code, message = %error.message, "Worker rejected startup");
                self.gate.fail(StartupError::Rejected(error));
            }
            ResponseStatus::Streaming => {
                tracing::warn!(target: "ragbridge::diagnostic", "Streaming message with the ready id");
            }
        }
    }

    fn on_response(&self, id: CorrelationId, msg: InboundMessage) {
        let status = msg.status;
        let Some(kind) = self.registry.kind_of(&id) else {
            tracing::debug!(target: "ragbridge::diagnostic", %id, ?status, "Dropping response for settled request");
            return;
        };
        let settled = match (status, kind) {
            (ResponseStatus::Success, EntryKind::Request) => {
                self.registry.resolve_request(&id, Ok(msg.into_data()))
            }
            (ResponseStatus::Error, EntryKind::Request) => self
                .registry
                .resolve_request(&id, Err(BridgeError::Worker(msg.into_worker_error()))),
            (ResponseStatus::Streaming, EntryKind::Request) => {
                tracing::warn!(
                    target: "ragbridge::diagnostic",
                    %id,
                    "Protocol violation: streaming message for a unary request"
                );
                true
            }
            (ResponseStatus::Success, EntryKind::Session) => {
                let done = StreamChunk::done_with(msg.into_data());
                self.registry.deliver_chunk(&id, done) != ChunkDelivery::NotFound
            }
            (ResponseStatus::Error, EntryKind::Session) => self
                .registry
                .fail_session(&id, BridgeError::Worker(msg.into_worker_error())),
            (ResponseStatus::Streaming, EntryKind::Session) => {
                match serde_json::from_value::<StreamChunk>(msg.into_data()) {
                    Ok(chunk) => self.registry.deliver_chunk(&id, chunk) != ChunkDelivery::NotFound,
                    Err(e) => {
                        tracing::warn!(target: "ragbridge::diagnostic", %id, error = %e, "Malformed stream chunk");
                        true
                    }
                }
            }
        };
        if !settled {
            tracing::debug!(target: "ragbridge::diagnostic", %id, ?status, "Dropping response for settled request");
        }
    }
}

fn log_diagnostic(diagnostic: &Diagnostic) {
    match &diagnostic.reason {
        DiagnosticReason::NotJson => {
            tracing::info!(target: "ragbridge::diagnostic", line = %diagnostic.line, "Non-protocol output from worker");
        }
        DiagnosticReason::NotProtocol(reason) => {
            tracing::warn!(
                target: "ragbridge::diagnostic",
                line = %diagnostic.line,
                reason = %reason,
                "Unrecognized JSON from worker"
            );
        }
        DiagnosticReason::Oversized => {
            tracing::warn!(target: "ragbridge::diagnostic", "Discarded oversized line from worker");
        }
    }
}

enum ReaderExit {
    Eof,
    Failed(String),
}

async fn read_worker_output(shared: Arc<Shared>, mut frames: OutputFrames) -> ReaderExit {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(InboundFrame::Message(msg)) => shared.route(msg),
            Ok(InboundFrame::Diagnostic(diagnostic)) => log_diagnostic(&diagnostic),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read worker output");
                return ReaderExit::Failed(e.to_string());
            }
        }
    }
    tracing::debug!("Worker output closed");
    ReaderExit::Eof
}

fn log_exit(status: std::io::Result<Option<i32>>) -> Option<i32> {
    match status {
        Ok(exit_code) => {
            tracing::info!(exit_code = ?exit_code, "Worker exited");
            exit_code
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to wait for worker");
            None
        }
    }
}

async fn kill_worker(process: &mut dyn WorkerProcess) {
    if let Err(e) = process.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}

/// Watch the worker until it is gone, then sweep with the cause.
async fn supervise(
    shared: Arc<Shared>,
    mut process: Box<dyn WorkerProcess>,
    mut reader: JoinHandle<ReaderExit>,
) {
    let drain = shared.config.exit_drain_grace;
    let cause = tokio::select! {
        status = process.wait() => {
            let exit_code = log_exit(status);
            // Let the reader route what the worker wrote before exiting.
            if tokio::time::timeout(drain, &mut reader).await.is_err() {
                tracing::debug!("Worker output still open after exit");
            }
            Termination::Exited { exit_code }
        }
        exit = &mut reader => {
            let exit = exit.unwrap_or_else(|e| ReaderExit::Failed(format!("reader task failed: {e}")));
            match exit {
                ReaderExit::Eof => match tokio::time::timeout(drain, process.wait()).await {
                    Ok(status) => Termination::Exited { exit_code: log_exit(status) },
                    Err(_) => {
                        tracing::warn!("Worker closed its output but kept running; killing it");
                        shared.terminate(&Termination::OutputClosed);
                        kill_worker(process.as_mut()).await;
                        Termination::OutputClosed
                    }
                },
                ReaderExit::Failed(reason) => {
                    let cause = Termination::Transport(reason);
                    shared.terminate(&cause);
                    kill_worker(process.as_mut()).await;
                    cause
                }
            }
        }
        () = shared.write_failed.cancelled() => {
            kill_worker(process.as_mut()).await;
            Termination::Transport("write to worker failed".to_string())
        }
        () = shared.shutdown.cancelled() => {
            shared.terminate(&Termination::Stopped);
            shut_down(&shared, process.as_mut()).await;
            Termination::Stopped
        }
    };
    shared.terminate(&cause);
    reader.abort();
    shared.close_input().await;
}

async fn shut_down(shared: &Shared, process: &mut dyn WorkerProcess) {
    let grace = shared.config.shutdown_grace;

    // The worker exits on end of input.
    shared.close_input().await;
    if let Ok(status) = tokio::time::timeout(grace, process.wait()).await {
        log_exit(status);
        return;
    }

    tracing::info!(grace_ms = grace.as_millis() as u64, "Worker still running; sending SIGTERM");
    if let Err(e) = process.terminate() {
        tracing::debug!(error = %e, "Failed to signal worker");
    }
    if let Ok(status) = tokio::time::timeout(grace, process.wait()).await {
        log_exit(status);
        return;
    }

    tracing::warn!("Worker ignored SIGTERM; killing it");
    kill_worker(process).await;
}
