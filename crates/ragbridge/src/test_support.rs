//! In-memory worker for bridge tests.
//!
//! The bridge side gets duplex pipes and a [`WorkerProcess`] whose exit is
//! driven by the test through [`FakeWorker::exit`].

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::config::BridgeConfig;
use crate::engine::EngineBridge;
use crate::error::StartupError;
use crate::supervisor::{WorkerIo, WorkerOutput, WorkerProcess, WorkerSpawner};

pub(crate) const SHORT: Duration = Duration::from_millis(50);

type ExitSignal = watch::Sender<Option<Option<i32>>>;

struct FakeProcess {
    exit: watch::Receiver<Option<Option<i32>>>,
    signal: Arc<ExitSignal>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let state = self
            .exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| io::Error::other("exit signal dropped"))?;
        let code = *state;
        Ok(code.flatten())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.signal.send_replace(Some(None));
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.signal.send_replace(Some(None));
        Ok(())
    }
}

pub(crate) struct FakeSpawner(StdMutex<Option<WorkerIo>>);

impl WorkerSpawner for FakeSpawner {
    fn spawn(&self) -> Result<WorkerIo, StartupError> {
        self.0.lock().unwrap().take().ok_or_else(|| StartupError::Spawn {
            program: PathBuf::from("fake-worker"),
            reason: "already spawned".to_string(),
        })
    }
}

/// Test side of the worker's standard streams.
pub(crate) struct FakeWorker {
    requests: Option<FramedRead<DuplexStream, LinesCodec>>,
    responses: DuplexStream,
    exit: Arc<ExitSignal>,
}

impl FakeWorker {
    /// Next request line, `None` once the bridge closed the worker's stdin.
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        let line = self.requests.as_mut()?.next().await?.unwrap();
        Some(serde_json::from_str(&line).unwrap())
    }

    pub(crate) async fn send_line(&mut self, line: &str) {
        self.responses.write_all(line.as_bytes()).await.unwrap();
        self.responses.write_all(b"\n").await.unwrap();
    }

    pub(crate) async fn reply(&mut self, message: Value) {
        self.send_line(&message.to_string()).await;
    }

    pub(crate) async fn ready(&mut self) {
        self.reply(json!({
            "id": "ready",
            "status": "success",
            "timestamp": "2024-05-01T12:00:00",
            "data": {"message": "Engine ready"}
        }))
        .await;
    }

    pub(crate) async fn succeed(&mut self, request: &Value, data: Value) {
        self.reply(json!({"id": request["id"], "status": "success", "data": data}))
            .await;
    }

    pub(crate) async fn chunk(&mut self, request: &Value, data: Value) {
        self.reply(json!({"id": request["id"], "status": "streaming", "data": data}))
            .await;
    }

    pub(crate) fn exit(&self, code: Option<i32>) {
        self.exit.send_replace(Some(code));
    }

    /// End the worker's stdout while the process keeps running.
    pub(crate) async fn close_output(&mut self) {
        self.responses.shutdown().await.unwrap();
    }

    /// Stop reading stdin; further writes by the bridge fail.
    pub(crate) fn close_input(&mut self) {
        self.requests = None;
    }
}

/// Stdout tail that fails every read.
struct ResetOutput;

impl AsyncRead for ResetOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        )))
    }
}

pub(crate) fn fake_worker() -> (FakeSpawner, FakeWorker) {
    fake_worker_with(|stdout| Box::new(stdout) as WorkerOutput)
}

/// A worker whose stdout fails with a read error once
/// [`FakeWorker::close_output`] ends it.
pub(crate) fn fake_worker_with_read_error() -> (FakeSpawner, FakeWorker) {
    fake_worker_with(|stdout| Box::new(stdout.chain(ResetOutput)) as WorkerOutput)
}

fn fake_worker_with(
    stdout: impl FnOnce(DuplexStream) -> WorkerOutput,
) -> (FakeSpawner, FakeWorker) {
    let (bridge_stdin, worker_stdin) = tokio::io::duplex(64 * 1024);
    let (worker_stdout, bridge_stdout) = tokio::io::duplex(64 * 1024);
    let (exit_tx, exit_rx) = watch::channel(None);
    let exit_tx = Arc::new(exit_tx);
    let io = WorkerIo {
        stdin: Box::new(bridge_stdin),
        stdout: stdout(bridge_stdout),
        stderr: None,
        process: Box::new(FakeProcess {
            exit: exit_rx,
            signal: Arc::clone(&exit_tx),
        }),
    };
    let worker = FakeWorker {
        requests: Some(FramedRead::new(worker_stdin, LinesCodec::new())),
        responses: worker_stdout,
        exit: exit_tx,
    };
    (FakeSpawner(StdMutex::new(Some(io))), worker)
}

pub(crate) fn test_config(spawner: FakeSpawner) -> BridgeConfig {
    BridgeConfig::new(Arc::new(spawner))
        .with_startup_timeout(Duration::from_secs(2))
        .with_request_timeout(Duration::from_secs(2))
        .with_stream_timeout(Duration::from_secs(2))
        .with_shutdown_grace(SHORT)
        .with_exit_drain_grace(SHORT)
}

/// A bridge that has completed its handshake with a fake worker.
pub(crate) async fn started() -> (EngineBridge, FakeWorker) {
    started_with(fake_worker()).await
}

pub(crate) async fn started_with(
    (spawner, mut worker): (FakeSpawner, FakeWorker),
) -> (EngineBridge, FakeWorker) {
    let bridge = EngineBridge::new(test_config(spawner));
    worker.ready().await;
    bridge.start().await.unwrap();
    (bridge, worker)
}
