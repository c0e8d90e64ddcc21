//! Bridge configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;
use crate::supervisor::{ProcessSpawner, WorkerLocator, WorkerSpawner};

pub const STARTUP_TIMEOUT_ENV: &str = "RAG_ENGINE_STARTUP_TIMEOUT";
pub const REQUEST_TIMEOUT_ENV: &str = "RAG_ENGINE_REQUEST_TIMEOUT";
pub const STREAM_TIMEOUT_ENV: &str = "RAG_ENGINE_STREAM_TIMEOUT";

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct BridgeConfig {
    /// Window for the worker's ready handshake.
    pub startup_timeout: Duration,
    /// Default deadline for unary requests.
    pub request_timeout: Duration,
    /// Deadline for a whole streaming session.
    pub stream_timeout: Duration,
    /// How long `stop()` waits after closing stdin, and again after SIGTERM.
    pub shutdown_grace: Duration,
    /// How long buffered stdout may still be routed after the worker exits.
    pub exit_drain_grace: Duration,
    pub max_line_length: usize,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("startup_timeout", &self.startup_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("stream_timeout", &self.stream_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("exit_drain_grace", &self.exit_drain_grace)
            .field("max_line_length", &self.max_line_length)
            .finish_non_exhaustive()
    }
}

impl BridgeConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            shutdown_grace: Duration::from_secs(5),
            exit_drain_grace: Duration::from_secs(1),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            spawner,
        }
    }

    /// Spawn the worker found by `locator` as a child process.
    pub fn with_locator(locator: WorkerLocator) -> Self {
        Self::new(Arc::new(ProcessSpawner::new(locator)))
    }

    /// Python engine in `engine_dir`, honouring every environment override.
    pub fn python_engine(engine_dir: impl AsRef<Path>) -> Self {
        Self::with_locator(WorkerLocator::python_engine(engine_dir).with_env_overrides())
            .with_env_overrides()
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_exit_drain_grace(mut self, grace: Duration) -> Self {
        self.exit_drain_grace = grace;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    /// Apply `RAG_ENGINE_*_TIMEOUT` from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply timeout overrides (seconds, fractional allowed) from `lookup`.
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str, current: Duration| match lookup(key) {
            None => current,
            Some(raw) => parse_seconds(&raw).unwrap_or_else(|| {
                tracing::warn!(key, value = %raw, "Ignoring invalid timeout override");
                current
            }),
        };
        self.startup_timeout = read(STARTUP_TIMEOUT_ENV, self.startup_timeout);
        self.request_timeout = read(REQUEST_TIMEOUT_ENV, self.request_timeout);
        self.stream_timeout = read(STREAM_TIMEOUT_ENV, self.stream_timeout);
        self
    }
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    let secs = raw.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok().filter(|d| !d.is_zero())
}
