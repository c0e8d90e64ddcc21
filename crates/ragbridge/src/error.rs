//! Error taxonomy for the engine bridge.
//!
//! Setup problems ([`StartupError`]), caller and transport failures
//! ([`BridgeError`]) and worker-reported failures ([`WorkerError`]) are kept
//! apart so callers can show the right remediation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker-supplied error, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct WorkerError {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Well-known worker error codes.
pub mod codes {
    pub const OLLAMA_NOT_RUNNING: &str = "OLLAMA_NOT_RUNNING";
    pub const DEPENDENCY_UNAVAILABLE: &str = "DEPENDENCY_UNAVAILABLE";
    pub const MODEL_NOT_FOUND: &str = "MODEL_NOT_FOUND";
    pub const NO_INDEX: &str = "NO_INDEX";
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const MISSING_PATH: &str = "MISSING_PATH";
    pub const MISSING_QUERY: &str = "MISSING_QUERY";
    pub const MISSING_KEY: &str = "MISSING_KEY";
    pub const INVALID_OPERATION: &str = "INVALID_OPERATION";
    /// Synthesized when an error message carries no error object.
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// Coarse classification of a worker error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    /// A runtime dependency of the worker (e.g. the model server) is not reachable.
    DependencyUnavailable,
    ModelNotFound,
    NoIndex,
    /// The request itself was rejected.
    InvalidRequest,
    Other,
}

impl WorkerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn kind(&self) -> WorkerErrorKind {
        match self.code.as_str() {
            codes::OLLAMA_NOT_RUNNING | codes::DEPENDENCY_UNAVAILABLE => {
                WorkerErrorKind::DependencyUnavailable
            }
            codes::MODEL_NOT_FOUND => WorkerErrorKind::ModelNotFound,
            codes::NO_INDEX => WorkerErrorKind::NoIndex,
            codes::INVALID_JSON
            | codes::UNKNOWN_ACTION
            | codes::MISSING_PATH
            | codes::MISSING_QUERY
            | codes::MISSING_KEY
            | codes::INVALID_OPERATION => WorkerErrorKind::InvalidRequest,
            _ => WorkerErrorKind::Other,
        }
    }

    pub fn is_dependency_unavailable(&self) -> bool {
        self.kind() == WorkerErrorKind::DependencyUnavailable
    }

    /// Remediation hint from `details.help`, if the worker supplied one.
    pub fn help(&self) -> Option<&str> {
        self.details.as_ref()?.get("help")?.as_str()
    }
}

/// Failure to bring the worker to the ready state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StartupError {
    #[error("worker executable not found (searched: {})", display_paths(.searched))]
    WorkerNotFound { searched: Vec<PathBuf> },

    #[error("worker script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("failed to spawn worker {}: {reason}", .program.display())]
    Spawn { program: PathBuf, reason: String },

    #[error("worker did not signal ready within {0:?}")]
    Timeout(Duration),

    #[error("worker exited before signalling ready (exit code {})", display_code(.exit_code))]
    Exited { exit_code: Option<i32> },

    #[error("worker transport failed during startup: {0}")]
    Transport(String),

    #[error("worker rejected startup: {0}")]
    Rejected(WorkerError),

    #[error("bridge already started")]
    AlreadyStarted,

    #[error("bridge stopped before the worker became ready")]
    Stopped,
}

/// Failure of a single request or streaming session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    #[error("engine is not ready")]
    NotReady,

    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("streaming session timed out after {0:?}")]
    StreamingTimeout(Duration),

    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("engine terminated (exit code {}): {reason}", display_code(.exit_code))]
    EngineTerminated {
        exit_code: Option<i32>,
        reason: String,
    },

    #[error("engine stopped")]
    EngineStopped,

    #[error("invalid request payload: {0}")]
    InvalidPayload(String),

    #[error("unexpected {action} payload: {reason}")]
    UnexpectedPayload { action: String, reason: String },
}

/// How a caller should present a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Installation or configuration problem; retrying will not help.
    Setup,
    /// A runtime dependency of the worker is missing.
    Dependency,
    /// Timed out; retrying may help.
    Transient,
    /// The worker rejected or failed the request.
    Worker,
    /// The worker went away.
    Terminated,
    /// The caller misused the bridge.
    Caller,
}

impl BridgeError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::NotReady | Self::InvalidPayload(_) => FailureClass::Caller,
            Self::RequestTimeout(_) | Self::StreamingTimeout(_) => FailureClass::Transient,
            Self::Worker(e) if e.is_dependency_unavailable() => FailureClass::Dependency,
            Self::Worker(_) | Self::UnexpectedPayload { .. } => FailureClass::Worker,
            Self::EngineTerminated { .. } | Self::EngineStopped => FailureClass::Terminated,
        }
    }

    pub fn worker_error(&self) -> Option<&WorkerError> {
        match self {
            Self::Worker(e) => Some(e),
            _ => None,
        }
    }
}

impl StartupError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::WorkerNotFound { .. } | Self::ScriptNotFound(_) | Self::Spawn { .. } => {
                FailureClass::Setup
            }
            Self::Rejected(e) if e.is_dependency_unavailable() => FailureClass::Dependency,
            Self::Rejected(_) => FailureClass::Worker,
            Self::Timeout(_) => FailureClass::Transient,
            Self::Exited { .. } | Self::Transport(_) | Self::Stopped => FailureClass::Terminated,
            Self::AlreadyStarted => FailureClass::Caller,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
