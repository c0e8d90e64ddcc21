//! Wire protocol types for bridge-worker communication.
//!
//! One JSON object per line in each direction:
//! - **Outbound** (stdin): `{id, action, timestamp, ...fields}`
//! - **Inbound** (stdout): `{id | "ready", status, data?, error?}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WorkerError, codes};

/// Reserved inbound id used by the worker's one-time readiness handshake.
pub const READY_ID: &str = "ready";

/// Chunk type that ends a streaming session.
pub const DONE_CHUNK: &str = "done";

/// Field names owned by the envelope; action payloads may not use them.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "action", "timestamp"];

/// Correlation id minted by the bridge for every outbound request.
///
/// UUID v4 so ids are never reused while a request is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request from bridge to worker.
///
/// Action-specific fields are flattened next to the envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: CorrelationId,
    pub action: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(id: CorrelationId, action: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id,
            action: action.into(),
            timestamp: Utc::now(),
            fields,
        }
    }

    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Streaming,
}

/// Message from worker to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
}

/// Who an inbound message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget<'a> {
    Ready,
    Request(CorrelationId),
    /// Not a bridge-minted id (e.g. the worker's "unknown" fallback).
    Unknown(&'a str),
}

impl InboundMessage {
    pub fn target(&self) -> MessageTarget<'_> {
        if self.id == READY_ID {
            return MessageTarget::Ready;
        }
        match CorrelationId::parse(&self.id) {
            Ok(id) => MessageTarget::Request(id),
            Err(_) => MessageTarget::Unknown(&self.id),
        }
    }

    /// Payload of a success message (`null` when absent).
    pub fn into_data(self) -> Value {
        self.data.unwrap_or(Value::Null)
    }

    /// Worker error of an error message, synthesized when the worker omitted it.
    pub fn into_worker_error(self) -> WorkerError {
        self.error.unwrap_or_else(|| {
            WorkerError::new(
                codes::UNKNOWN_ERROR,
                "worker reported an error without details",
            )
        })
    }
}

/// Streaming payload (`data` of a `status=streaming` message).
///
/// The bridge only interprets `type == "done"`; everything else is passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    /// Full payload of a non-streamed answer wrapped as a terminal chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamChunk {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: None,
            source: None,
            data: None,
            extra: Map::new(),
        }
    }

    /// Terminal chunk carrying a complete payload.
    pub fn done_with(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::new(DONE_CHUNK)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == DONE_CHUNK
    }
}
