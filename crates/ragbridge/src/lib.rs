//! ragbridge: supervised JSON-lines bridge to an external RAG engine worker.
//!
//! The bridge owns one worker process, waits for its `ready` handshake,
//! correlates requests with responses by id, routes streamed chunks to their
//! sessions, and fails everything in flight when the worker goes away.

pub mod bridge;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
mod readiness;
mod registry;
pub mod stream;
pub mod supervisor;
mod worker_log;

#[cfg(test)]
mod test_support;

pub use bridge::protocol::{CorrelationId, StreamChunk};
pub use client::{
    EngineClient, HealthReport, IndexOptions, IndexReport, QueryAnswer, QueryOptions, Source,
    collect_answer,
};
pub use config::BridgeConfig;
pub use engine::EngineBridge;
pub use error::{BridgeError, FailureClass, StartupError, WorkerError};
pub use readiness::Readiness;
pub use stream::ChunkStream;
pub use supervisor::{Termination, WorkerLocator};
