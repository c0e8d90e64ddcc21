//! Typed RAG engine actions over an [`EngineBridge`].
//!
//! Adds request/response shapes only; timeouts, errors and streaming
//! semantics are the bridge's.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::bridge::protocol::StreamChunk;
use crate::engine::EngineBridge;
use crate::error::BridgeError;
use crate::stream::ChunkStream;

pub mod actions {
    pub const HEALTH: &str = "health";
    pub const INDEX: &str = "index";
    pub const QUERY: &str = "query";
    pub const CONFIG: &str = "config";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
    pub force: bool,
    /// Overrides the bridge's request timeout for this call.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFailure {
    pub file: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub files_processed: u64,
    pub files_skipped: u64,
    pub chunks_created: u64,
    /// Milliseconds.
    pub duration: u64,
    #[serde(default)]
    pub errors: Vec<IndexFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOptions {
    #[serde(rename = "topK")]
    pub top_k: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub file: String,
    #[serde(default)]
    pub lines: Option<String>,
    #[serde(default)]
    pub relevance: f64,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnswer {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<Source>,
    pub has_answer: bool,
}

impl StreamChunk {
    /// The [`Source`] carried by a `source` chunk.
    pub fn as_source(&self) -> Option<Result<Source, serde_json::Error>> {
        if self.kind != "source" {
            return None;
        }
        let source = self.source.clone()?;
        Some(serde_json::from_value(source))
    }
}

fn decode<T: DeserializeOwned>(action: &str, value: Value) -> Result<T, BridgeError> {
    serde_json::from_value(value).map_err(|e| BridgeError::UnexpectedPayload {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

fn field(action: &str, mut value: Value, name: &str) -> Result<Value, BridgeError> {
    match value.get_mut(name) {
        Some(field) => Ok(field.take()),
        None => Err(BridgeError::UnexpectedPayload {
            action: action.to_string(),
            reason: format!("missing `{name}`"),
        }),
    }
}

/// Drain a query stream into a complete answer.
///
/// `token` contents are concatenated and `source` chunks collected. A terminal
/// chunk carrying a full payload (a worker that declined to stream) is decoded
/// as the answer itself. A streamed answer counts as answered when the worker
/// cited at least one source.
pub async fn collect_answer(mut stream: ChunkStream) -> Result<QueryAnswer, BridgeError> {
    let mut answer = String::new();
    let mut sources = Vec::new();
    while let Some(chunk) = stream.next_chunk().await? {
        match chunk.kind.as_str() {
            "token" => answer.push_str(chunk.content.as_deref().unwrap_or_default()),
            "source" => match chunk.as_source() {
                Some(Ok(source)) => sources.push(source),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Ignoring malformed source chunk");
                }
                None => {}
            },
            _ if chunk.is_terminal() => {
                if let Some(data) = chunk.data {
                    return decode(actions::QUERY, data);
                }
            }
            _ => {}
        }
    }
    let has_answer = !sources.is_empty();
    Ok(QueryAnswer {
        answer,
        sources,
        has_answer,
    })
}

/// Typed client for the RAG engine worker.
#[derive(Clone)]
pub struct EngineClient {
    bridge: EngineBridge,
}

impl EngineClient {
    pub fn new(bridge: EngineBridge) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &EngineBridge {
        &self.bridge
    }

    pub async fn health(&self) -> Result<HealthReport, BridgeError> {
        let data = self.bridge.send(actions::HEALTH, Value::Null).await?;
        decode(actions::HEALTH, data)
    }

    pub async fn index(
        &self,
        path: impl AsRef<Path>,
        options: IndexOptions,
    ) -> Result<IndexReport, BridgeError> {
        let payload = json!({
            "path": path.as_ref().to_string_lossy(),
            "options": options,
        });
        let data = match options.timeout {
            Some(timeout) => {
                self.bridge
                    .send_with_timeout(actions::INDEX, payload, timeout)
                    .await?
            }
            None => self.bridge.send(actions::INDEX, payload).await?,
        };
        decode(actions::INDEX, data)
    }

    pub async fn query(
        &self,
        question: &str,
        options: QueryOptions,
    ) -> Result<QueryAnswer, BridgeError> {
        let payload = json!({"query": question, "options": options});
        let data = self.bridge.send(actions::QUERY, payload).await?;
        decode(actions::QUERY, data)
    }

    /// Streamed answer: `token` chunks, then `source` chunks, then `done`.
    pub async fn query_stream(
        &self,
        question: &str,
        options: QueryOptions,
    ) -> Result<ChunkStream, BridgeError> {
        let payload = json!({
            "query": question,
            "options": {"topK": options.top_k, "stream": true},
        });
        self.bridge.open_stream(actions::QUERY, payload).await
    }

    /// Dotted-path lookup (e.g. `llm.model`); `None` when the key is unset.
    pub async fn config_get(&self, key: &str) -> Result<Option<Value>, BridgeError> {
        let data = self
            .config(json!({"operation": "get", "key": key}))
            .await?;
        let value = field(actions::CONFIG, data, "value")?;
        Ok((!value.is_null()).then_some(value))
    }

    pub async fn config_all(&self) -> Result<Value, BridgeError> {
        let data = self.config(json!({"operation": "get"})).await?;
        field(actions::CONFIG, data, "config")
    }

    pub async fn config_set(&self, key: &str, value: Value) -> Result<(), BridgeError> {
        self.config(json!({"operation": "set", "key": key, "value": value}))
            .await?;
        Ok(())
    }

    /// Merge `config` into the worker's configuration; returns the result.
    pub async fn config_set_all(&self, config: Value) -> Result<Value, BridgeError> {
        let data = self
            .config(json!({"operation": "set_all", "config": config}))
            .await?;
        field(actions::CONFIG, data, "config")
    }

    async fn config(&self, options: Value) -> Result<Value, BridgeError> {
        self.bridge
            .send(actions::CONFIG, json!({"options": options}))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeWorker, started};

    async fn client() -> (EngineClient, FakeWorker) {
        let (bridge, worker) = started().await;
        (EngineClient::new(bridge), worker)
    }

    #[tokio::test]
    async fn health_decodes_report() {
        let (client, mut worker) = client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.health().await }
        });
        let request = worker.recv().await.unwrap();
        assert_eq!(request["action"], "health");
        worker
            .succeed(&request, json!({"status": "healthy", "version": "0.1.0"}))
            .await;

        assert_eq!(
            call.await.unwrap().unwrap(),
            HealthReport {
                status: "healthy".to_string(),
                version: Some("0.1.0".to_string())
            }
        );
    }

    #[tokio::test]
    async fn index_sends_path_and_options() {
        let (client, mut worker) = client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move {
                let options = IndexOptions {
                    exclude: Some(vec!["target/**".to_string()]),
                    force: true,
                    ..IndexOptions::default()
                };
                client.index("/work/project", options).await
            }
        });
        let request = worker.recv().await.unwrap();
        assert_eq!(request["path"], "/work/project");
        assert_eq!(
            request["options"],
            json!({"exclude": ["target/**"], "force": true})
        );
        worker
            .succeed(
                &request,
                json!({
                    "filesProcessed": 12,
                    "filesSkipped": 3,
                    "chunksCreated": 40,
                    "duration": 1520,
                    "errors": [{"file": "big.bin", "error": "too large"}]
                }),
            )
            .await;

        let report = call.await.unwrap().unwrap();
        assert_eq!(report.files_processed, 12);
        assert_eq!(report.chunks_created, 40);
        assert_eq!(report.errors[0].file, "big.bin");
    }

    #[tokio::test]
    async fn query_decodes_answer_with_sources() {
        let (client, mut worker) = client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.query("how does it start?", QueryOptions { top_k: 3 }).await }
        });
        let request = worker.recv().await.unwrap();
        assert_eq!(request["query"], "how does it start?");
        assert_eq!(request["options"], json!({"topK": 3}));
        worker
            .succeed(
                &request,
                json!({
                    "answer": "It spawns a worker.",
                    "sources": [{"file": "main.rs", "lines": "1-10", "relevance": 0.91, "snippet": "fn main()"}],
                    "hasAnswer": true
                }),
            )
            .await;

        let answer = call.await.unwrap().unwrap();
        assert!(answer.has_answer);
        assert_eq!(answer.sources[0].lines.as_deref(), Some("1-10"));
    }

    #[tokio::test]
    async fn streamed_query_collects_tokens_and_sources() {
        let (client, mut worker) = client().await;
        let stream = client
            .query_stream("why?", QueryOptions::default())
            .await
            .unwrap();
        let request = worker.recv().await.unwrap();
        assert_eq!(request["options"], json!({"topK": 5, "stream": true}));

        worker.chunk(&request, json!({"type": "token", "content": "Be"})).await;
        worker.chunk(&request, json!({"type": "token", "content": "cause."})).await;
        worker
            .chunk(
                &request,
                json!({"type": "source", "source": {"file": "a.md", "lines": null, "relevance": 0.5, "snippet": "..."}}),
            )
            .await;
        worker.chunk(&request, json!({"type": "done"})).await;

        let answer = collect_answer(stream).await.unwrap();
        assert_eq!(answer.answer, "Because.");
        assert_eq!(answer.sources.len(), 1);
        assert!(answer.has_answer);
    }

    #[tokio::test]
    async fn config_get_returns_none_for_unset_key() {
        let (client, mut worker) = client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.config_get("llm.temperature").await }
        });
        let request = worker.recv().await.unwrap();
        assert_eq!(
            request["options"],
            json!({"operation": "get", "key": "llm.temperature"})
        );
        worker.succeed(&request, json!({"value": null})).await;

        assert_eq!(call.await.unwrap(), Ok(None));
    }

    #[tokio::test]
    async fn config_set_all_returns_merged_config() {
        let (client, mut worker) = client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.config_set_all(json!({"llm": {"model": "llama3"}})).await }
        });
        let request = worker.recv().await.unwrap();
        assert_eq!(
            request["options"],
            json!({"operation": "set_all", "config": {"llm": {"model": "llama3"}}})
        );
        worker
            .succeed(
                &request,
                json!({
                    "success": true,
                    "config": {"llm": {"model": "llama3", "temperature": 0.1}}
                }),
            )
            .await;

        assert_eq!(
            call.await.unwrap(),
            Ok(json!({"llm": {"model": "llama3", "temperature": 0.1}}))
        );
    }

    #[tokio::test]
    async fn mismatched_payload_is_unexpected() {
        let (client, mut worker) = client().await;
        let call = tokio::spawn({
            let client = client.clone();
            async move { client.health().await }
        });
        let request = worker.recv().await.unwrap();
        worker.succeed(&request, json!({"healthy": true})).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::UnexpectedPayload { ref action, .. } if action == "health"));
    }

    #[test]
    fn source_chunk_decodes() {
        let chunk: StreamChunk = serde_json::from_value(json!({
            "type": "source",
            "source": {"file": "lib.rs", "relevance": 0.7, "snippet": "pub fn"}
        }))
        .unwrap();
        let source = chunk.as_source().unwrap().unwrap();
        assert_eq!(source.file, "lib.rs");
        assert_eq!(source.lines, None);

        assert!(StreamChunk::new("token").as_source().is_none());
    }
}
