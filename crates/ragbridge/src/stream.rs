//! Caller side of a streaming session.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::protocol::{CorrelationId, StreamChunk};
use crate::error::BridgeError;
use crate::registry::{EntryGuard, SessionReceiver, SessionResult};

/// Chunks of one streaming exchange, in arrival order.
///
/// Yields every chunk including the terminal `done` chunk, then ends. If the
/// session fails (worker error, timeout, engine termination) the failure is
/// yielded once after any chunks already delivered, and the stream ends.
///
/// Dropping the stream deregisters the session; later chunks for it are
/// logged as dangling.
pub struct ChunkStream {
    id: CorrelationId,
    chunks: mpsc::UnboundedReceiver<StreamChunk>,
    completion: Option<oneshot::Receiver<SessionResult>>,
    _guard: EntryGuard,
}

impl ChunkStream {
    pub(crate) fn new(id: CorrelationId, receiver: SessionReceiver, guard: EntryGuard) -> Self {
        Self {
            id,
            chunks: receiver.chunks,
            completion: Some(receiver.completion),
            _guard: guard,
        }
    }

    pub fn id(&self) -> CorrelationId {
        self.id
    }

    /// Next chunk, `Ok(None)` once the session has finished.
    pub async fn next_chunk(&mut self) -> Result<Option<StreamChunk>, BridgeError> {
        futures::StreamExt::next(self).await.transpose()
    }

    /// Drain the stream, handing each chunk to `sink`.
    pub async fn for_each_chunk<F>(mut self, mut sink: F) -> Result<(), BridgeError>
    where
        F: FnMut(StreamChunk),
    {
        while let Some(chunk) = self.next_chunk().await? {
            sink(chunk);
        }
        Ok(())
    }
}

impl Stream for ChunkStream {
    type Item = Result<StreamChunk, BridgeError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if let Some(chunk) = std::task::ready!(this.chunks.poll_recv(cx)) {
            return Poll::Ready(Some(Ok(chunk)));
        }
        // Channel closed: every chunk is out, only the outcome remains.
        let Some(completion) = this.completion.as_mut() else {
            return Poll::Ready(None);
        };
        let outcome = std::task::ready!(Pin::new(completion).poll(cx));
        this.completion = None;
        match outcome {
            Ok(Ok(())) | Err(_) => Poll::Ready(None),
            Ok(Err(e)) => Poll::Ready(Some(Err(e))),
        }
    }
}
