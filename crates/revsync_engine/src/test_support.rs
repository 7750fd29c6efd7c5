//! Scripted transport for unit tests.

use crate::config::RemoteEndpoint;
use crate::error::{ReplicationError, ReplicationResult};
use crate::transport::{ByteStream, Request, Response, StreamResponse, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Chunks served by one scripted stream.
pub(crate) struct Script {
    pub chunks: Vec<&'static str>,
    /// Keep the stream open once the chunks run out.
    pub hang: bool,
}

struct ScriptedStream {
    chunks: VecDeque<Bytes>,
    hang: bool,
}

#[async_trait]
impl ByteStream for ScriptedStream {
    async fn next_chunk(&mut self) -> ReplicationResult<Option<Bytes>> {
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.hang => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// Answers requests from queues and records what was sent.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    pub requests: Mutex<Vec<Request>>,
    pub responses: Mutex<VecDeque<ReplicationResult<Response>>>,
    pub streams: Mutex<VecDeque<Script>>,
    pub delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn answering(responses: Vec<Response>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Self::default()
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.path.clone()).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _endpoint: &RemoteEndpoint) -> ReplicationResult<()> {
        Ok(())
    }

    async fn send(&self, request: Request) -> ReplicationResult<Response> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ReplicationError::transport_retryable("script exhausted")))
    }

    async fn open_stream(&self, request: Request) -> ReplicationResult<StreamResponse> {
        self.requests.lock().push(request);
        let script = self
            .streams
            .lock()
            .pop_front()
            .ok_or_else(|| ReplicationError::transport_retryable("no stream scripted"))?;
        Ok(StreamResponse {
            status: 200,
            body: Box::new(ScriptedStream {
                chunks: script.chunks.into_iter().map(|c| Bytes::from_static(c.as_bytes())).collect(),
                hang: script.hang,
            }),
        })
    }
}
