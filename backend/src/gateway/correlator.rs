//! Pairs dispatched requests with their streamed responses.
//!
//! An [`InferenceStream`] owns the request's slot in its node's pending table
//! from dispatch until the stream ends or is dropped, whichever comes first.
//! The slot is released exactly once on every path, including a caller that
//! stops reading half way through.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use fleet_common::{ChatCompletionChunk, ChatCompletionRequest, InferencePayload, StreamStatus, Usage};

use super::metrics::{MetricsIncrement, MetricsSender};
use super::registry::{DispatchError, DispatchRequest, NodeRegistry, ResponseReceiver};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("Node {0} disconnected")]
    NodeDisconnected(String),
    #[error("Node error: {message}")]
    Node {
        message: String,
        code: Option<String>,
    },
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Usage terminal chunk, `completed` status, or end of stream after output.
    Completed,
    /// The node reported `cancelled`.
    Cancelled,
    /// Error frame or disconnect.
    Failed,
    /// The channel closed before any chunk arrived.
    Empty,
}

impl StreamEnd {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamEnd::Completed)
    }
}

/// Timing and token figures for a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    pub chunks: usize,
    pub time_to_first_token: Option<Duration>,
    pub tokens_per_second: Option<f64>,
    pub usage: Option<Usage>,
    /// `None` while the stream is still open.
    pub end: Option<StreamEnd>,
}

/// Throughput after the first token: the remaining tokens over the time
/// between first and last content.
pub fn throughput(completion_tokens: u32, window: Duration) -> Option<f64> {
    let secs = window.as_secs_f64();
    if completion_tokens <= 1 || secs <= 0.0 {
        return None;
    }
    Some(f64::from(completion_tokens - 1) / secs)
}

pub struct RequestCorrelator {
    registry: Arc<NodeRegistry>,
    metrics: MetricsSender,
}

impl RequestCorrelator {
    pub fn new(registry: Arc<NodeRegistry>, metrics: MetricsSender) -> Self {
        Self { registry, metrics }
    }

    /// Dispatch a user request under a fresh request id. The stream reports a
    /// metrics increment when it ends.
    pub async fn start(
        &self,
        node_id: &str,
        user_id: &str,
        model: &str,
        chat_request: ChatCompletionRequest,
    ) -> Result<InferenceStream, DispatchError> {
        let request_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        let receiver = self
            .registry
            .dispatch(
                node_id,
                DispatchRequest {
                    request_id,
                    model: model.to_string(),
                    user_id: user_id.to_string(),
                    chat_request,
                },
            )
            .await?;
        Ok(InferenceStream::new(receiver, Some(self.metrics.clone())))
    }

    /// Dispatch a synthetic probe under a caller-chosen id. Probes report no
    /// request metrics.
    pub async fn probe(
        &self,
        node_id: &str,
        request_id: String,
        model: &str,
        chat_request: ChatCompletionRequest,
    ) -> Result<InferenceStream, DispatchError> {
        let receiver = self
            .registry
            .dispatch(
                node_id,
                DispatchRequest {
                    request_id,
                    model: model.to_string(),
                    user_id: node_id.to_string(),
                    chat_request,
                },
            )
            .await?;
        Ok(InferenceStream::new(receiver, None))
    }
}

/// Streamed response of one dispatched request.
pub struct InferenceStream {
    node_id: String,
    request_id: String,
    receiver: Option<ResponseReceiver>,
    metrics: Option<MetricsSender>,
    started: Instant,
    first_content_at: Option<Instant>,
    last_content_at: Option<Instant>,
    chunks: usize,
    content_chunks: u32,
    usage: Option<Usage>,
    end: Option<StreamEnd>,
}

impl InferenceStream {
    fn new(receiver: ResponseReceiver, metrics: Option<MetricsSender>) -> Self {
        Self {
            node_id: receiver.node_id().to_string(),
            request_id: receiver.request_id().to_string(),
            receiver: Some(receiver),
            metrics,
            started: Instant::now(),
            first_content_at: None,
            last_content_at: None,
            chunks: 0,
            content_chunks: 0,
            usage: None,
            end: None,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Next chunk, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<ChatCompletionChunk, InferenceError>> {
        let payload = self.receiver.as_mut()?.receive().await;
        match payload {
            Some(InferencePayload::Chunk(chunk)) => {
                self.observe(&chunk);
                if chunk.is_usage_terminal() {
                    self.finish(StreamEnd::Completed);
                }
                Some(Ok(chunk))
            }
            Some(InferencePayload::Status(StreamStatus::Completed)) => {
                self.finish(StreamEnd::Completed);
                None
            }
            Some(InferencePayload::Status(StreamStatus::Cancelled)) => {
                self.finish(StreamEnd::Cancelled);
                None
            }
            Some(InferencePayload::Error(e)) => {
                self.finish(StreamEnd::Failed);
                if e.is_disconnect() {
                    Some(Err(InferenceError::NodeDisconnected(self.node_id.clone())))
                } else {
                    Some(Err(InferenceError::Node {
                        message: e.message,
                        code: e.code,
                    }))
                }
            }
            None => {
                let end = if self.chunks > 0 {
                    StreamEnd::Completed
                } else {
                    StreamEnd::Empty
                };
                self.finish(end);
                None
            }
        }
    }

    /// Read to the end, returning every chunk and the first error, if any.
    pub async fn collect(&mut self) -> (Vec<ChatCompletionChunk>, Option<InferenceError>) {
        let mut chunks = Vec::new();
        while let Some(item) = self.next().await {
            match item {
                Ok(chunk) => chunks.push(chunk),
                Err(e) => return (chunks, Some(e)),
            }
        }
        (chunks, None)
    }

    pub fn summary(&self) -> StreamSummary {
        let time_to_first_token = self.first_content_at.map(|t| t - self.started);
        let tokens = self
            .usage
            .map(|u| u.completion_tokens)
            .unwrap_or(self.content_chunks);
        let tokens_per_second = match (self.first_content_at, self.last_content_at) {
            (Some(first), Some(last)) => throughput(tokens, last - first),
            _ => None,
        };
        StreamSummary {
            chunks: self.chunks,
            time_to_first_token,
            tokens_per_second,
            usage: self.usage,
            end: self.end,
        }
    }

    /// The increment this stream reports. A stream dropped before it ended
    /// counts as served only.
    pub fn metrics_increment(&self) -> MetricsIncrement {
        let mut increment = MetricsIncrement::new(self.node_id.clone());
        increment.requests_served = 1;
        match self.end {
            None => {}
            Some(StreamEnd::Completed) => {
                let summary = self.summary();
                increment.requests_successful = 1;
                increment.time_to_first_token =
                    summary.time_to_first_token.map(|d| d.as_secs_f64());
                increment.inference_tokens_per_second = summary.tokens_per_second;
            }
            Some(_) => increment.requests_failed = 1,
        }
        increment
    }

    fn observe(&mut self, chunk: &ChatCompletionChunk) {
        self.chunks += 1;
        if chunk.has_content() {
            let now = Instant::now();
            self.first_content_at.get_or_insert(now);
            self.last_content_at = Some(now);
            self.content_chunks += 1;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
    }

    fn finish(&mut self, end: StreamEnd) {
        self.end = Some(end);
        // Releases the pending-table slot.
        self.receiver = None;
        tracing::debug!(
            node_id = %self.node_id,
            request_id = %self.request_id,
            end = ?end,
            chunks = self.chunks,
            "Inference stream ended"
        );
    }
}

impl Drop for InferenceStream {
    fn drop(&mut self) {
        if self.end.is_none() {
            tracing::debug!(
                node_id = %self.node_id,
                request_id = %self.request_id,
                "Inference stream dropped by caller"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.submit(self.metrics_increment());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::NodeConnection;
    use crate::gateway::metrics::MetricsAggregator;
    use crate::gateway::selector::{CapacityLimits, NodeSelector};
    use crate::store::MemoryStore;
    use fleet_common::{InferenceFrame, NodeError, NodeStatus, OutboundFrame};
    use tokio::sync::mpsc;

    struct Harness {
        registry: Arc<NodeRegistry>,
        correlator: RequestCorrelator,
        aggregator: MetricsAggregator,
        node: Arc<NodeConnection>,
        socket: mpsc::Receiver<OutboundFrame>,
    }

    async fn harness(vram_mb: u64) -> Harness {
        let registry = Arc::new(NodeRegistry::new("replica-test"));
        let (tx, socket) = mpsc::channel(32);
        let node = Arc::new(NodeConnection::new(
            "N".to_string(),
            "model-x".to_string(),
            vram_mb,
            "replica-test".to_string(),
            false,
            fleet_common::PROTOCOL_VERSION,
            NodeStatus::Running,
            tx,
        ));
        registry.register(node.clone()).await;
        let (aggregator, sender) =
            MetricsAggregator::channel(Arc::new(MemoryStore::new()), 10, 16);
        Harness {
            correlator: RequestCorrelator::new(registry.clone(), sender),
            registry,
            aggregator,
            node,
            socket,
        }
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::user_prompt("model-x", "Hello", None)
    }

    async fn push(registry: &NodeRegistry, request_id: &str, payload: InferencePayload) {
        assert!(
            registry
                .route(
                    "N",
                    InferenceFrame {
                        request_id: request_id.to_string(),
                        payload,
                    },
                )
                .await
        );
    }

    fn chunk(id: &str, text: &str) -> InferencePayload {
        InferencePayload::Chunk(ChatCompletionChunk::delta(id, "model-x", text))
    }

    fn usage(id: &str) -> InferencePayload {
        InferencePayload::Chunk(ChatCompletionChunk::usage_only(id, "model-x", 5, 3))
    }

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(11, Duration::from_secs(2)), Some(5.0));
        assert_eq!(throughput(1, Duration::from_secs(2)), None);
        assert_eq!(throughput(10, Duration::ZERO), None);
    }

    #[tokio::test]
    async fn test_select_dispatch_stream_and_cleanup() {
        let mut h = harness(16_000).await;
        let limits = CapacityLimits {
            max_parallel_requests_per_node: 4,
            max_parallel_requests_per_datacenter_node: 20,
        };
        let selector = NodeSelector::new(h.registry.clone(), limits);
        let node = selector.select("model-x").await.unwrap();
        assert_eq!(node.node_id, "N");

        let mut stream = h
            .correlator
            .start("N", "caller", "model-x", request())
            .await
            .unwrap();
        let id = stream.request_id().to_string();
        assert!(matches!(h.socket.recv().await, Some(OutboundFrame::Dispatch(_))));
        assert_eq!(h.node.active_requests(), 1);

        push(&h.registry, &id, chunk(&id, "Hi")).await;
        push(&h.registry, &id, usage(&id)).await;

        assert!(stream.next().await.unwrap().unwrap().has_content());
        assert!(stream.next().await.unwrap().unwrap().is_usage_terminal());
        assert!(stream.next().await.is_none());

        assert_eq!(h.node.active_requests(), 0);
        assert!(!h.registry.cleanup("N", &id).await);

        let summary = stream.summary();
        assert_eq!(summary.end, Some(StreamEnd::Completed));
        assert_eq!(summary.chunks, 2);
        assert!(summary.time_to_first_token.is_some());
        drop(stream);

        let batch = h.aggregator.next_batch().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].requests_served, 1);
        assert_eq!(batch[0].requests_successful, 1);
        assert_eq!(batch[0].requests_failed, 0);
    }

    #[tokio::test]
    async fn test_usage_terminal_without_requested_usage() {
        let mut h = harness(16_000).await;
        let mut chat = request();
        chat.stream_options = None;
        let mut stream = h.correlator.start("N", "caller", "model-x", chat).await.unwrap();
        let id = stream.request_id().to_string();
        push(&h.registry, &id, usage(&id)).await;

        let (chunks, err) = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(err.is_none());
        assert_eq!(stream.summary().usage.unwrap().completion_tokens, 3);
        drop(stream);

        let batch = h.aggregator.next_batch().await.unwrap();
        assert_eq!(batch[0].requests_successful, 1);
    }

    #[tokio::test]
    async fn test_error_frame_fails_request() {
        let mut h = harness(16_000).await;
        let mut stream = h.correlator.start("N", "caller", "model-x", request()).await.unwrap();
        let id = stream.request_id().to_string();
        push(
            &h.registry,
            &id,
            InferencePayload::Error(NodeError {
                message: "out of memory".to_string(),
                code: Some("oom".to_string()),
            }),
        )
        .await;

        match stream.next().await {
            Some(Err(InferenceError::Node { message, code })) => {
                assert_eq!(message, "out of memory");
                assert_eq!(code.as_deref(), Some("oom"));
            }
            other => panic!("unexpected item {:?}", other),
        }
        assert!(stream.next().await.is_none());
        assert_eq!(h.node.active_requests(), 0);
        drop(stream);

        let batch = h.aggregator.next_batch().await.unwrap();
        assert_eq!(batch[0].requests_failed, 1);
        assert_eq!(batch[0].requests_successful, 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream() {
        let h = harness(16_000).await;
        let mut stream = h.correlator.start("N", "caller", "model-x", request()).await.unwrap();
        let id = stream.request_id().to_string();
        push(&h.registry, &id, chunk(&id, "partial")).await;
        let conn = h.registry.get("N").await.unwrap();
        h.registry.deregister_connection(&conn).await;

        assert!(stream.next().await.unwrap().is_ok());
        match stream.next().await {
            Some(Err(e)) => assert_eq!(e, InferenceError::NodeDisconnected("N".to_string())),
            other => panic!("unexpected item {:?}", other),
        }
        assert!(stream.next().await.is_none());
        assert_eq!(stream.summary().end, Some(StreamEnd::Failed));
    }

    #[tokio::test]
    async fn test_status_frames_end_stream() {
        let h = harness(16_000).await;

        let mut done = h.correlator.start("N", "caller", "model-x", request()).await.unwrap();
        let id = done.request_id().to_string();
        push(&h.registry, &id, chunk(&id, "a")).await;
        push(&h.registry, &id, InferencePayload::Status(StreamStatus::Completed)).await;
        let (chunks, err) = done.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(err.is_none());
        assert_eq!(done.summary().end, Some(StreamEnd::Completed));

        let mut cancelled = h.correlator.start("N", "caller", "model-x", request()).await.unwrap();
        let id = cancelled.request_id().to_string();
        push(&h.registry, &id, InferencePayload::Status(StreamStatus::Cancelled)).await;
        assert!(cancelled.next().await.is_none());
        assert_eq!(cancelled.summary().end, Some(StreamEnd::Cancelled));
        assert_eq!(cancelled.metrics_increment().requests_successful, 0);
        assert_eq!(cancelled.metrics_increment().requests_failed, 1);
    }

    #[tokio::test]
    async fn test_caller_drop_releases_slot_and_counts_served_only() {
        let mut h = harness(6_000).await;
        let mut stream = h.correlator.start("N", "caller", "model-x", request()).await.unwrap();
        let id = stream.request_id().to_string();
        push(&h.registry, &id, chunk(&id, "a")).await;
        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(h.node.active_requests(), 1);

        drop(stream);
        assert_eq!(h.node.active_requests(), 0);

        let batch = h.aggregator.next_batch().await.unwrap();
        assert_eq!(batch[0].requests_served, 1);
        assert_eq!(batch[0].requests_successful, 0);
        assert_eq!(batch[0].requests_failed, 0);
    }

    #[tokio::test]
    async fn test_probe_streams_report_no_metrics() {
        let mut h = harness(16_000).await;
        let mut stream = h
            .correlator
            .probe("N", "health-check-abc".to_string(), "model-x", request())
            .await
            .unwrap();
        assert_eq!(stream.request_id(), "health-check-abc");
        push(&h.registry, "health-check-abc", usage("health-check-abc")).await;
        let _ = stream.collect().await;
        drop(stream);
        drop(h.correlator);

        assert!(h.aggregator.next_batch().await.is_none());
    }
}
