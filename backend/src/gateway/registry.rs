//! Registry of node connections accepted by this replica.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};

use fleet_common::{
    ChatCompletionRequest, DispatchFrame, InferenceFrame, InferencePayload, OutboundFrame,
};

use super::connection::{InFlightRequest, NodeConnection, OpenError};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Node {0} is not connected")]
    NodeNotFound(String),
    #[error("Node {0} is disconnecting")]
    NodeClosed(String),
    #[error("Request {0} is already in flight")]
    DuplicateRequest(String),
    #[error("Socket channel for node {0} is closed")]
    ChannelClosed(String),
}

/// An inference request to hand to a node.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request_id: String,
    pub model: String,
    pub user_id: String,
    pub chat_request: ChatCompletionRequest,
}

/// Receiving half of one in-flight request. Dropping it removes the request
/// from its node's pending table.
#[derive(Debug)]
pub struct ResponseReceiver {
    node: Arc<NodeConnection>,
    request_id: String,
    rx: mpsc::UnboundedReceiver<InferencePayload>,
}

impl ResponseReceiver {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    /// Next frame for this request; `None` once the node side is gone.
    pub async fn receive(&mut self) -> Option<InferencePayload> {
        self.rx.recv().await
    }
}

impl Drop for ResponseReceiver {
    fn drop(&mut self) {
        self.node.close_request(&self.request_id);
    }
}

/// Per-process table of connected nodes.
#[derive(Debug)]
pub struct NodeRegistry {
    backend_host: String,
    nodes: RwLock<HashMap<String, Arc<NodeConnection>>>,
}

impl NodeRegistry {
    pub fn new(backend_host: impl Into<String>) -> Self {
        Self {
            backend_host: backend_host.into(),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend_host(&self) -> &str {
        &self.backend_host
    }

    /// Add a connection. Returns false, leaving the existing entry untouched,
    /// when the node id is already registered.
    pub async fn register(&self, conn: Arc<NodeConnection>) -> bool {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&conn.node_id) {
            return false;
        }
        tracing::info!(
            node_id = %conn.node_id,
            model = %conn.model,
            vram_mb = conn.vram_mb,
            "Node registered"
        );
        nodes.insert(conn.node_id.clone(), conn);
        true
    }

    /// Remove `conn` if it is still the registered connection for its node
    /// id, failing its pending requests either way. False when the entry is
    /// gone or belongs to a newer connection, which is left untouched.
    pub async fn deregister_connection(&self, conn: &NodeConnection) -> bool {
        let removed = {
            let mut nodes = self.nodes.write().await;
            match nodes.get(&conn.node_id) {
                Some(current) if current.is_same(conn) => nodes.remove(&conn.node_id).is_some(),
                _ => false,
            }
        };
        let failed = conn.drain();
        if removed {
            tracing::info!(
                node_id = %conn.node_id,
                connection_id = %conn.connection_id,
                failed_requests = failed.len(),
                "Node deregistered"
            );
        } else {
            tracing::debug!(
                node_id = %conn.node_id,
                connection_id = %conn.connection_id,
                "Connection no longer registered"
            );
        }
        removed
    }

    /// Snapshot of every registered connection, sorted by node id.
    pub async fn connections(&self) -> Vec<Arc<NodeConnection>> {
        let mut conns: Vec<Arc<NodeConnection>> =
            self.nodes.read().await.values().cloned().collect();
        conns.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        conns
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<NodeConnection>> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Connections on this replica serving `model`.
    pub async fn nodes_by_model(&self, model: &str) -> Vec<Arc<NodeConnection>> {
        self.nodes
            .read()
            .await
            .values()
            .filter(|n| n.model == model)
            .cloned()
            .collect()
    }

    pub async fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn count(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Open the request's channel, then send the dispatch frame.
    pub async fn dispatch(
        &self,
        node_id: &str,
        request: DispatchRequest,
    ) -> Result<ResponseReceiver, DispatchError> {
        let node = self
            .get(node_id)
            .await
            .ok_or_else(|| DispatchError::NodeNotFound(node_id.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        node.open_request(InFlightRequest {
            request_id: request.request_id.clone(),
            model: request.model.clone(),
            user_id: request.user_id,
            created_at: Utc::now(),
            tx,
        })
        .map_err(|e| match e {
            OpenError::Closed => DispatchError::NodeClosed(node_id.to_string()),
            OpenError::Duplicate => DispatchError::DuplicateRequest(request.request_id.clone()),
        })?;

        // From here the receiver owns the entry and removes it on drop.
        let receiver = ResponseReceiver {
            node: node.clone(),
            request_id: request.request_id.clone(),
            rx,
        };

        let frame = OutboundFrame::Dispatch(DispatchFrame {
            request_id: request.request_id,
            model: request.model,
            chat_request: request.chat_request,
        });
        node.send(frame)
            .await
            .map_err(|_| DispatchError::ChannelClosed(node_id.to_string()))?;

        tracing::debug!(node_id, request_id = %receiver.request_id, "Request dispatched");
        Ok(receiver)
    }

    /// Route an inbound frame to its request. False when the request is not
    /// pending on that node.
    pub async fn route(&self, node_id: &str, frame: InferenceFrame) -> bool {
        let Some(node) = self.get(node_id).await else {
            return false;
        };
        let delivered = node.deliver(&frame.request_id, frame.payload);
        if !delivered {
            tracing::warn!(
                node_id,
                request_id = %frame.request_id,
                "Frame for unknown request dropped"
            );
        }
        delivered
    }

    /// Remove a pending request. Idempotent.
    pub async fn cleanup(&self, node_id: &str, request_id: &str) -> bool {
        match self.get(node_id).await {
            Some(node) => node.close_request(request_id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{ChatCompletionChunk, NodeStatus, StreamStatus};

    fn connection(
        node_id: &str,
        model: &str,
        vram_mb: u64,
    ) -> (Arc<NodeConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = NodeConnection::new(
            node_id.to_string(),
            model.to_string(),
            vram_mb,
            "replica-test".to_string(),
            false,
            fleet_common::PROTOCOL_VERSION,
            NodeStatus::Running,
            tx,
        );
        (Arc::new(conn), rx)
    }

    fn request(id: &str) -> DispatchRequest {
        DispatchRequest {
            request_id: id.to_string(),
            model: "model-x".to_string(),
            user_id: "caller".to_string(),
            chat_request: ChatCompletionRequest::user_prompt("model-x", "hi", None),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate() {
        let registry = NodeRegistry::new("replica-test");
        let (first, _rx1) = connection("n1", "model-x", 16_000);
        let (second, _rx2) = connection("n1", "model-y", 16_000);

        assert!(registry.register(first).await);
        assert!(!registry.register(second).await);
        assert_eq!(registry.get("n1").await.unwrap().model, "model-x");
    }

    #[tokio::test]
    async fn test_nodes_by_model() {
        let registry = NodeRegistry::new("replica-test");
        let (a, _ra) = connection("a", "model-x", 16_000);
        let (b, _rb) = connection("b", "model-y", 16_000);
        registry.register(a).await;
        registry.register(b).await;

        let found = registry.nodes_by_model("model-x").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node_id, "a");
        assert!(registry.nodes_by_model("model-z").await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_sends_frame_after_opening_channel() {
        let registry = NodeRegistry::new("replica-test");
        let (conn, mut socket) = connection("n1", "model-x", 16_000);
        registry.register(conn.clone()).await;

        let receiver = registry.dispatch("n1", request("r1")).await.unwrap();
        assert_eq!(conn.active_requests(), 1);

        match socket.recv().await.unwrap() {
            OutboundFrame::Dispatch(frame) => assert_eq!(frame.request_id, "r1"),
            other => panic!("unexpected frame {:?}", other),
        }
        drop(receiver);
        assert_eq!(conn.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_node() {
        let registry = NodeRegistry::new("replica-test");
        let err = registry.dispatch("ghost", request("r1")).await.unwrap_err();
        assert_eq!(err, DispatchError::NodeNotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_with_closed_socket_cleans_up() {
        let registry = NodeRegistry::new("replica-test");
        let (conn, socket) = connection("n1", "model-x", 16_000);
        registry.register(conn.clone()).await;
        drop(socket);

        let err = registry.dispatch("n1", request("r1")).await.unwrap_err();
        assert_eq!(err, DispatchError::ChannelClosed("n1".to_string()));
        assert_eq!(conn.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_route_and_cleanup() {
        let registry = NodeRegistry::new("replica-test");
        let (conn, _socket) = connection("n1", "model-x", 16_000);
        registry.register(conn.clone()).await;

        let mut receiver = registry.dispatch("n1", request("r1")).await.unwrap();
        let chunk = ChatCompletionChunk::delta("r1", "model-x", "Hel");
        assert!(
            registry
                .route(
                    "n1",
                    InferenceFrame {
                        request_id: "r1".to_string(),
                        payload: InferencePayload::Chunk(chunk),
                    },
                )
                .await
        );
        assert!(matches!(
            receiver.receive().await,
            Some(InferencePayload::Chunk(_))
        ));

        assert!(registry.cleanup("n1", "r1").await);
        assert!(!registry.cleanup("n1", "r1").await);
        assert!(
            !registry
                .route(
                    "n1",
                    InferenceFrame {
                        request_id: "r1".to_string(),
                        payload: InferencePayload::Status(StreamStatus::Completed),
                    },
                )
                .await
        );
        // Channel sender went away with the entry.
        assert!(receiver.receive().await.is_none());
        drop(receiver);
        assert_eq!(conn.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_deregister_fails_pending_requests_once() {
        let registry = NodeRegistry::new("replica-test");
        let (conn, _socket) = connection("n1", "model-x", 16_000);
        registry.register(conn.clone()).await;

        let mut r1 = registry.dispatch("n1", request("r1")).await.unwrap();
        let mut r2 = registry.dispatch("n1", request("r2")).await.unwrap();

        assert!(registry.deregister_connection(&conn).await);
        assert!(registry.get("n1").await.is_none());
        assert!(!registry.deregister_connection(&conn).await);

        for receiver in [&mut r1, &mut r2] {
            match receiver.receive().await {
                Some(InferencePayload::Error(e)) => assert!(e.is_disconnect()),
                other => panic!("unexpected payload {:?}", other),
            }
            assert!(receiver.receive().await.is_none());
        }
    }

    #[tokio::test]
    async fn test_dispatch_after_deregister_fails() {
        let registry = NodeRegistry::new("replica-test");
        let (conn, _socket) = connection("n1", "model-x", 16_000);
        registry.register(conn.clone()).await;
        registry.deregister_connection(&conn).await;

        // A stale handle cannot open requests either.
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = conn.open_request(InFlightRequest {
            request_id: "late".to_string(),
            model: "model-x".to_string(),
            user_id: "caller".to_string(),
            created_at: Utc::now(),
            tx,
        });
        assert_eq!(result, Err(OpenError::Closed));
        assert_eq!(
            registry.dispatch("n1", request("r1")).await.unwrap_err(),
            DispatchError::NodeNotFound("n1".to_string())
        );
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_remove_its_replacement() {
        let registry = NodeRegistry::new("replica-test");
        let (old, _old_socket) = connection("n1", "model-x", 16_000);
        let (new, _new_socket) = connection("n1", "model-x", 16_000);
        assert!(!old.is_same(&new));

        registry.register(old.clone()).await;
        assert!(registry.deregister_connection(&old).await);
        assert!(registry.register(new.clone()).await);
        let _pending = registry.dispatch("n1", request("r1")).await.unwrap();

        // The old session's teardown runs late.
        assert!(!registry.deregister_connection(&old).await);
        let current = registry.get("n1").await.unwrap();
        assert!(current.is_same(&new));
        assert!(!new.is_closed());
        assert_eq!(new.active_requests(), 1);
    }
}
