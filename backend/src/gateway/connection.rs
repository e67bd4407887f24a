//! A registered node connection and its in-flight request table.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Notify};

use fleet_common::{InferencePayload, NodeError, NodeStatus, OutboundFrame};

/// Nodes advertising more VRAM than this are datacenter-class.
pub const DATACENTER_VRAM_MB: u64 = 80_000;
/// Nodes above this VRAM may serve several requests at once.
pub const MULTI_REQUEST_VRAM_MB: u64 = 8_000;

/// Capacity class derived from advertised VRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuClass {
    Datacenter,
    Consumer,
    Small,
}

impl GpuClass {
    pub fn from_vram(vram_mb: u64) -> Self {
        if vram_mb > DATACENTER_VRAM_MB {
            GpuClass::Datacenter
        } else if vram_mb > MULTI_REQUEST_VRAM_MB {
            GpuClass::Consumer
        } else {
            GpuClass::Small
        }
    }
}

/// A request waiting for frames from its node.
#[derive(Debug)]
pub struct InFlightRequest {
    pub request_id: String,
    pub model: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub(crate) tx: mpsc::UnboundedSender<InferencePayload>,
}

#[derive(Debug, Default)]
struct PendingTable {
    closed: bool,
    requests: HashMap<String, InFlightRequest>,
}

/// Why a request could not be opened on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    Closed,
    Duplicate,
}

/// A node accepted by this replica.
#[derive(Debug)]
pub struct NodeConnection {
    pub node_id: String,
    /// Unique per accepted socket; tells a reconnect apart from its
    /// predecessor under the same node id.
    pub connection_id: String,
    pub model: String,
    pub vram_mb: u64,
    pub gpu_class: GpuClass,
    pub connected_at: DateTime<Utc>,
    /// Replica that accepted the connection.
    pub backend_host: String,
    pub self_hosted: bool,
    pub protocol_version: u32,
    tx: mpsc::Sender<OutboundFrame>,
    status: RwLock<NodeStatus>,
    pending: Mutex<PendingTable>,
    closed: Notify,
}

impl NodeConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        model: String,
        vram_mb: u64,
        backend_host: String,
        self_hosted: bool,
        protocol_version: u32,
        status: NodeStatus,
        tx: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            gpu_class: GpuClass::from_vram(vram_mb),
            node_id,
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            model,
            vram_mb,
            connected_at: Utc::now(),
            backend_host,
            self_hosted,
            protocol_version,
            tx,
            status: RwLock::new(status),
            pending: Mutex::new(PendingTable::default()),
            closed: Notify::new(),
        }
    }

    /// In-memory shadow of the persisted status.
    pub fn status(&self) -> NodeStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: NodeStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn active_requests(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .len()
    }

    pub fn pending_ids(&self) -> Vec<String> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = pending.requests.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    /// Queue a frame for the socket task.
    pub async fn send(
        &self,
        frame: OutboundFrame,
    ) -> Result<(), mpsc::error::SendError<OutboundFrame>> {
        self.tx.send(frame).await
    }

    /// Queue a frame without waiting for room in the channel.
    pub fn try_send(
        &self,
        frame: OutboundFrame,
    ) -> Result<(), mpsc::error::TrySendError<OutboundFrame>> {
        self.tx.try_send(frame)
    }

    /// Whether `other` is this very connection rather than another socket
    /// for the same node.
    pub fn is_same(&self, other: &NodeConnection) -> bool {
        self.connection_id == other.connection_id
    }

    pub(crate) fn open_request(&self, request: InFlightRequest) -> Result<(), OpenError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.closed {
            return Err(OpenError::Closed);
        }
        if pending.requests.contains_key(&request.request_id) {
            return Err(OpenError::Duplicate);
        }
        pending
            .requests
            .insert(request.request_id.clone(), request);
        Ok(())
    }

    /// Hand one payload to the request's channel. False when the request is
    /// unknown.
    pub(crate) fn deliver(&self, request_id: &str, payload: InferencePayload) -> bool {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.requests.get(request_id) {
            Some(request) => {
                if request.tx.send(payload).is_err() {
                    tracing::debug!(
                        node_id = %self.node_id,
                        request_id,
                        "Receiver already gone, frame dropped"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Remove a request entry. Idempotent.
    pub(crate) fn close_request(&self, request_id: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .remove(request_id)
            .is_some()
    }

    /// Close the table and push one disconnect error to every pending request.
    /// Returns the ids that were notified.
    pub(crate) fn drain(&self) -> Vec<String> {
        let requests = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.closed = true;
            std::mem::take(&mut pending.requests)
        };

        let mut ids = Vec::with_capacity(requests.len());
        for (id, request) in requests {
            let _ = request
                .tx
                .send(InferencePayload::Error(NodeError::disconnected()));
            ids.push(id);
        }
        ids.sort();
        ids
    }

    /// Ask the socket task to close the connection.
    pub fn shutdown(&self) {
        self.closed.notify_one();
    }

    /// Resolves once `shutdown` has been called.
    pub async fn closed(&self) {
        self.closed.notified().await
    }
}
