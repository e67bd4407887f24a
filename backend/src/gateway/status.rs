//! Node availability state machine and its persistence wrapper.

use std::sync::Arc;

use fleet_common::NodeStatus;
use tokio::sync::Mutex;

use super::connection::NodeConnection;
use super::registry::NodeRegistry;
use crate::store::{NodeStatusStore, StoreError};

/// Inputs to the availability state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    Start,
    Stop,
    Degraded,
    /// A health probe found the node performant again.
    Recovered,
}

/// Result of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: NodeStatus,
    /// False when the pair was not in the table and the fallback applied.
    pub mapped: bool,
}

pub struct NodeStatusMachine;

impl NodeStatusMachine {
    /// Pure transition function. Unmapped pairs keep the current state, or
    /// fall back to `STOPPED` when there is none.
    pub fn transition(current: Option<NodeStatus>, event: NodeEvent) -> Transition {
        use NodeEvent::*;
        use NodeStatus::*;

        let next = match (current, event) {
            (None, Start) => Some(RunningBenchmarking),

            (Some(Running), Start) => Some(Running),
            (Some(Running), Stop) => Some(Stopped),
            (Some(Running), Degraded) => Some(RunningDegraded),
            (Some(Running), Recovered) => Some(Running),

            (Some(RunningBenchmarking), Start) => Some(RunningBenchmarking),
            (Some(RunningBenchmarking), Stop) => Some(StoppedBenchmarkFailed),
            (Some(RunningBenchmarking), Degraded) => Some(StoppedBenchmarkFailed),
            (Some(RunningBenchmarking), Recovered) => Some(Running),

            (Some(RunningDegraded), Start) => Some(RunningDegraded),
            (Some(RunningDegraded), Stop) => Some(StoppedDegraded),
            (Some(RunningDegraded), Degraded) => Some(RunningDegraded),
            (Some(RunningDegraded), Recovered) => Some(Running),

            (Some(Stopped), Start) => Some(Running),
            (Some(StoppedBenchmarkFailed), Start) => Some(RunningBenchmarking),
            (Some(StoppedDegraded), Start) => Some(RunningBenchmarking),

            _ => None,
        };

        match next {
            Some(next) => Transition { next, mapped: true },
            None => {
                let fallback = current.unwrap_or(Stopped);
                tracing::error!(
                    current = ?current,
                    event = ?event,
                    fallback = %fallback,
                    "Unmapped node status transition"
                );
                Transition {
                    next: fallback,
                    mapped: false,
                }
            }
        }
    }
}

/// Applies events against the persisted status and the live connection's
/// shadow copy.
///
/// Attaching and detaching connections is serialized, so a late teardown of
/// an old socket can never stop a node that has since reconnected.
pub struct NodeStatusService {
    store: Arc<dyn NodeStatusStore>,
    registry: Arc<NodeRegistry>,
    lifecycle: Mutex<()>,
}

impl NodeStatusService {
    pub fn new(store: Arc<dyn NodeStatusStore>, registry: Arc<NodeRegistry>) -> Self {
        Self {
            store,
            registry,
            lifecycle: Mutex::new(()),
        }
    }

    pub async fn current(&self, node_id: &str) -> Result<Option<NodeStatus>, StoreError> {
        self.store.get_status(node_id).await
    }

    pub async fn apply(&self, node_id: &str, event: NodeEvent) -> Result<Transition, StoreError> {
        let current = self.store.get_status(node_id).await?;
        let transition = NodeStatusMachine::transition(current, event);

        if current != Some(transition.next) {
            self.store.set_status(node_id, transition.next).await?;
            tracing::info!(
                node_id,
                event = ?event,
                from = ?current,
                to = %transition.next,
                "Node status changed"
            );
        }

        if let Some(conn) = self.registry.get(node_id).await {
            conn.set_status(transition.next);
        }
        Ok(transition)
    }

    /// Record that this replica now holds the node's connection.
    pub async fn connect(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError> {
        self.store
            .set_connection_timestamp(node_id, self.registry.backend_host(), status)
            .await
    }

    /// Apply `STOP` and persist the disconnect against `host`. A node that is
    /// already stopped keeps its status.
    pub async fn disconnect(&self, node_id: &str, host: &str) -> Result<NodeStatus, StoreError> {
        let next = match self.store.get_status(node_id).await? {
            Some(status) if !status.is_running() => status,
            _ => self.apply(node_id, NodeEvent::Stop).await?.next,
        };
        self.store.set_connection_timestamp(node_id, host, next).await?;
        Ok(next)
    }

    /// Register `conn`, apply `START` and record this replica as its host.
    /// `Ok(None)` when the node id is already connected here. On a store
    /// failure the connection is removed again.
    pub async fn attach(&self, conn: Arc<NodeConnection>) -> Result<Option<NodeStatus>, StoreError> {
        let _guard = self.lifecycle.lock().await;
        if !self.registry.register(conn.clone()).await {
            return Ok(None);
        }

        let started = async {
            let transition = self.apply(&conn.node_id, NodeEvent::Start).await?;
            self.connect(&conn.node_id, transition.next).await?;
            Ok::<_, StoreError>(transition.next)
        }
        .await;

        match started {
            Ok(status) => Ok(Some(status)),
            Err(e) => {
                self.registry.deregister_connection(&conn).await;
                Err(e)
            }
        }
    }

    /// Deregister `conn` and persist its disconnect. `Ok(None)` when `conn`
    /// was no longer the node's registered connection; nothing is recorded
    /// then. An `Err` means the connection was removed but the store write
    /// failed.
    pub async fn detach(&self, conn: &NodeConnection) -> Result<Option<NodeStatus>, StoreError> {
        let _guard = self.lifecycle.lock().await;
        if !self.registry.deregister_connection(conn).await {
            return Ok(None);
        }
        self.disconnect(&conn.node_id, self.registry.backend_host())
            .await
            .map(Some)
    }

    /// Stop a node this replica is recorded as hosting but holds no
    /// connection for. `Ok(None)` when the node has connected meanwhile.
    pub async fn release_stale(&self, node_id: &str) -> Result<Option<NodeStatus>, StoreError> {
        let _guard = self.lifecycle.lock().await;
        if self.registry.get(node_id).await.is_some() {
            return Ok(None);
        }
        self.disconnect(node_id, self.registry.backend_host())
            .await
            .map(Some)
    }
}
