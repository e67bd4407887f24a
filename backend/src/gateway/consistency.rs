//! Reconciles persisted "connected to this replica" records with the live
//! registry.
//!
//! A replica that crashed never got to record its nodes as disconnected. Any
//! node the store still attributes to this host but that the registry does
//! not hold is stopped here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::registry::NodeRegistry;
use super::status::NodeStatusService;
use crate::store::{NodeStatusStore, StoreError};

pub struct ReplicaConsistencyJob {
    store: Arc<dyn NodeStatusStore>,
    registry: Arc<NodeRegistry>,
    status: Arc<NodeStatusService>,
    interval: Duration,
}

impl ReplicaConsistencyJob {
    pub fn new(
        store: Arc<dyn NodeStatusStore>,
        registry: Arc<NodeRegistry>,
        status: Arc<NodeStatusService>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            status,
            interval,
        }
    }

    /// One reconciliation pass. Returns the node ids that were stopped.
    pub async fn reconcile(&self) -> Result<Vec<String>, StoreError> {
        let recorded = self
            .store
            .nodes_connected_to_host(self.registry.backend_host())
            .await?;
        let live: HashSet<String> = self.registry.node_ids().await.into_iter().collect();

        let mut stopped = Vec::new();
        for node_id in recorded.into_iter().filter(|id| !live.contains(id)) {
            match self.status.release_stale(&node_id).await {
                Ok(None) => {
                    tracing::debug!(node_id = %node_id, "Node reconnected during reconciliation");
                }
                Ok(Some(status)) => {
                    tracing::warn!(
                        node_id = %node_id,
                        status = %status,
                        "Stale connection record cleared"
                    );
                    stopped.push(node_id);
                }
                Err(e) => {
                    tracing::error!(node_id = %node_id, "Failed to clear stale connection: {}", e);
                }
            }
        }
        Ok(stopped)
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            backend_host = %self.registry.backend_host(),
            "Replica consistency job started"
        );

        loop {
            interval.tick().await;
            if let Err(e) = self.reconcile().await {
                tracing::error!("Replica consistency pass failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::tests::connection;
    use crate::store::MemoryStore;
    use fleet_common::NodeStatus;

    fn job(store: Arc<MemoryStore>, registry: Arc<NodeRegistry>) -> ReplicaConsistencyJob {
        let status = Arc::new(NodeStatusService::new(store.clone(), registry.clone()));
        ReplicaConsistencyJob::new(store, registry, status, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_stale_records_are_stopped() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeRegistry::new("replica-test"));
        registry
            .register(Arc::new(connection("live", "model-x", 16_000)))
            .await;

        store.mark_connected("live", "replica-test", NodeStatus::Running).await;
        store.mark_connected("ghost", "replica-test", NodeStatus::RunningDegraded).await;
        store.mark_connected("elsewhere", "replica-other", NodeStatus::Running).await;

        let stopped = job(store.clone(), registry).reconcile().await.unwrap();
        assert_eq!(stopped, vec!["ghost".to_string()]);

        assert_eq!(
            store.get_status("ghost").await.unwrap(),
            Some(NodeStatus::StoppedDegraded)
        );
        assert_eq!(
            store.nodes_connected_to_host("replica-test").await.unwrap(),
            vec!["live".to_string()]
        );
        assert_eq!(
            store.backend_host_of("elsewhere").await.as_deref(),
            Some("replica-other")
        );
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeRegistry::new("replica-test"));
        store.mark_connected("ghost", "replica-test", NodeStatus::Running).await;

        let job = job(store.clone(), registry);
        assert_eq!(job.reconcile().await.unwrap().len(), 1);
        assert!(job.reconcile().await.unwrap().is_empty());
        assert_eq!(
            store.get_status("ghost").await.unwrap(),
            Some(NodeStatus::Stopped)
        );
    }

    #[tokio::test]
    async fn test_zero_interval_still_reconciles() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeRegistry::new("replica-test"));
        store.mark_connected("ghost", "replica-test", NodeStatus::Running).await;
        let status = Arc::new(NodeStatusService::new(store.clone(), registry.clone()));
        let job = ReplicaConsistencyJob::new(store.clone(), registry, status, Duration::ZERO);

        let handle = tokio::spawn(job.run());
        for _ in 0..50 {
            if store.backend_host_of("ghost").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.is_finished());
        handle.abort();
        assert_eq!(
            store.get_status("ghost").await.unwrap(),
            Some(NodeStatus::Stopped)
        );
    }
}
