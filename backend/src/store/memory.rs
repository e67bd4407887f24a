use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use fleet_common::NodeStatus;

use super::{
    Benchmark, BenchmarkRepository, MetricsStore, NodeMetrics, NodeStatusStore, StoreError,
};
use crate::gateway::metrics::MetricsIncrement;

/// In-process store implementing every collaborator trait.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    benchmarks: HashMap<(String, String), Benchmark>,
    statuses: HashMap<String, StatusRecord>,
    metrics: HashMap<String, NodeMetrics>,
    failing_metrics: HashSet<String>,
}

#[derive(Debug, Clone)]
struct StatusRecord {
    status: NodeStatus,
    backend_host: Option<String>,
    connected_at: Option<DateTime<Utc>>,
    disconnected_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    fn new(status: NodeStatus) -> Self {
        Self {
            status,
            backend_host: None,
            connected_at: None,
            disconnected_at: None,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_benchmark(&self, node_id: &str, model: &str, tokens_per_second: f64) {
        let benchmark = Benchmark {
            node_id: node_id.to_string(),
            model: model.to_string(),
            tokens_per_second,
            created_at: Utc::now(),
        };
        self.inner
            .write()
            .await
            .benchmarks
            .insert((node_id.to_string(), model.to_string()), benchmark);
    }

    /// Record `node_id` as connected to `host` without going through a
    /// connection, as a crashed replica would have left it.
    pub async fn mark_connected(&self, node_id: &str, host: &str, status: NodeStatus) {
        let mut inner = self.inner.write().await;
        let record = inner
            .statuses
            .entry(node_id.to_string())
            .or_insert_with(|| StatusRecord::new(status));
        record.status = status;
        record.backend_host = Some(host.to_string());
        record.connected_at = Some(Utc::now());
    }

    pub async fn backend_host_of(&self, node_id: &str) -> Option<String> {
        self.inner
            .read()
            .await
            .statuses
            .get(node_id)
            .and_then(|r| r.backend_host.clone())
    }

    pub async fn disconnected_at(&self, node_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .await
            .statuses
            .get(node_id)
            .and_then(|r| r.disconnected_at)
    }

    pub async fn metrics_for(&self, node_id: &str) -> Option<NodeMetrics> {
        self.inner.read().await.metrics.get(node_id).cloned()
    }

    /// Make every metrics write for `node_id` fail.
    pub async fn fail_metrics_for(&self, node_id: &str) {
        self.inner
            .write()
            .await
            .failing_metrics
            .insert(node_id.to_string());
    }
}

#[async_trait]
impl BenchmarkRepository for MemoryStore {
    async fn get(&self, node_id: &str, model: &str) -> Result<Option<Benchmark>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .benchmarks
            .get(&(node_id.to_string(), model.to_string()))
            .cloned())
    }
}

#[async_trait]
impl NodeStatusStore for MemoryStore {
    async fn get_status(&self, node_id: &str) -> Result<Option<NodeStatus>, StoreError> {
        Ok(self.inner.read().await.statuses.get(node_id).map(|r| r.status))
    }

    async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .statuses
            .entry(node_id.to_string())
            .or_insert_with(|| StatusRecord::new(status))
            .status = status;
        Ok(())
    }

    async fn set_connection_timestamp(
        &self,
        node_id: &str,
        host: &str,
        status: NodeStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .statuses
            .entry(node_id.to_string())
            .or_insert_with(|| StatusRecord::new(status));
        record.status = status;
        let now = Utc::now();
        if status.is_running() {
            record.backend_host = Some(host.to_string());
            record.connected_at = Some(now);
        } else if record.backend_host.as_deref() == Some(host) {
            record.backend_host = None;
            record.disconnected_at = Some(now);
        }
        Ok(())
    }

    async fn nodes_connected_to_host(&self, host: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<String> = inner
            .statuses
            .iter()
            .filter(|(_, r)| r.backend_host.as_deref() == Some(host))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn increment(&self, increment: &MetricsIncrement) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.failing_metrics.contains(&increment.node_id) {
            return Err(StoreError::Database(format!(
                "metrics write rejected for {}",
                increment.node_id
            )));
        }
        inner
            .metrics
            .entry(increment.node_id.clone())
            .or_default()
            .apply(increment);
        Ok(())
    }
}
