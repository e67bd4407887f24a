//! Persistence collaborators used by the dispatch core.
//!
//! The core only depends on the traits here; `MemoryStore` backs tests and
//! single-process setups, `SqliteStore` backs the shipped binary.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fleet_common::NodeStatus;

use crate::gateway::metrics::MetricsIncrement;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Corrupt record for node {node_id}: {detail}")]
    Corrupt { node_id: String, detail: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A previously measured throughput figure for a (node, model) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Benchmark {
    pub node_id: String,
    pub model: String,
    pub tokens_per_second: f64,
    pub created_at: DateTime<Utc>,
}

/// Persisted per-node metric totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetrics {
    pub requests_served: u64,
    pub requests_successful: u64,
    pub requests_failed: u64,
    pub time_to_first_token: Option<f64>,
    pub inference_tokens_per_second: Option<f64>,
    pub rtt: Option<f64>,
    pub uptime: u64,
}

impl NodeMetrics {
    pub fn apply(&mut self, increment: &MetricsIncrement) {
        self.requests_served += increment.requests_served;
        self.requests_successful += increment.requests_successful;
        self.requests_failed += increment.requests_failed;
        self.uptime += increment.uptime;
        if increment.time_to_first_token.is_some() {
            self.time_to_first_token = increment.time_to_first_token;
        }
        if increment.inference_tokens_per_second.is_some() {
            self.inference_tokens_per_second = increment.inference_tokens_per_second;
        }
        if increment.rtt.is_some() {
            self.rtt = increment.rtt;
        }
    }
}

#[async_trait]
pub trait BenchmarkRepository: Send + Sync {
    /// Latest benchmark recorded for the node serving `model`.
    async fn get(&self, node_id: &str, model: &str) -> Result<Option<Benchmark>, StoreError>;
}

#[async_trait]
pub trait NodeStatusStore: Send + Sync {
    async fn get_status(&self, node_id: &str) -> Result<Option<NodeStatus>, StoreError>;

    async fn set_status(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError>;

    /// Record a connect (running `status`) or disconnect against `host`.
    async fn set_connection_timestamp(
        &self,
        node_id: &str,
        host: &str,
        status: NodeStatus,
    ) -> Result<(), StoreError>;

    /// Node ids currently recorded as connected to `host`.
    async fn nodes_connected_to_host(&self, host: &str) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Apply one folded increment: additive fields add, scalar fields
    /// overwrite only when present.
    async fn increment(&self, increment: &MetricsIncrement) -> Result<(), StoreError>;

    /// Persist every increment independently; returns the failures.
    async fn increment_bulk(&self, increments: &[MetricsIncrement]) -> Vec<(String, StoreError)> {
        let mut failures = Vec::new();
        for increment in increments {
            if let Err(e) = self.increment(increment).await {
                failures.push((increment.node_id.clone(), e));
            }
        }
        failures
    }
}
