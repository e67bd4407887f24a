//! Admission-controlled node selection.

use std::sync::Arc;

use rand::seq::SliceRandom;

use super::connection::{GpuClass, NodeConnection};
use super::registry::NodeRegistry;

/// Concurrent request limits per GPU class.
#[derive(Debug, Clone, Copy)]
pub struct CapacityLimits {
    pub max_parallel_requests_per_node: usize,
    pub max_parallel_requests_per_datacenter_node: usize,
}

impl CapacityLimits {
    pub fn allows(&self, class: GpuClass, active_requests: usize) -> bool {
        match class {
            GpuClass::Datacenter => active_requests < self.max_parallel_requests_per_datacenter_node,
            GpuClass::Consumer => active_requests < self.max_parallel_requests_per_node,
            GpuClass::Small => active_requests == 0,
        }
    }
}

impl From<&crate::config::NodesConfig> for CapacityLimits {
    fn from(config: &crate::config::NodesConfig) -> Self {
        Self {
            max_parallel_requests_per_node: config.max_parallel_requests_per_node,
            max_parallel_requests_per_datacenter_node: config
                .max_parallel_requests_per_datacenter_node,
        }
    }
}

/// Picks a node for a model among those passing admission.
pub struct NodeSelector {
    registry: Arc<NodeRegistry>,
    limits: CapacityLimits,
}

impl NodeSelector {
    pub fn new(registry: Arc<NodeRegistry>, limits: CapacityLimits) -> Self {
        Self { registry, limits }
    }

    /// Self-hosted nodes skip the status filter.
    pub fn is_admissible(&self, node: &NodeConnection) -> bool {
        (node.self_hosted || node.status().accepts_traffic())
            && self.limits.allows(node.gpu_class, node.active_requests())
    }

    /// Uniformly random eligible node, or `None` when nothing has capacity.
    pub async fn select(&self, model: &str) -> Option<Arc<NodeConnection>> {
        let eligible: Vec<Arc<NodeConnection>> = self
            .registry
            .nodes_by_model(model)
            .await
            .into_iter()
            .filter(|n| self.is_admissible(n))
            .collect();

        let chosen = eligible.choose(&mut rand::thread_rng()).cloned();
        match &chosen {
            Some(node) => tracing::debug!(
                model,
                node_id = %node.node_id,
                candidates = eligible.len(),
                "Node selected"
            ),
            None => tracing::debug!(model, "No eligible node"),
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::connection::tests::{connection, occupy};
    use fleet_common::NodeStatus;
    use std::collections::HashSet;

    fn limits() -> CapacityLimits {
        CapacityLimits {
            max_parallel_requests_per_node: 4,
            max_parallel_requests_per_datacenter_node: 20,
        }
    }

    async fn setup(nodes: Vec<NodeConnection>) -> (Arc<NodeRegistry>, NodeSelector) {
        let registry = Arc::new(NodeRegistry::new("replica-test"));
        for node in nodes {
            registry.register(Arc::new(node)).await;
        }
        let selector = NodeSelector::new(registry.clone(), limits());
        (registry, selector)
    }

    #[tokio::test]
    async fn test_selects_idle_consumer_node() {
        let (_registry, selector) = setup(vec![connection("n", "model-x", 16_000)]).await;
        let node = selector.select("model-x").await.unwrap();
        assert_eq!(node.node_id, "n");
        assert!(selector.select("model-y").await.is_none());
    }

    #[tokio::test]
    async fn test_datacenter_limit() {
        let (registry, selector) = setup(vec![connection("dc", "model-x", 81_000)]).await;
        let node = registry.get("dc").await.unwrap();

        for i in 0..20 {
            occupy(&node, &format!("r{}", i));
        }
        assert!(selector.select("model-x").await.is_none());

        node.close_request("r7");
        assert_eq!(selector.select("model-x").await.unwrap().node_id, "dc");
    }

    #[tokio::test]
    async fn test_consumer_limit() {
        let (registry, selector) = setup(vec![connection("c", "model-x", 24_000)]).await;
        let node = registry.get("c").await.unwrap();
        for i in 0..3 {
            occupy(&node, &format!("r{}", i));
        }
        assert!(selector.select("model-x").await.is_some());
        occupy(&node, "r3");
        assert!(selector.select("model-x").await.is_none());
    }

    #[tokio::test]
    async fn test_small_node_serves_one_request() {
        let (registry, selector) = setup(vec![connection("s", "model-x", 6_000)]).await;
        assert!(selector.select("model-x").await.is_some());
        occupy(&registry.get("s").await.unwrap(), "r0");
        assert!(selector.select("model-x").await.is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_nodes_are_skipped_unless_self_hosted() {
        let degraded = connection("degraded", "model-x", 16_000);
        degraded.set_status(NodeStatus::RunningDegraded);
        let benchmarking = connection("bench", "model-x", 16_000);
        benchmarking.set_status(NodeStatus::RunningBenchmarking);
        let mut trusted = connection("trusted", "model-y", 16_000);
        trusted.self_hosted = true;
        trusted.set_status(NodeStatus::StoppedDegraded);

        let (_registry, selector) = setup(vec![degraded, benchmarking, trusted]).await;
        assert!(selector.select("model-x").await.is_none());
        assert_eq!(selector.select("model-y").await.unwrap().node_id, "trusted");
    }

    #[tokio::test]
    async fn test_selection_spreads_across_nodes() {
        let (_registry, selector) = setup(vec![
            connection("a", "model-x", 16_000),
            connection("b", "model-x", 16_000),
            connection("c", "model-x", 16_000),
        ])
        .await;

        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(selector.select("model-x").await.unwrap().node_id.clone());
        }
        assert_eq!(seen.len(), 3);
    }
}
