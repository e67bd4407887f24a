//! Persisted node availability states.

use serde::{Deserialize, Serialize};

/// Availability state of a node.
///
/// The authoritative copy lives in persistent storage; connected nodes keep a
/// shadow copy for selection checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Running,
    RunningBenchmarking,
    RunningDegraded,
    Stopped,
    StoppedBenchmarkFailed,
    StoppedDegraded,
}

impl NodeStatus {
    /// All variants for iteration.
    pub const ALL: [NodeStatus; 6] = [
        NodeStatus::Running,
        NodeStatus::RunningBenchmarking,
        NodeStatus::RunningDegraded,
        NodeStatus::Stopped,
        NodeStatus::StoppedBenchmarkFailed,
        NodeStatus::StoppedDegraded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Running => "RUNNING",
            NodeStatus::RunningBenchmarking => "RUNNING_BENCHMARKING",
            NodeStatus::RunningDegraded => "RUNNING_DEGRADED",
            NodeStatus::Stopped => "STOPPED",
            NodeStatus::StoppedBenchmarkFailed => "STOPPED_BENCHMARK_FAILED",
            NodeStatus::StoppedDegraded => "STOPPED_DEGRADED",
        }
    }

    /// Whether the node is connected and serving in some form.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            NodeStatus::Running | NodeStatus::RunningBenchmarking | NodeStatus::RunningDegraded
        )
    }

    /// Whether the node may receive real user traffic.
    pub fn accepts_traffic(&self) -> bool {
        matches!(self, NodeStatus::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown node status: {}", s))
    }
}
