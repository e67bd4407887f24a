//! Side protocols multiplexed on node sockets.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use fleet_common::ProtocolFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    PingPong,
    HealthCheck,
}

impl ProtocolId {
    pub fn of(frame: &ProtocolFrame) -> Self {
        match frame {
            ProtocolFrame::PingPong(_) => ProtocolId::PingPong,
            ProtocolFrame::HealthCheck(_) => ProtocolId::HealthCheck,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolId::PingPong => "ping-pong",
            ProtocolId::HealthCheck => "health-check",
        }
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-node protocol driven by inbound frames and a periodic tick.
#[async_trait]
pub trait NodeProtocol: Send + Sync {
    fn id(&self) -> ProtocolId;

    /// How often `tick` runs.
    fn tick_interval(&self) -> Duration;

    /// Handle a frame received from `node_id`.
    async fn handle(&self, node_id: &str, frame: ProtocolFrame);

    /// Periodic work across all tracked nodes.
    async fn tick(&self);

    /// Drop per-node state once the node disconnects.
    async fn forget(&self, node_id: &str);
}

/// Protocols keyed by id.
#[derive(Default)]
pub struct ProtocolTable {
    protocols: HashMap<ProtocolId, Arc<dyn NodeProtocol>>,
}

impl ProtocolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: Arc<dyn NodeProtocol>) {
        self.protocols.insert(protocol.id(), protocol);
    }

    pub fn get(&self, id: ProtocolId) -> Option<&Arc<dyn NodeProtocol>> {
        self.protocols.get(&id)
    }

    /// Hand a frame to its protocol. False when no protocol is registered
    /// for it.
    pub async fn route(&self, node_id: &str, frame: ProtocolFrame) -> bool {
        let id = ProtocolId::of(&frame);
        match self.protocols.get(&id) {
            Some(protocol) => {
                protocol.handle(node_id, frame).await;
                true
            }
            None => {
                tracing::warn!(node_id, protocol = %id, "No handler for protocol frame");
                false
            }
        }
    }

    pub async fn forget_node(&self, node_id: &str) {
        for protocol in self.protocols.values() {
            protocol.forget(node_id).await;
        }
    }

    /// Spawn one timer loop per protocol. A failing tick is logged and the
    /// loop carries on at its next interval.
    pub fn spawn_tickers(&self) -> Vec<JoinHandle<()>> {
        self.protocols
            .values()
            .cloned()
            .map(|protocol| tokio::spawn(run_ticker(protocol)))
            .collect()
    }
}

async fn run_ticker(protocol: Arc<dyn NodeProtocol>) {
    let id = protocol.id();
    // A zero period from config would panic the timer.
    let period = protocol.tick_interval().max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(protocol = %id, "Protocol timer started");

    loop {
        interval.tick().await;
        let p = protocol.clone();
        if let Err(e) = tokio::spawn(async move { p.tick().await }).await {
            tracing::error!(protocol = %id, "Protocol tick failed: {}", e);
        }
    }
}
