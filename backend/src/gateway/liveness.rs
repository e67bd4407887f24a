//! Ping-pong liveness detection.
//!
//! Each registered node is pinged once per interval. A pong that never comes
//! back, or comes back after the timeout, counts as a miss; a node whose miss
//! streak exceeds the threshold is evicted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use fleet_common::{OutboundFrame, PingPongMessage, PingPongType, ProtocolFrame, PROTOCOL_VERSION};

use super::connection::NodeConnection;
use super::metrics::{MetricsIncrement, MetricsSender};
use super::protocol::{NodeProtocol, ProtocolId};
use super::registry::NodeRegistry;
use super::status::NodeStatusService;
use crate::analytics::{self, Analytics, AnalyticsEvent};
use crate::config::PingPongConfig;

/// Heartbeat bookkeeping for one node.
#[derive(Debug, Clone)]
pub struct LivenessState {
    /// The socket this bookkeeping belongs to. A reconnect starts afresh.
    pub connection_id: String,
    pub ping_streak: u32,
    pub miss_streak: u32,
    pub next_ping_at: Instant,
    pub nonce: Option<String>,
    pub waiting_for_pong: bool,
    pub sent_at: Option<Instant>,
    /// Seconds.
    pub last_rtt: Option<f64>,
    pub last_pong_at: Option<Instant>,
}

impl LivenessState {
    fn new(connection_id: &str, now: Instant) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            ping_streak: 0,
            miss_streak: 0,
            next_ping_at: now,
            nonce: None,
            waiting_for_pong: false,
            sent_at: None,
            last_rtt: None,
            last_pong_at: None,
        }
    }

    fn record_miss(&mut self, now: Instant) {
        self.miss_streak += 1;
        self.ping_streak = 0;
        self.waiting_for_pong = false;
        self.nonce = None;
        self.sent_at = None;
        self.next_ping_at = now;
    }
}

pub struct PingPongProtocol {
    config: PingPongConfig,
    registry: Arc<NodeRegistry>,
    status: Arc<NodeStatusService>,
    metrics: MetricsSender,
    analytics: Arc<dyn Analytics>,
    states: Mutex<HashMap<String, LivenessState>>,
}

impl PingPongProtocol {
    pub fn new(
        config: PingPongConfig,
        registry: Arc<NodeRegistry>,
        status: Arc<NodeStatusService>,
        metrics: MetricsSender,
        analytics: Arc<dyn Analytics>,
    ) -> Self {
        Self {
            config,
            registry,
            status,
            metrics,
            analytics,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, node_id: &str) -> Option<LivenessState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub async fn tick_at(&self, now: Instant) {
        let conns = self.registry.connections().await;
        let live: HashSet<&str> = conns.iter().map(|c| c.node_id.as_str()).collect();
        let mut pings = Vec::new();
        let mut evictions = Vec::new();

        {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            states.retain(|id, _| live.contains(id.as_str()));

            for conn in &conns {
                let node_id = &conn.node_id;
                let state = states
                    .entry(node_id.clone())
                    .or_insert_with(|| LivenessState::new(&conn.connection_id, now));
                if state.connection_id != conn.connection_id {
                    *state = LivenessState::new(&conn.connection_id, now);
                }

                if state.waiting_for_pong {
                    let overdue = state
                        .sent_at
                        .map(|sent| now.duration_since(sent) > self.config.timeout())
                        .unwrap_or(true);
                    if overdue {
                        state.record_miss(now);
                        tracing::debug!(
                            node_id = %node_id,
                            miss_streak = state.miss_streak,
                            "Pong not received in time"
                        );
                        if state.miss_streak > self.config.miss_threshold {
                            evictions.push((conn.clone(), state.miss_streak));
                            continue;
                        }
                    }
                }

                if !state.waiting_for_pong && now >= state.next_ping_at {
                    let nonce = uuid::Uuid::new_v4().to_string();
                    let mut ping = PingPongMessage::ping(node_id, &nonce);
                    ping.rtt = state.last_rtt;
                    ping.ping_streak = state.ping_streak;
                    ping.miss_streak = state.miss_streak;

                    state.nonce = Some(nonce);
                    state.waiting_for_pong = true;
                    state.sent_at = Some(now);
                    pings.push((conn.clone(), ping));
                }
            }

            for (conn, _) in &evictions {
                states.remove(&conn.node_id);
            }
        }

        for (conn, miss_streak) in evictions {
            self.evict(&conn, miss_streak).await;
        }

        // A full socket channel must not stall the tick. The unsent ping
        // times out like any other and counts as a miss.
        for (conn, ping) in pings {
            let frame = OutboundFrame::Protocol(ProtocolFrame::PingPong(ping));
            if let Err(e) = conn.try_send(frame) {
                tracing::warn!(node_id = %conn.node_id, "Ping not sent: {}", e);
            }
        }
    }

    pub async fn handle_at(&self, node_id: &str, frame: ProtocolFrame, now: Instant) {
        let ProtocolFrame::PingPong(message) = frame else {
            tracing::warn!(node_id, "Non ping-pong frame handed to liveness");
            return;
        };

        if message.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                node_id,
                version = message.protocol_version,
                "Ignoring pong with wrong protocol version"
            );
            return;
        }
        if message.node_id != node_id {
            tracing::warn!(
                node_id,
                claimed = %message.node_id,
                "Ignoring pong for another node"
            );
            return;
        }
        if message.message_type != PingPongType::Pong {
            tracing::debug!(node_id, "Ignoring unsolicited ping");
            return;
        }

        let mut eviction = None;
        let mut increment = None;
        {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(state) = states.get_mut(node_id) else {
                tracing::warn!(node_id, "Pong from untracked node");
                return;
            };
            if !state.waiting_for_pong || state.nonce.as_deref() != Some(message.nonce.as_str()) {
                tracing::warn!(node_id, nonce = %message.nonce, "Ignoring stale or unexpected pong");
                return;
            }

            let elapsed = state
                .sent_at
                .map(|sent| now.duration_since(sent))
                .unwrap_or(Duration::ZERO);

            if elapsed > self.config.timeout() {
                state.record_miss(now);
                tracing::debug!(
                    node_id,
                    miss_streak = state.miss_streak,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Late pong counted as miss"
                );
                if state.miss_streak > self.config.miss_threshold {
                    eviction = Some((state.connection_id.clone(), state.miss_streak));
                    states.remove(node_id);
                }
            } else {
                let rtt = elapsed.as_secs_f64();
                let uptime = state
                    .last_pong_at
                    .map(|last| now.duration_since(last).as_secs())
                    .unwrap_or(0);

                state.ping_streak += 1;
                state.miss_streak = 0;
                state.waiting_for_pong = false;
                state.nonce = None;
                state.sent_at = None;
                state.last_rtt = Some(rtt);
                state.last_pong_at = Some(now);
                state.next_ping_at = now + self.config.interval();

                let mut metrics = MetricsIncrement::new(node_id);
                metrics.rtt = Some(rtt);
                metrics.uptime = uptime;
                increment = Some(metrics);
            }
        }

        if let Some(metrics) = increment {
            self.metrics.submit(metrics);
        }
        if let Some((connection_id, miss_streak)) = eviction {
            match self.registry.get(node_id).await {
                Some(conn) if conn.connection_id == connection_id => {
                    self.evict(&conn, miss_streak).await;
                }
                _ => tracing::debug!(node_id, "Late pong from a connection already gone"),
            }
        }
    }

    /// Remove `conn` from this replica and close its socket. Returns false
    /// when it was already gone or replaced by a newer connection.
    pub async fn evict(&self, conn: &NodeConnection, miss_streak: u32) -> bool {
        let node_id = conn.node_id.as_str();
        match self.status.detach(conn).await {
            Ok(None) => return false,
            Ok(Some(_)) => {}
            Err(e) => tracing::error!(node_id, "Failed to persist eviction: {}", e),
        }
        conn.shutdown();
        tracing::warn!(node_id, miss_streak, "Evicting unresponsive node");

        analytics::track(
            &self.analytics,
            node_id,
            AnalyticsEvent::NodeEvicted {
                node_id: node_id.to_string(),
                miss_streak,
            },
        );
        true
    }
}

#[async_trait]
impl NodeProtocol for PingPongProtocol {
    fn id(&self) -> ProtocolId {
        ProtocolId::PingPong
    }

    fn tick_interval(&self) -> Duration {
        self.config.tick()
    }

    async fn handle(&self, node_id: &str, frame: ProtocolFrame) {
        self.handle_at(node_id, frame, Instant::now()).await
    }

    async fn tick(&self) {
        self.tick_at(Instant::now()).await
    }

    async fn forget(&self, node_id: &str) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id);
    }
}
