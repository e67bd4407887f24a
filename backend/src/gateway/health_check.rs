//! Synthetic inference probes measuring serving quality.
//!
//! Every interval each node gets a real inference request through the normal
//! dispatch path. Time to first token and throughput decide whether the node
//! is performant; the result drives the node's status.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;

use fleet_common::{
    ChatCompletionRequest, GpuUsage, HealthCheckMessage, HealthCheckType, OutboundFrame,
    ProtocolFrame, PROTOCOL_VERSION,
};

use super::connection::NodeConnection;
use super::correlator::{InferenceError, RequestCorrelator};
use super::protocol::{NodeProtocol, ProtocolId};
use super::registry::{DispatchError, NodeRegistry};
use super::status::{NodeEvent, NodeStatusService};
use crate::config::HealthCheckConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Node is no longer connected")]
    NodeGone,
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("Probe produced no output")]
    NoOutput,
}

/// Latest utilization reported by a node.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStats {
    pub cpu_percent: Option<f32>,
    pub ram_percent: Option<f32>,
    pub disk_percent: Option<f32>,
    pub gpus: Vec<GpuUsage>,
    pub received_at: DateTime<Utc>,
}

/// Probe bookkeeping for one node.
#[derive(Debug, Clone)]
pub struct HealthProbeState {
    /// The socket this bookkeeping belongs to. A reconnect starts afresh.
    pub connection_id: String,
    pub waiting: bool,
    /// Nonce of the most recent probe.
    pub nonce: Option<String>,
    pub next_probe_at: Instant,
    pub stats: Option<SystemStats>,
}

impl HealthProbeState {
    fn new(connection_id: &str, now: Instant) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            waiting: false,
            nonce: None,
            next_probe_at: now,
            stats: None,
        }
    }
}

/// Measured figures of a completed probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub time_to_first_token: Duration,
    pub tokens_per_second: Option<f64>,
    pub prompt_size: u32,
    pub performant: bool,
}

/// Small prompts must start within the small TTFT bound, others within the
/// big one; throughput must beat the model's floor.
pub fn is_performant(
    config: &HealthCheckConfig,
    model: &str,
    prompt_size: u32,
    time_to_first_token: Duration,
    tokens_per_second: Option<f64>,
) -> bool {
    let ttft_limit = if prompt_size < config.small_prompt_size {
        config.min_time_to_first_token_small_sec
    } else {
        config.min_time_to_first_token_big_sec
    };
    let min_tps = config.min_tokens_per_second_for(model);

    time_to_first_token.as_secs_f64() <= ttft_limit
        && tokens_per_second.is_some_and(|tps| tps > min_tps)
}

pub struct HealthCheckProtocol {
    config: HealthCheckConfig,
    registry: Arc<NodeRegistry>,
    correlator: Arc<RequestCorrelator>,
    status: Arc<NodeStatusService>,
    states: Mutex<HashMap<String, HealthProbeState>>,
}

impl HealthCheckProtocol {
    pub fn new(
        config: HealthCheckConfig,
        registry: Arc<NodeRegistry>,
        correlator: Arc<RequestCorrelator>,
        status: Arc<NodeStatusService>,
    ) -> Self {
        Self {
            config,
            registry,
            correlator,
            status,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, node_id: &str) -> Option<HealthProbeState> {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    pub fn system_stats(&self, node_id: &str) -> Option<SystemStats> {
        self.state(node_id).and_then(|s| s.stats)
    }

    /// Probe every running node that is due, concurrently, and apply the
    /// results. Stopped nodes are left alone until they reconnect.
    pub async fn tick_at(&self, now: Instant) {
        let conns = self.registry.connections().await;
        let live: HashSet<&str> = conns.iter().map(|c| c.node_id.as_str()).collect();
        let mut due = Vec::new();

        {
            let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            states.retain(|id, _| live.contains(id.as_str()));
            for conn in &conns {
                let state = states
                    .entry(conn.node_id.clone())
                    .or_insert_with(|| HealthProbeState::new(&conn.connection_id, now));
                if state.connection_id != conn.connection_id {
                    *state = HealthProbeState::new(&conn.connection_id, now);
                }
                if !conn.status().is_running() || state.waiting || now < state.next_probe_at {
                    continue;
                }
                let nonce = uuid::Uuid::new_v4().simple().to_string();
                state.waiting = true;
                state.nonce = Some(nonce.clone());
                state.next_probe_at = now + self.config.interval();
                due.push((conn.clone(), nonce));
            }
        }

        if due.is_empty() {
            return;
        }
        tracing::debug!(nodes = due.len(), "Running health probes");
        join_all(due.iter().map(|(conn, nonce)| self.check_node(conn, nonce))).await;
    }

    async fn check_node(&self, conn: &Arc<NodeConnection>, nonce: &str) {
        let node_id = conn.node_id.as_str();
        let result = self.probe(node_id, nonce).await;

        if let Some(state) = self
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(node_id)
            .filter(|state| state.connection_id == conn.connection_id)
        {
            state.waiting = false;
        }

        match self.registry.get(node_id).await {
            Some(current) if current.is_same(conn) => {}
            _ => {
                tracing::debug!(node_id, "Node left during health probe");
                return;
            }
        }

        let event = match &result {
            Ok(outcome) if outcome.performant => {
                tracing::debug!(
                    node_id,
                    ttft_ms = outcome.time_to_first_token.as_millis() as u64,
                    tokens_per_second = ?outcome.tokens_per_second,
                    "Health probe passed"
                );
                NodeEvent::Recovered
            }
            Ok(outcome) => {
                tracing::warn!(
                    node_id,
                    ttft_ms = outcome.time_to_first_token.as_millis() as u64,
                    tokens_per_second = ?outcome.tokens_per_second,
                    prompt_size = outcome.prompt_size,
                    "Node is not performant"
                );
                NodeEvent::Degraded
            }
            Err(e) => {
                tracing::warn!(node_id, "Health probe failed: {}", e);
                NodeEvent::Degraded
            }
        };

        match self.status.apply(node_id, event).await {
            // A stopped node takes no traffic and is not probed again; closing
            // the socket lets it reconnect and start over.
            Ok(transition) if !transition.next.is_running() => {
                tracing::warn!(
                    node_id,
                    status = %transition.next,
                    "Closing connection of stopped node"
                );
                conn.shutdown();
            }
            Ok(_) => {}
            Err(e) => tracing::error!(node_id, "Failed to record health probe result: {}", e),
        }
    }

    /// Send the stats request and run one inference probe, all within the
    /// probe timeout.
    pub async fn probe(&self, node_id: &str, nonce: &str) -> Result<ProbeOutcome, ProbeError> {
        let timeout = self.config.timeout();
        tokio::time::timeout(timeout, self.measure(node_id, nonce))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
    }

    async fn measure(&self, node_id: &str, nonce: &str) -> Result<ProbeOutcome, ProbeError> {
        let node = self
            .registry
            .get(node_id)
            .await
            .ok_or(ProbeError::NodeGone)?;

        let request = OutboundFrame::Protocol(ProtocolFrame::HealthCheck(
            HealthCheckMessage::request(node_id, nonce),
        ));
        if let Err(e) = node.try_send(request) {
            tracing::warn!(node_id, "Health-check request not sent: {}", e);
        }

        let chat = ChatCompletionRequest::user_prompt(
            &node.model,
            &self.config.probe_prompt,
            Some(self.config.probe_max_tokens),
        );
        let prompt_chars = chat.prompt_chars() as u32;
        let mut stream = self
            .correlator
            .probe(node_id, format!("health-check-{}", nonce), &node.model, chat)
            .await?;

        let (chunks, error) = stream.collect().await;
        if let Some(e) = error {
            return Err(e.into());
        }

        let summary = stream.summary();
        if chunks.is_empty() {
            return Err(ProbeError::NoOutput);
        }
        let time_to_first_token = summary.time_to_first_token.ok_or(ProbeError::NoOutput)?;
        let prompt_size = summary
            .usage
            .map(|u| u.prompt_tokens)
            .unwrap_or(prompt_chars);

        Ok(ProbeOutcome {
            time_to_first_token,
            tokens_per_second: summary.tokens_per_second,
            prompt_size,
            performant: is_performant(
                &self.config,
                &node.model,
                prompt_size,
                time_to_first_token,
                summary.tokens_per_second,
            ),
        })
    }

    fn record_stats(&self, node_id: &str, message: HealthCheckMessage) {
        if message.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                node_id,
                version = message.protocol_version,
                "Ignoring health-check response with wrong protocol version"
            );
            return;
        }
        if message.message_type != HealthCheckType::Response {
            tracing::debug!(node_id, "Ignoring health-check request from node");
            return;
        }

        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = states.get_mut(node_id) else {
            tracing::warn!(node_id, "Health-check response from untracked node");
            return;
        };
        if state.nonce.as_deref() != Some(message.nonce.as_str()) {
            tracing::warn!(node_id, nonce = %message.nonce, "Ignoring stale health-check response");
            return;
        }
        state.stats = Some(SystemStats {
            cpu_percent: message.cpu_percent,
            ram_percent: message.ram_percent,
            disk_percent: message.disk_percent,
            gpus: message.gpus,
            received_at: Utc::now(),
        });
    }
}

#[async_trait]
impl NodeProtocol for HealthCheckProtocol {
    fn id(&self) -> ProtocolId {
        ProtocolId::HealthCheck
    }

    fn tick_interval(&self) -> Duration {
        self.config.tick()
    }

    async fn handle(&self, node_id: &str, frame: ProtocolFrame) {
        match frame {
            ProtocolFrame::HealthCheck(message) => self.record_stats(node_id, message),
            _ => tracing::warn!(node_id, "Non health-check frame handed to health check"),
        }
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
