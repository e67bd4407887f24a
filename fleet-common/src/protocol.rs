//! WebSocket protocol types for broker-node communication.
//!
//! All frames are JSON text messages over a single long-lived WebSocket that
//! the node opens to the broker.
//!
//! # Connection Flow
//!
//! 1. Node connects to the broker's node endpoint
//! 2. Node sends `register` with its id, served model and VRAM
//! 3. Broker checks the recorded benchmark for the model, then replies with
//!    `register_ack` or closes the socket with a policy-violation code
//! 4. Broker sends dispatch frames; node streams back inference frames keyed
//!    by `request_id`
//!
//! # Side Protocols
//!
//! Frames with a `protocol` key belong to a side protocol multiplexed on the
//! same socket:
//! - **ping-pong**: transport liveness, broker sends `PING`, node answers `PONG`
//! - **health-check**: broker asks for system utilization alongside a
//!   synthetic inference probe

use serde::{Deserialize, Serialize};

use crate::{ChatCompletionChunk, ChatCompletionRequest, NodeStatus};

/// Protocol version constant.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error code used for the synthetic error pushed to pending requests when
/// their node goes away.
pub const NODE_DISCONNECTED: &str = "node_disconnected";

/// Registration handshake messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// First message a node sends after connecting.
    Register(NodeRegistration),
    /// Broker accepted the node.
    RegisterAck { node_id: String, status: NodeStatus },
}

/// Node registration data sent on connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    /// Stable node identity (the owning user id).
    pub node_id: String,
    /// Model the node serves.
    pub model: String,
    /// Advertised VRAM in megabytes.
    pub vram_mb: u64,
    /// Protocol version for compatibility checking.
    pub protocol_version: u32,
}

impl NodeRegistration {
    pub fn new(node_id: &str, model: &str, vram_mb: u64) -> Self {
        Self {
            node_id: node_id.to_string(),
            model: model.to_string(),
            vram_mb,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Outbound inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchFrame {
    pub request_id: String,
    pub model: String,
    pub chat_request: ChatCompletionRequest,
}

/// Inbound frame belonging to an in-flight request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceFrame {
    pub request_id: String,
    #[serde(flatten)]
    pub payload: InferencePayload,
}

/// Body of an inbound inference frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePayload {
    /// One streamed chunk.
    Chunk(ChatCompletionChunk),
    /// The node failed the request.
    Error(NodeError),
    /// Explicit end-of-stream marker.
    Status(StreamStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl NodeError {
    /// Synthetic error delivered when the node's connection is torn down.
    pub fn disconnected() -> Self {
        Self {
            message: "node disconnected".to_string(),
            code: Some(NODE_DISCONNECTED.to_string()),
        }
    }

    pub fn is_disconnect(&self) -> bool {
        self.code.as_deref() == Some(NODE_DISCONNECTED)
    }
}

/// Terminal status reported by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    /// Generation finished normally.
    Completed,
    /// The node gave up on the request.
    Cancelled,
}

/// Side-protocol frame, `{"protocol": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", content = "data")]
pub enum ProtocolFrame {
    #[serde(rename = "ping-pong")]
    PingPong(PingPongMessage),
    #[serde(rename = "health-check")]
    HealthCheck(HealthCheckMessage),
}

impl ProtocolFrame {
    pub fn node_id(&self) -> &str {
        match self {
            ProtocolFrame::PingPong(m) => &m.node_id,
            ProtocolFrame::HealthCheck(m) => &m.node_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PingPongType {
    Ping,
    Pong,
}

/// Liveness heartbeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPongMessage {
    pub protocol_version: u32,
    pub message_type: PingPongType,
    pub node_id: String,
    pub nonce: String,
    /// Last measured round trip in seconds.
    #[serde(default)]
    pub rtt: Option<f64>,
    #[serde(default)]
    pub ping_streak: u32,
    #[serde(default)]
    pub miss_streak: u32,
}

impl PingPongMessage {
    pub fn ping(node_id: &str, nonce: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message_type: PingPongType::Ping,
            node_id: node_id.to_string(),
            nonce: nonce.to_string(),
            rtt: None,
            ping_streak: 0,
            miss_streak: 0,
        }
    }

    /// The answer a node sends back for this ping.
    pub fn pong(&self) -> Self {
        Self {
            message_type: PingPongType::Pong,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthCheckType {
    Request,
    Response,
}

/// Health-check payload with system utilization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckMessage {
    pub protocol_version: u32,
    pub message_type: HealthCheckType,
    pub node_id: String,
    pub nonce: String,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub ram_percent: Option<f32>,
    #[serde(default)]
    pub disk_percent: Option<f32>,
    #[serde(default)]
    pub gpus: Vec<GpuUsage>,
}

impl HealthCheckMessage {
    pub fn request(node_id: &str, nonce: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message_type: HealthCheckType::Request,
            node_id: node_id.to_string(),
            nonce: nonce.to_string(),
            cpu_percent: None,
            ram_percent: None,
            disk_percent: None,
            gpus: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuUsage {
    pub gpu_percent: f32,
    pub vram_percent: f32,
}

/// Any frame the broker writes to a node socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    Handshake(HandshakeMessage),
    Protocol(ProtocolFrame),
    Dispatch(DispatchFrame),
}

/// Any frame a registered node writes to the broker.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Protocol(ProtocolFrame),
    Inference(InferenceFrame),
}

impl InboundFrame {
    /// Parse a text message; frames carrying a `protocol` key are side-protocol
    /// frames, everything else must be an inference frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if value.get("protocol").is_some() {
            Ok(InboundFrame::Protocol(serde_json::from_value(value)?))
        } else {
            Ok(InboundFrame::Inference(serde_json::from_value(value)?))
        }
    }
}
