//! Fleet Common Types
//!
//! Shared types used by the broker and by node implementations.

pub mod chat;
pub mod protocol;
pub mod status;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatDelta, ChatMessage, ChunkChoice, StreamOptions,
    Usage,
};
pub use protocol::{
    DispatchFrame, GpuUsage, HandshakeMessage, HealthCheckMessage, HealthCheckType, InboundFrame,
    InferenceFrame, InferencePayload, NodeError, NodeRegistration, OutboundFrame, PingPongMessage,
    PingPongType, ProtocolFrame, StreamStatus, NODE_DISCONNECTED, PROTOCOL_VERSION,
};
pub use status::NodeStatus;
