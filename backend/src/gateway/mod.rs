//! Node dispatch core.
//!
//! This module provides:
//! - WebSocket endpoint for node connections
//! - Node registry with per-request response channels
//! - Admission-controlled node selection
//! - Request/response correlation for streamed inference
//! - Ping-pong liveness and synthetic health probes
//! - Node status state machine, metrics batching and replica reconciliation

pub mod connection;
pub mod consistency;
pub mod correlator;
pub mod health_check;
pub mod liveness;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod selector;
pub mod status;
mod ws;

pub use connection::{GpuClass, InFlightRequest, NodeConnection};
pub use consistency::ReplicaConsistencyJob;
pub use correlator::{InferenceError, InferenceStream, RequestCorrelator, StreamEnd, StreamSummary};
pub use health_check::{HealthCheckProtocol, ProbeError, SystemStats};
pub use liveness::PingPongProtocol;
pub use metrics::{MetricsAggregator, MetricsIncrement, MetricsSender};
pub use protocol::{NodeProtocol, ProtocolId, ProtocolTable};
pub use registry::{DispatchError, DispatchRequest, NodeRegistry, ResponseReceiver};
pub use selector::{CapacityLimits, NodeSelector};
pub use status::{NodeEvent, NodeStatusMachine, NodeStatusService, Transition};
pub use ws::{ws_handler, HandshakeError};
