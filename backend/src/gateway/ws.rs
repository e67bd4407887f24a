//! WebSocket handler for node connections.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    Sink, SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use fleet_common::{
    HandshakeMessage, InboundFrame, NodeRegistration, NodeStatus, OutboundFrame, PROTOCOL_VERSION,
};

use super::connection::NodeConnection;
use crate::analytics::{self, AnalyticsEvent};
use crate::store::StoreError;
use crate::AppState;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Why a node was refused at registration.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Registration timeout")]
    Timeout,
    #[error("Invalid registration: {0}")]
    Malformed(String),
    #[error("Protocol version mismatch: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u32, got: u32 },
    #[error("Node ID cannot be empty")]
    EmptyNodeId,
    #[error("Model cannot be empty")]
    EmptyModel,
    #[error("No benchmark recorded for model {0}")]
    NoBenchmark(String),
    #[error("Benchmark too slow: {measured:.1} tokens/s, {required:.1} required")]
    BenchmarkTooSlow { measured: f64, required: f64 },
    #[error("Node is already connected")]
    AlreadyConnected,
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl HandshakeError {
    pub fn close_code(&self) -> u16 {
        match self {
            HandshakeError::Store(_) => close_code::ERROR,
            _ => close_code::POLICY,
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    tracing::info!("Node connection attempt from {}", addr);
    ws.on_upgrade(move |socket| handle_node(socket, state, addr))
}

/// Handle an individual node connection.
async fn handle_node(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let registration = match read_registration(&mut ws_rx, &state).await {
        Ok(Some(reg)) => reg,
        Ok(None) => {
            tracing::info!("Connection closed before registration from {}", addr);
            return;
        }
        Err(e) => {
            tracing::warn!("Registration from {} failed: {}", addr, e);
            reject(&mut ws_tx, &state, None, e).await;
            return;
        }
    };

    let node_id = registration.node_id.clone();
    let (conn, mut outbound) = match admit(&state, &registration).await {
        Ok(admitted) => admitted,
        Err(e) => {
            tracing::warn!(node_id = %node_id, "Registration refused from {}: {}", addr, e);
            reject(&mut ws_tx, &state, Some(&node_id), e).await;
            return;
        }
    };

    let ack = OutboundFrame::Handshake(HandshakeMessage::RegisterAck {
        node_id: node_id.clone(),
        status: conn.status(),
    });
    match send_message(&mut ws_tx, &ack).await {
        Ok(()) => {
            tracing::info!(
                node_id = %node_id,
                model = %conn.model,
                status = %conn.status(),
                "Node connected from {}",
                addr
            );
            analytics::track(
                &state.analytics,
                &node_id,
                AnalyticsEvent::NodeConnected {
                    node_id: node_id.clone(),
                    model: conn.model.clone(),
                },
            );
            run_session(&mut ws_tx, &mut ws_rx, &mut outbound, &state, &conn).await;
        }
        Err(e) => tracing::error!(node_id = %node_id, "Failed to send RegisterAck: {}", e),
    }

    // Eviction may already have removed this connection, and the node may
    // have reconnected since.
    let detached = match state.status.detach(&conn).await {
        Ok(status) => status.is_some(),
        Err(e) => {
            tracing::error!(node_id = %node_id, "Failed to persist disconnect: {}", e);
            true
        }
    };
    if detached {
        state.protocols.forget_node(&node_id).await;
    }
    analytics::track(
        &state.analytics,
        &node_id,
        AnalyticsEvent::NodeDisconnected {
            node_id: node_id.clone(),
        },
    );
    tracing::info!(node_id = %node_id, "Node disconnected");
}

/// Wait for the register message. `Ok(None)` when the socket closed first.
async fn read_registration(
    ws_rx: &mut WsStream,
    state: &AppState,
) -> Result<Option<NodeRegistration>, HandshakeError> {
    let registration_timeout = Duration::from_secs(state.config.server.registration_timeout_secs);
    match timeout(registration_timeout, ws_rx.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<HandshakeMessage>(&text) {
            Ok(HandshakeMessage::Register(reg)) => Ok(Some(reg)),
            Ok(_) => Err(HandshakeError::Malformed(
                "expected register message".to_string(),
            )),
            Err(e) => Err(HandshakeError::Malformed(e.to_string())),
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => Ok(None),
        Ok(Some(Ok(_))) => Err(HandshakeError::Malformed(
            "expected text message".to_string(),
        )),
        Ok(Some(Err(e))) => Err(HandshakeError::Malformed(e.to_string())),
        Err(_) => Err(HandshakeError::Timeout),
    }
}

/// Validate, check the benchmark, then register and apply `START`.
async fn admit(
    state: &AppState,
    reg: &NodeRegistration,
) -> Result<(Arc<NodeConnection>, mpsc::Receiver<OutboundFrame>), HandshakeError> {
    validate_registration(reg)?;
    check_benchmark(state, reg).await?;

    if state.registry.get(&reg.node_id).await.is_some() {
        return Err(HandshakeError::AlreadyConnected);
    }

    // Stays out of selection until `attach` applies `START`.
    let (tx, rx) = mpsc::channel::<OutboundFrame>(state.config.nodes.outbound_buffer.max(1));
    let conn = Arc::new(NodeConnection::new(
        reg.node_id.clone(),
        reg.model.clone(),
        reg.vram_mb,
        state.registry.backend_host().to_string(),
        state.config.nodes.is_self_hosted(&reg.node_id),
        reg.protocol_version,
        NodeStatus::Stopped,
        tx,
    ));

    match state.status.attach(conn.clone()).await? {
        Some(_) => Ok((conn, rx)),
        None => Err(HandshakeError::AlreadyConnected),
    }
}

/// Validate a node registration.
fn validate_registration(reg: &NodeRegistration) -> Result<(), HandshakeError> {
    if reg.protocol_version != PROTOCOL_VERSION {
        return Err(HandshakeError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            got: reg.protocol_version,
        });
    }
    if reg.node_id.trim().is_empty() {
        return Err(HandshakeError::EmptyNodeId);
    }
    if reg.model.trim().is_empty() {
        return Err(HandshakeError::EmptyModel);
    }
    Ok(())
}

/// The node must have a recorded benchmark for its model at or above the
/// required throughput.
async fn check_benchmark(state: &AppState, reg: &NodeRegistration) -> Result<(), HandshakeError> {
    let required = state.config.benchmark.minimum_for(&reg.model);
    match state.benchmarks.get(&reg.node_id, &reg.model).await? {
        Some(benchmark) if benchmark.tokens_per_second >= required => Ok(()),
        Some(benchmark) => Err(HandshakeError::BenchmarkTooSlow {
            measured: benchmark.tokens_per_second,
            required,
        }),
        None => Err(HandshakeError::NoBenchmark(reg.model.clone())),
    }
}

/// Pump frames between the socket and the broker until either side closes.
async fn run_session(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    outbound: &mut mpsc::Receiver<OutboundFrame>,
    state: &AppState,
    conn: &NodeConnection,
) {
    let node_id = conn.node_id.as_str();

    loop {
        tokio::select! {
            _ = conn.closed() => {
                tracing::info!(node_id, "Closing node connection on broker request");
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "closed by broker".into(),
                    })))
                    .await;
                break;
            }

            // Outbound frames (from broker to node)
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = send_message(ws_tx, &frame).await {
                    tracing::error!(node_id, "Failed to send frame: {}", e);
                    break;
                }
            }

            // Inbound frames (from node to broker)
            result = ws_rx.next() => {
                match result {
                    Some(Ok(Message::Text(text))) => handle_node_message(&text, node_id, state).await,
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::error!(node_id, "Failed to send pong: {}", e);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!(node_id, "Node sent close frame");
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary, pong, etc.
                    Some(Err(e)) => {
                        tracing::error!(node_id, "WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Route one text frame from a node. Malformed frames are dropped.
async fn handle_node_message(text: &str, node_id: &str, state: &AppState) {
    match InboundFrame::parse(text) {
        Ok(InboundFrame::Protocol(frame)) => {
            state.protocols.route(node_id, frame).await;
        }
        Ok(InboundFrame::Inference(frame)) => {
            state.registry.route(node_id, frame).await;
        }
        Err(e) => {
            tracing::warn!(node_id, "Dropping malformed frame: {}", e);
        }
    }
}

/// Close the socket with the refusal reason.
async fn reject(
    ws_tx: &mut WsSink,
    state: &AppState,
    node_id: Option<&str>,
    error: HandshakeError,
) {
    if let Some(node_id) = node_id {
        analytics::track(
            &state.analytics,
            node_id,
            AnalyticsEvent::NodeRejected {
                node_id: node_id.to_string(),
                reason: error.to_string(),
            },
        );
    }
    let frame = CloseFrame {
        code: error.close_code(),
        reason: close_reason(&error.to_string()).into(),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        tracing::debug!("Failed to send close frame: {}", e);
    }
}

/// Control frame payloads are capped at 125 bytes, two of them for the code.
fn close_reason(reason: &str) -> String {
    const MAX: usize = 123;
    if reason.len() <= MAX {
        return reason.to_string();
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

/// Send a frame over WebSocket.
async fn send_message<S>(
    sink: &mut S,
    frame: &OutboundFrame,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(frame)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}
