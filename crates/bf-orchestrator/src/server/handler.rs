//! Per-connection agent handler
//!
//! A connection opens with a `register` message. Once admitted, the node's
//! [`TunnelTransport`] is handed to the [`CommandChannel`] and this task
//! pumps frames both ways until either side closes:
//!
//! - outbound frames queued on the transport are written to the socket
//! - inbound messages are passed to [`CommandChannel::handle_message`]
//!
//! A node coming back from `offline`, `recovering` or `failed` is moved to
//! `returning`; its first heartbeat triggers orphan reconciliation.
//!
//! [`CommandChannel`]: crate::channel::CommandChannel
//! [`CommandChannel::handle_message`]: crate::channel::CommandChannel::handle_message

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use bf_core::error::{NodeError, RepoError};
use bf_core::time::current_time_millis;
use bf_core::traits::{NodeRepository, Transport};
use bf_core::types::{Node, NodeId, NodeRegistration, NodeStatus};
use bf_protocol::{AgentMessage, FrameCodec, OutboundFrame, Registration};

use crate::channel::TunnelTransport;
use crate::state::OrchestratorState;

/// How long a new connection has to send `register`
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frames buffered per connection
const OUTBOUND_CAPACITY: usize = 256;

const TRIGGERED_BY: &str = "agent_server";

/// Why a registration was refused; sent to the agent as the ack reason
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("first message must be register")]
    NotRegistered,

    #[error("node_id is required")]
    MissingNodeId,

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("invalid node secret")]
    InvalidSecret,

    #[error("registration failed: {0}")]
    Internal(String),
}

impl From<RepoError> for Rejection {
    fn from(e: RepoError) -> Self {
        Rejection::Internal(e.to_string())
    }
}

impl From<NodeError> for Rejection {
    fn from(e: NodeError) -> Self {
        Rejection::Internal(e.to_string())
    }
}

/// Outcome of a successful registration
#[derive(Debug)]
struct Admission {
    node_id: NodeId,
    /// Orphan cleanup is owed on the first heartbeat
    returning: bool,
}

/// Serve one agent connection until it closes, is replaced, or the server
/// shuts down
pub(crate) async fn handle_connection(
    state: Arc<OrchestratorState>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(socket, FrameCodec::new());

    let registration = match tokio::time::timeout(REGISTER_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(AgentMessage::Register(registration)))) => registration,
        Ok(Some(Ok(_))) => {
            tracing::warn!("Connection from {} did not start with register", peer_addr);
            let _ = framed
                .send(OutboundFrame::rejected(Rejection::NotRegistered.to_string()))
                .await;
            return;
        }
        Ok(Some(Err(e))) => {
            tracing::warn!("Bad frame from {}: {}", peer_addr, e);
            return;
        }
        Ok(None) => {
            tracing::debug!("Connection from {} closed before registering", peer_addr);
            return;
        }
        Err(_) => {
            tracing::warn!("Connection from {} sent no register within {:?}", peer_addr, REGISTER_TIMEOUT);
            return;
        }
    };

    let admission = match admit(&state, &registration).await {
        Ok(admission) => admission,
        Err(rejection) => {
            tracing::warn!(
                node_id = %registration.node_id,
                peer = %peer_addr,
                reason = %rejection,
                "Registration rejected"
            );
            let _ = framed.send(OutboundFrame::rejected(rejection.to_string())).await;
            return;
        }
    };
    let node_id = admission.node_id;

    if let Err(e) = framed.send(OutboundFrame::accepted()).await {
        tracing::warn!(node_id = %node_id, "Failed to acknowledge registration: {}", e);
        return;
    }

    let (transport, mut outbound) = TunnelTransport::new(OUTBOUND_CAPACITY);
    let transport = Arc::new(transport);
    let transport_id = transport.id();
    let closed = transport.cancel_token();
    state.channel.accept(&node_id, transport.clone());
    tracing::info!(node_id = %node_id, peer = %peer_addr, returning = admission.returning, "Agent connected");

    let mut reconcile_owed = admission.returning;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = closed.cancelled() => {
                tracing::debug!(node_id = %node_id, "Transport closed locally");
                break;
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = framed.send(frame).await {
                    tracing::warn!(node_id = %node_id, "Failed to write frame: {}", e);
                    break;
                }
            }

            message = framed.next() => {
                match message {
                    Some(Ok(message)) => {
                        let heartbeat_containers = match &message {
                            AgentMessage::Heartbeat(heartbeat) if reconcile_owed => {
                                Some(heartbeat.container_names())
                            }
                            _ => None,
                        };

                        state.channel.handle_message(&node_id, message).await;

                        if let Some(containers) = heartbeat_containers {
                            reconcile_owed = false;
                            spawn_reconcile(&state, node_id.clone(), containers);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(node_id = %node_id, "Protocol error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    transport.close();
    state.channel.on_transport_closed(&node_id, transport_id);
    tracing::info!(node_id = %node_id, "Agent disconnected");
}

/// Reconciliation sends commands over this connection, so it runs on its
/// own task while the connection loop keeps delivering results.
fn spawn_reconcile(state: &Arc<OrchestratorState>, node_id: NodeId, containers: Vec<String>) {
    let reconciler = state.reconciler.clone();
    tokio::spawn(async move {
        if let Err(e) = reconciler.reconcile(&node_id, &containers).await {
            tracing::error!(node_id = %node_id, error = %e, "Orphan reconciliation failed");
        }
    });
}

/// Validate a registration and bring the node record up to date
async fn admit(state: &OrchestratorState, registration: &Registration) -> Result<Admission, Rejection> {
    if registration.node_id.trim().is_empty() {
        return Err(Rejection::MissingNodeId);
    }

    let input = NodeRegistration::from(registration);
    let node_id = input.node_id.clone();
    let now = current_time_millis();

    let Some(node) = state.nodes.get(&node_id).await? else {
        if !state.config.allow_unknown_nodes {
            return Err(Rejection::UnknownNode(node_id));
        }
        state.nodes.insert(Node::from_registration(&input, now)).await?;
        state
            .state_machine
            .transition(&node_id, NodeStatus::Active, "registered", TRIGGERED_BY)
            .await?;
        return Ok(Admission {
            node_id,
            returning: false,
        });
    };

    if let Some(expected) = node.node_secret.as_deref() {
        if registration.node_secret.as_deref() != Some(expected) {
            return Err(Rejection::InvalidSecret);
        }
    }

    state.nodes.record_registration(&input, now).await?;

    let returning = match node.status {
        NodeStatus::Offline | NodeStatus::Recovering | NodeStatus::Failed => {
            state
                .state_machine
                .transition(&node_id, NodeStatus::Returning, "agent_reconnected", TRIGGERED_BY)
                .await?;
            true
        }
        NodeStatus::Returning => true,
        _ => false,
    };

    Ok(Admission { node_id, returning })
}
