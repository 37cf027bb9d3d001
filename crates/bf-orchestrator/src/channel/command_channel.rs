//! Command channel
//!
//! Owns the live transport for every connected node and the table of
//! commands awaiting a result. Each command gets a fresh correlation id and
//! a oneshot reply slot; whichever of {result, timeout, disconnect} removes
//! the pending entry first settles the command, and the others find nothing
//! to do.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::instrument;

use bf_core::error::ChannelError;
use bf_core::time::current_time_millis;
use bf_core::traits::{NodeRepository, Transport};
use bf_core::types::{HeartbeatUpdate, NodeId};
use bf_protocol::{
    AgentMessage, Command, CommandEnvelope, CommandResult, CommandType, Heartbeat, OutboundFrame,
};

use crate::metrics::{Counter, FleetMetrics};

/// Deadline applied when the caller does not pass one
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on persisting a heartbeat
const HEARTBEAT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type Reply = Result<Option<Value>, ChannelError>;

/// A command waiting for its result
struct PendingCommand {
    node_id: NodeId,
    /// Transport the command was written to
    transport_id: u64,
    command: CommandType,
    reply: oneshot::Sender<Reply>,
}

/// Removes a pending entry when the send future finishes or is dropped
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingCommand>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Per-node transports plus request/response correlation
pub struct CommandChannel {
    transports: DashMap<NodeId, Arc<dyn Transport>>,
    pending: DashMap<String, PendingCommand>,
    nodes: Arc<dyn NodeRepository>,
    metrics: Arc<FleetMetrics>,
    default_timeout: Duration,
}

impl CommandChannel {
    pub fn new(nodes: Arc<dyn NodeRepository>, metrics: Arc<FleetMetrics>) -> Self {
        Self {
            transports: DashMap::new(),
            pending: DashMap::new(),
            nodes,
            metrics,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the default command deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Store the live transport for a node, closing any previous one.
    ///
    /// Commands still pending on the replaced transport are rejected with
    /// `Disconnected`; their results can no longer arrive.
    pub fn accept(&self, node_id: &NodeId, transport: Arc<dyn Transport>) {
        let transport_id = transport.id();
        let previous = self.transports.insert(node_id.clone(), transport);

        if let Some(previous) = previous {
            if previous.id() != transport_id {
                tracing::info!(
                    node_id = %node_id,
                    old = previous.id(),
                    new = transport_id,
                    "Replacing agent transport"
                );
                previous.close();
                self.reject_pending(previous.id());
            }
        } else {
            tracing::info!(node_id = %node_id, transport_id, "Agent transport accepted");
        }
    }

    /// Forget a transport after its connection ended.
    ///
    /// The node's entry is only cleared if it still refers to `transport_id`,
    /// so a close racing a reconnect cannot evict the new connection.
    /// Returns whether the entry was cleared.
    pub fn on_transport_closed(&self, node_id: &NodeId, transport_id: u64) -> bool {
        let removed = self
            .transports
            .remove_if(node_id, |_, t| t.id() == transport_id)
            .is_some();
        self.reject_pending(transport_id);

        if removed {
            tracing::info!(node_id = %node_id, transport_id, "Agent transport closed");
        } else {
            tracing::debug!(node_id = %node_id, transport_id, "Stale transport closed");
        }
        removed
    }

    /// Close a node's transport, rejecting its pending commands
    pub fn close(&self, node_id: &NodeId) {
        if let Some((_, transport)) = self.transports.remove(node_id) {
            transport.close();
            self.reject_pending(transport.id());
        }
    }

    /// Whether the node has a live, open transport
    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.transports
            .get(node_id)
            .map(|t| t.is_open())
            .unwrap_or(false)
    }

    /// Nodes with a registered transport
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        self.transports.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of commands awaiting a result
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a command with the default deadline
    pub async fn send(&self, node_id: &NodeId, command: Command) -> Reply {
        self.send_with_timeout(node_id, command, self.default_timeout)
            .await
    }

    /// Send a command and wait up to `timeout` for its result.
    ///
    /// Fails immediately with `NotConnected` if the node has no open
    /// transport; no pending entry is created in that case.
    #[instrument(skip_all, fields(node_id = %node_id, command = %command.command_type()))]
    pub async fn send_with_timeout(
        &self,
        node_id: &NodeId,
        command: Command,
        timeout: Duration,
    ) -> Reply {
        let command_type = command.command_type();

        let transport = self
            .transports
            .get(node_id)
            .map(|t| Arc::clone(t.value()))
            .filter(|t| t.is_open())
            .ok_or_else(|| ChannelError::NotConnected(node_id.clone()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingCommand {
                node_id: node_id.clone(),
                transport_id: transport.id(),
                command: command_type,
                reply: reply_tx,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        // One deadline covers both the queued write and the reply
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || {
            self.metrics.incr(Counter::CommandsTimedOut);
            tracing::warn!(correlation_id = %id, ?timeout, "Command timed out");
            ChannelError::Timeout {
                command: command_type,
                after: timeout,
            }
        };

        self.metrics.incr(Counter::CommandsSent);
        let frame = OutboundFrame::Command(CommandEnvelope::new(id.clone(), command));
        match tokio::time::timeout_at(deadline, transport.send(frame)).await {
            Ok(Ok(())) => tracing::debug!(correlation_id = %id, "Command sent"),
            Ok(Err(source)) => {
                self.metrics.incr(Counter::CommandsFailed);
                tracing::warn!(error = %source, "Failed to write command");
                return Err(ChannelError::Send {
                    command: command_type,
                    source,
                });
            }
            // Outbound queue stayed full; the guard drops the pending entry
            Err(_) => return Err(timed_out()),
        }

        let reply = match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(reply) => reply,
            Err(_) => {
                if self.pending.remove(&id).is_some() {
                    return Err(timed_out());
                }
                // Settled in the same instant the deadline fired
                reply_rx.await
            }
        };

        reply.unwrap_or_else(|_| {
            Err(ChannelError::Disconnected {
                node_id: node_id.clone(),
                command: command_type,
            })
        })
    }

    /// Process one inbound message from a node's agent.
    ///
    /// Never fails: heartbeat persistence errors are logged and counted,
    /// and anything unrecognized is dropped.
    pub async fn handle_message(&self, node_id: &NodeId, message: AgentMessage) {
        match message {
            AgentMessage::Heartbeat(heartbeat) => self.record_heartbeat(node_id, &heartbeat).await,
            AgentMessage::CommandResult(result) => self.resolve(node_id, result),
            AgentMessage::Register(_) => {
                tracing::warn!(node_id = %node_id, "Ignoring registration on established connection");
            }
            AgentMessage::Unknown => {
                self.metrics.incr(Counter::UnknownMessages);
                tracing::debug!(node_id = %node_id, "Dropping unrecognized message");
            }
        }
    }

    async fn record_heartbeat(&self, node_id: &NodeId, heartbeat: &Heartbeat) {
        self.metrics.incr(Counter::Heartbeats);

        let update = HeartbeatUpdate {
            used_mb: heartbeat.used_mb(),
            agent_version: heartbeat.agent_version.clone(),
            at: current_time_millis(),
        };

        let outcome =
            tokio::time::timeout(HEARTBEAT_WRITE_TIMEOUT, self.nodes.update_heartbeat(node_id, update))
                .await;
        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("write exceeded {:?}", HEARTBEAT_WRITE_TIMEOUT),
        };

        self.metrics.incr(Counter::HeartbeatFailures);
        tracing::warn!(node_id = %node_id, %error, "Failed to record heartbeat");
    }

    fn resolve(&self, node_id: &NodeId, result: CommandResult) {
        let Some((_, pending)) = self
            .pending
            .remove_if(&result.id, |_, p| &p.node_id == node_id)
        else {
            self.metrics.incr(Counter::LateResults);
            tracing::debug!(
                node_id = %node_id,
                correlation_id = %result.id,
                "Result for unknown or settled command"
            );
            return;
        };

        let reply = if result.success {
            self.metrics.incr(Counter::CommandsSucceeded);
            Ok(result.data)
        } else {
            self.metrics.incr(Counter::CommandsFailed);
            Err(ChannelError::Remote {
                command: pending.command,
                message: result.error.unwrap_or_else(|| "unknown error".to_string()),
            })
        };

        // The receiver is gone if the caller stopped waiting
        let _ = pending.reply.send(reply);
    }

    fn reject_pending(&self, transport_id: u64) {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.transport_id == transport_id)
            .map(|e| e.key().clone())
            .collect();

        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                self.metrics.incr(Counter::CommandsDisconnected);
                let _ = pending.reply.send(Err(ChannelError::Disconnected {
                    node_id: pending.node_id,
                    command: pending.command,
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TunnelTransport;
    use crate::store::MemoryStore;
    use bf_core::types::{Capacity, Node};
    use bf_protocol::ContainerReport;
    use tokio::sync::mpsc;

    fn channel() -> (Arc<CommandChannel>, Arc<MemoryStore>, Arc<FleetMetrics>) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(FleetMetrics::new());
        let channel = Arc::new(CommandChannel::new(store.clone(), metrics.clone()));
        (channel, store, metrics)
    }

    fn connect(channel: &CommandChannel, node: &str) -> (Arc<TunnelTransport>, mpsc::Receiver<OutboundFrame>) {
        let (transport, rx) = TunnelTransport::new(16);
        let transport = Arc::new(transport);
        channel.accept(&NodeId::new(node), transport.clone());
        (transport, rx)
    }

    async fn next_command(rx: &mut mpsc::Receiver<OutboundFrame>) -> CommandEnvelope {
        match rx.recv().await {
            Some(OutboundFrame::Command(envelope)) => envelope,
            other => panic!("Expected command frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_without_transport_fails_immediately() {
        let (channel, _, _) = channel();

        let err = channel
            .send(&NodeId::new("n1"), Command::stop("tenant_a"))
            .await
            .unwrap_err();

        assert_eq!(err, ChannelError::NotConnected(NodeId::new("n1")));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_closed_transport_is_not_connected() {
        let (channel, _, _) = channel();
        let (transport, _rx) = connect(&channel, "n1");
        transport.close();

        let err = channel
            .send(&NodeId::new("n1"), Command::stop("tenant_a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(_)));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_result_resolves_pending_command() {
        let (channel, _, metrics) = channel();
        let (_transport, mut rx) = connect(&channel, "n1");

        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send(&NodeId::new("n1"), Command::inspect("tenant_a"))
                    .await
            })
        };

        let envelope = next_command(&mut rx).await;
        assert_eq!(envelope.command, Command::inspect("tenant_a"));
        assert_eq!(channel.pending_count(), 1);

        channel
            .handle_message(
                &NodeId::new("n1"),
                AgentMessage::CommandResult(CommandResult::ok(
                    envelope.id,
                    Some(serde_json::json!({"running": true})),
                )),
            )
            .await;

        let data = task.await.unwrap().unwrap();
        assert_eq!(data, Some(serde_json::json!({"running": true})));
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(metrics.get(Counter::CommandsSucceeded), 1);
    }

    #[tokio::test]
    async fn test_failed_result_carries_agent_error() {
        let (channel, _, _) = channel();
        let (_transport, mut rx) = connect(&channel, "n1");

        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send(&NodeId::new("n1"), Command::stop("tenant_a"))
                    .await
            })
        };

        let envelope = next_command(&mut rx).await;
        channel
            .handle_message(
                &NodeId::new("n1"),
                AgentMessage::CommandResult(CommandResult::failed(envelope.id, "no such container")),
            )
            .await;

        assert_eq!(
            task.await.unwrap().unwrap_err(),
            ChannelError::Remote {
                command: CommandType::Stop,
                message: "no such container".to_string(),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_clears_entry_and_late_result_is_noop() {
        let (channel, _, metrics) = channel();
        let (_transport, mut rx) = connect(&channel, "n1");

        let err = channel
            .send_with_timeout(
                &NodeId::new("n1"),
                Command::stop("tenant_a"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::Timeout {
                command: CommandType::Stop,
                after: Duration::from_secs(1),
            }
        );
        assert_eq!(channel.pending_count(), 0);

        let envelope = next_command(&mut rx).await;
        channel
            .handle_message(
                &NodeId::new("n1"),
                AgentMessage::CommandResult(CommandResult::ok(envelope.id, None)),
            )
            .await;

        assert_eq!(metrics.get(Counter::CommandsTimedOut), 1);
        assert_eq!(metrics.get(Counter::LateResults), 1);
        assert_eq!(metrics.get(Counter::CommandsSucceeded), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_outbound_queue_is_bounded_by_deadline() {
        let (channel, _, metrics) = channel();
        let (transport, _rx) = TunnelTransport::new(1);
        channel.accept(&NodeId::new("n1"), Arc::new(transport));

        // Fills the single queue slot; nothing drains it
        let first = channel
            .send_with_timeout(&NodeId::new("n1"), Command::stop("tenant_a"), Duration::from_secs(1))
            .await;
        assert!(matches!(first, Err(ChannelError::Timeout { .. })));

        let second = tokio::time::timeout(
            Duration::from_secs(30),
            channel.send_with_timeout(
                &NodeId::new("n1"),
                Command::stop("tenant_b"),
                Duration::from_secs(1),
            ),
        )
        .await
        .expect("send must settle within its own deadline");

        assert_eq!(
            second,
            Err(ChannelError::Timeout {
                command: CommandType::Stop,
                after: Duration::from_secs(1),
            })
        );
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(metrics.get(Counter::CommandsTimedOut), 2);
    }

    #[tokio::test]
    async fn test_result_from_other_node_does_not_settle() {
        let (channel, _, metrics) = channel();
        let (_t1, mut rx) = connect(&channel, "n1");
        let (_t2, _rx2) = connect(&channel, "n2");

        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send(&NodeId::new("n1"), Command::stop("tenant_a"))
                    .await
            })
        };
        let envelope = next_command(&mut rx).await;

        channel
            .handle_message(
                &NodeId::new("n2"),
                AgentMessage::CommandResult(CommandResult::ok(envelope.id.clone(), None)),
            )
            .await;
        assert_eq!(metrics.get(Counter::LateResults), 1);
        assert_eq!(channel.pending_count(), 1);

        channel
            .handle_message(
                &NodeId::new("n1"),
                AgentMessage::CommandResult(CommandResult::ok(envelope.id, None)),
            )
            .await;
        assert_eq!(task.await.unwrap(), Ok(None));
    }

    #[tokio::test]
    async fn test_transport_close_rejects_pending() {
        let (channel, _, metrics) = channel();
        let (transport, mut rx) = connect(&channel, "n1");

        let task = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .send(&NodeId::new("n1"), Command::stop("tenant_a"))
                    .await
            })
        };
        next_command(&mut rx).await;

        assert!(channel.on_transport_closed(&NodeId::new("n1"), transport.id()));

        assert_eq!(
            task.await.unwrap().unwrap_err(),
            ChannelError::Disconnected {
                node_id: NodeId::new("n1"),
                command: CommandType::Stop,
            }
        );
        assert_eq!(channel.pending_count(), 0);
        assert!(!channel.is_connected(&NodeId::new("n1")));
        assert_eq!(metrics.get(Counter::CommandsDisconnected), 1);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_and_stale_close_keeps_new() {
        let (channel, _, _) = channel();
        let (old, _old_rx) = connect(&channel, "n1");
        let (new, _new_rx) = connect(&channel, "n1");

        assert!(!old.is_open());
        assert!(new.is_open());

        assert!(!channel.on_transport_closed(&NodeId::new("n1"), old.id()));
        assert!(channel.is_connected(&NodeId::new("n1")));
        assert_eq!(channel.connected_nodes(), vec![NodeId::new("n1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_send_removes_pending_entry() {
        let (channel, _, _) = channel();
        let (_transport, _rx) = connect(&channel, "n1");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            channel.send(&NodeId::new("n1"), Command::stop("tenant_a")),
        )
        .await;

        assert!(abandoned.is_err());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_node() {
        let (channel, store, _) = channel();
        store
            .insert(Node::new(NodeId::new("n1"), "10.0.0.1", Capacity::Limited(4096), 0))
            .await
            .unwrap();

        channel
            .handle_message(
                &NodeId::new("n1"),
                AgentMessage::Heartbeat(Heartbeat {
                    containers: vec![
                        ContainerReport {
                            name: "tenant_a".to_string(),
                            memory_mb: 256,
                        },
                        ContainerReport {
                            name: "tenant_b".to_string(),
                            memory_mb: 512,
                        },
                    ],
                    agent_version: Some("1.4.0".to_string()),
                }),
            )
            .await;

        let node = store.get(&NodeId::new("n1")).await.unwrap().unwrap();
        assert_eq!(node.used_mb, 768);
        assert_eq!(node.agent_version.as_deref(), Some("1.4.0"));
        assert!(node.last_heartbeat_at.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_failure_is_counted_not_raised() {
        let (channel, _, metrics) = channel();

        channel
            .handle_message(&NodeId::new("ghost"), AgentMessage::Heartbeat(Heartbeat::default()))
            .await;
        channel
            .handle_message(&NodeId::new("ghost"), AgentMessage::Unknown)
            .await;

        assert_eq!(metrics.get(Counter::HeartbeatFailures), 1);
        assert_eq!(metrics.get(Counter::UnknownMessages), 1);
    }
}
