//! Heartbeat-driven node health
//!
//! A periodic sweep compares each node's last heartbeat against the
//! configured thresholds:
//!
//! - `active` nodes silent for `unhealthy_after` become `unhealthy`
//! - `unhealthy` nodes silent for `offline_after` go `offline`
//! - `unhealthy` nodes heard from again return to `active`

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use bf_core::config::HealthConfig;
use bf_core::error::NodeError;
use bf_core::time::{as_millis, current_time_millis};
use bf_core::traits::NodeRepository;
use bf_core::types::{Node, NodeId, NodeStatus};

use super::NodeStateMachine;

const TRIGGERED_BY: &str = "health_monitor";

/// Transitions applied by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub marked_unhealthy: Vec<NodeId>,
    pub marked_offline: Vec<NodeId>,
    pub recovered: Vec<NodeId>,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.marked_unhealthy.is_empty() && self.marked_offline.is_empty() && self.recovered.is_empty()
    }
}

/// Periodically re-evaluates node health from heartbeat age
pub struct HealthMonitor {
    nodes: Arc<dyn NodeRepository>,
    state_machine: Arc<NodeStateMachine>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        nodes: Arc<dyn NodeRepository>,
        state_machine: Arc<NodeStateMachine>,
        config: HealthConfig,
    ) -> Self {
        Self {
            nodes,
            state_machine,
            config,
        }
    }

    /// Run sweeps every `sweep_interval` until cancelled
    pub fn spawn_monitor(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            tracing::info!(
                "Starting health monitor (unhealthy after {:?}, offline after {:?})",
                self.config.unhealthy_after,
                self.config.offline_after
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep(current_time_millis()).await {
                            tracing::error!("Health sweep failed: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("Health monitor shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Evaluate every node once against `now`
    pub async fn sweep(&self, now: u64) -> Result<SweepReport, NodeError> {
        let mut report = SweepReport::default();

        for node in self.nodes.list().await? {
            let silence = now.saturating_sub(last_seen(&node));
            let stale = silence > as_millis(self.config.unhealthy_after);
            let lost = silence > as_millis(self.config.offline_after);

            let (to, reason, bucket) = match node.status {
                NodeStatus::Active if stale => (
                    NodeStatus::Unhealthy,
                    "heartbeat_timeout",
                    &mut report.marked_unhealthy,
                ),
                NodeStatus::Unhealthy if lost => (
                    NodeStatus::Offline,
                    "heartbeat_lost",
                    &mut report.marked_offline,
                ),
                NodeStatus::Unhealthy if !stale => (
                    NodeStatus::Active,
                    "heartbeat_recovered",
                    &mut report.recovered,
                ),
                _ => continue,
            };

            match self
                .state_machine
                .transition(&node.id, to, reason, TRIGGERED_BY)
                .await
            {
                Ok(_) => {
                    tracing::info!(node_id = %node.id, silence_ms = silence, "Node marked {}", to);
                    bucket.push(node.id);
                }
                // Someone else moved the node since the list; next sweep re-reads it
                Err(NodeError::ConcurrentTransition { .. }) | Err(NodeError::NotFound(_)) => {
                    tracing::debug!(node_id = %node.id, "Node changed during sweep");
                }
                Err(e) => return Err(e),
            }
        }

        if !report.is_empty() {
            tracing::debug!(?report, "Health sweep applied transitions");
        }
        Ok(report)
    }
}

fn last_seen(node: &Node) -> u64 {
    node.last_heartbeat_at.unwrap_or(node.registered_at)
}
