//! Orphan container reconciliation
//!
//! When a node comes back after an outage it may still be running
//! containers for tenants that were recovered onto other nodes while it was
//! gone. The reconciler compares what the node reports against the
//! assignment table, stops anything no longer assigned here, and returns
//! the node to service.
//!
//! # Failure policy
//!
//! Each stop is attempted independently and failures are collected. The
//! node is moved to `active` whatever the stop outcomes were: a reachable
//! node with a stray container is a smaller problem than a reachable node
//! taking no work.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use bf_core::error::{ChannelError, NodeError};
use bf_core::traits::BotInstanceRepository;
use bf_core::types::{NodeId, NodeStatus, TenantId};
use bf_protocol::Command;

use crate::channel::CommandChannel;
use crate::node::NodeStateMachine;

/// Transition reason written once cleanup has run
pub const CLEANUP_COMPLETE: &str = "cleanup_complete";

const TRIGGERED_BY: &str = "orphan_reconciler";

/// A stop command that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopFailure {
    pub container: String,
    pub error: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Containers stopped as orphans
    pub stopped: Vec<String>,
    /// Containers whose tenant is still assigned to the node
    pub kept: Vec<String>,
    pub errors: Vec<StopFailure>,
}

/// Stops orphaned tenant containers on a returning node
pub struct OrphanReconciler {
    channel: Arc<CommandChannel>,
    bots: Arc<dyn BotInstanceRepository>,
    state_machine: Arc<NodeStateMachine>,
}

impl OrphanReconciler {
    pub fn new(
        channel: Arc<CommandChannel>,
        bots: Arc<dyn BotInstanceRepository>,
        state_machine: Arc<NodeStateMachine>,
    ) -> Self {
        Self {
            channel,
            bots,
            state_machine,
        }
    }

    /// Reconcile `running` (container names reported by the node) against
    /// the tenants assigned to `node_id`, then activate the node.
    ///
    /// Only a failure to read assignments or to apply the final transition
    /// is returned as an error; stop failures land in the report.
    #[instrument(skip_all, fields(node_id = %node_id, reported = running.len()))]
    pub async fn reconcile(
        &self,
        node_id: &NodeId,
        running: &[String],
    ) -> Result<ReconcileReport, NodeError> {
        let assigned: HashSet<TenantId> = self
            .bots
            .list_by_node(node_id)
            .await?
            .into_iter()
            .map(|bot| bot.tenant_id)
            .collect();

        let mut report = ReconcileReport::default();

        for container in running {
            let Some(tenant) = TenantId::from_container_name(container) else {
                tracing::debug!(container = %container, "Skipping non-tenant container");
                continue;
            };

            if assigned.contains(&tenant) {
                report.kept.push(container.clone());
                continue;
            }

            match self.stop_orphan(node_id, &tenant).await {
                Ok(()) => {
                    tracing::info!(container = %container, "Stopped orphaned container");
                    report.stopped.push(container.clone());
                }
                Err(e) => {
                    tracing::warn!(container = %container, error = %e, "Failed to stop orphan");
                    report.errors.push(StopFailure {
                        container: container.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.state_machine
            .transition(node_id, NodeStatus::Active, CLEANUP_COMPLETE, TRIGGERED_BY)
            .await?;

        tracing::info!(
            stopped = report.stopped.len(),
            kept = report.kept.len(),
            errors = report.errors.len(),
            "Reconciliation complete"
        );
        Ok(report)
    }

    async fn stop_orphan(&self, node_id: &NodeId, tenant: &TenantId) -> Result<(), ChannelError> {
        self.channel
            .send(node_id, Command::stop(tenant.container_name()))
            .await
            .map(|_| ())
    }
}
