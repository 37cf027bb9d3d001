//! Global orchestrator state

use std::sync::Arc;

use bf_core::config::OrchestratorConfig;
use bf_core::traits::{BotInstanceRepository, CloudProvider, ContainerRuntime, NodeRepository};

use crate::channel::CommandChannel;
use crate::metrics::FleetMetrics;
use crate::migration::MigrationOrchestrator;
use crate::node::{HealthMonitor, NodeStateMachine};
use crate::provision::{GpuNodeProvisioner, NodeProvisioner};
use crate::reconcile::OrphanReconciler;
use crate::store::MemoryStore;
use crate::update::RollingUpdater;

/// Global state for the orchestrator daemon
pub struct OrchestratorState {
    /// Configuration
    pub config: OrchestratorConfig,
    /// Node records and transition audit log
    pub nodes: Arc<dyn NodeRepository>,
    /// Bot assignments
    pub bots: Arc<dyn BotInstanceRepository>,
    /// Fleet counters
    pub metrics: Arc<FleetMetrics>,
    /// Live agent transports and pending commands
    pub channel: Arc<CommandChannel>,
    pub state_machine: Arc<NodeStateMachine>,
    pub reconciler: Arc<OrphanReconciler>,
    pub migrations: Arc<MigrationOrchestrator>,
    /// CPU node provisioning; `None` until a cloud provider is attached
    pub provisioner: Option<Arc<NodeProvisioner>>,
    pub gpu_provisioner: Option<Arc<GpuNodeProvisioner>>,
}

impl OrchestratorState {
    /// Create state backed by an in-memory store
    pub fn new(config: OrchestratorConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::with_repositories(config, store.clone(), store)
    }

    /// Create state over the given repositories
    pub fn with_repositories(
        config: OrchestratorConfig,
        nodes: Arc<dyn NodeRepository>,
        bots: Arc<dyn BotInstanceRepository>,
    ) -> Self {
        let metrics = Arc::new(FleetMetrics::new());
        let channel = Arc::new(
            CommandChannel::new(nodes.clone(), metrics.clone())
                .with_timeout(config.command_timeout),
        );
        let state_machine = Arc::new(NodeStateMachine::new(nodes.clone()));
        let reconciler = Arc::new(OrphanReconciler::new(
            channel.clone(),
            bots.clone(),
            state_machine.clone(),
        ));
        let migrations = Arc::new(MigrationOrchestrator::new(
            channel.clone(),
            nodes.clone(),
            bots.clone(),
            state_machine.clone(),
            config.migration.clone(),
        ));

        Self {
            config,
            nodes,
            bots,
            metrics,
            channel,
            state_machine,
            reconciler,
            migrations,
            provisioner: None,
            gpu_provisioner: None,
        }
    }

    /// Enable CPU and GPU provisioning against `cloud`
    pub fn with_cloud(mut self, cloud: Arc<dyn CloudProvider>) -> Self {
        self.provisioner = Some(Arc::new(NodeProvisioner::new(
            cloud.clone(),
            self.nodes.clone(),
            self.state_machine.clone(),
            self.config.provisioning.clone(),
        )));
        self.gpu_provisioner = Some(Arc::new(GpuNodeProvisioner::new(
            cloud,
            self.nodes.clone(),
            self.state_machine.clone(),
            self.config.provisioning.clone(),
        )));
        self
    }

    /// Rolling updater for the container runtime of one node
    pub fn rolling_updater(&self, runtime: Arc<dyn ContainerRuntime>) -> RollingUpdater {
        RollingUpdater::new(runtime, self.config.update.clone())
    }

    /// Health monitor over this state's nodes
    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            self.nodes.clone(),
            self.state_machine.clone(),
            self.config.health.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCloud;

    #[tokio::test]
    async fn test_provisioning_requires_cloud() {
        let state = OrchestratorState::new(OrchestratorConfig::default());
        assert!(state.provisioner.is_none());
        assert!(state.gpu_provisioner.is_none());

        let cloud = FakeCloud {
            sizes: vec![
                FakeCloud::size("s-4vcpu-8gb", false, 48.0),
                FakeCloud::size("gpu-h100x1-80gb", true, 2534.4),
            ],
            ..FakeCloud::default()
        };
        let state = state.with_cloud(Arc::new(cloud));

        let cpu = state.provisioner.as_ref().unwrap().list_sizes().await.unwrap();
        let gpu = state.gpu_provisioner.as_ref().unwrap().list_sizes().await.unwrap();
        assert_eq!(cpu.len(), 1);
        assert!(!cpu[0].gpu);
        assert_eq!(gpu.len(), 1);
        assert!(gpu[0].gpu);
    }
}
