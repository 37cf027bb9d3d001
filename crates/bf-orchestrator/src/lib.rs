//! bf-orchestrator: Fleet lifecycle orchestration for botfleet
//!
//! The orchestrator accepts persistent connections from the agent on every
//! worker node, tracks node health through an audited state machine, and
//! runs the multi-step tenant workflows: orphan cleanup after an outage,
//! live migration between nodes, recovery and drain, rolling image updates,
//! and cloud provisioning.

pub mod channel;
pub mod metrics;
pub mod migration;
pub mod node;
pub mod provision;
pub mod reconcile;
pub mod server;
pub mod state;
pub mod store;
pub mod update;

#[cfg(test)]
mod testing;

pub use channel::{CommandChannel, TunnelTransport};
pub use metrics::{Counter, FleetMetrics, MetricsSnapshot};
pub use migration::{MigrationOrchestrator, MigrationResult};
pub use node::{HealthMonitor, NodeStateMachine};
pub use provision::{DigitalOceanProvider, GpuNodeProvisioner, NodeProvisioner, ProvisionError};
pub use reconcile::{OrphanReconciler, ReconcileReport};
pub use server::AgentServer;
pub use state::OrchestratorState;
pub use store::MemoryStore;
pub use update::{RollingUpdater, UpdateResult};
