//! Collaborator trait definitions
//!
//! The orchestrator depends only on these seams: persistence, the cloud
//! provider, the container runtime and the per-node agent transport.

mod cloud;
mod repository;
mod runtime;
mod transport;

pub use cloud::{CloudProvider, Instance, InstanceSpec, InstanceStatus, NodeClass, Region, Size};
pub use repository::{BotInstanceRepository, NodeRepository};
pub use runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary, HealthStatus, BOT_LABEL,
};
pub use transport::Transport;
