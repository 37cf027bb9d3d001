//! bf-core: Core abstractions and configuration for botfleet
//!
//! This crate provides the fleet domain model (nodes, transitions, bot
//! instances), the collaborator traits the orchestrator depends on
//! (repositories, cloud provider, container runtime, agent transport), and
//! the configuration structures shared by the daemon and its tests.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{
    ChannelError, CloudError, ConfigError, FleetError, NodeError, RepoError, RuntimeError,
    TransportError,
};
pub use types::{
    BillingState, BotId, BotInstance, Capacity, DrainStatus, Node, NodeId, NodeRegistration,
    NodeStatus, NodeTransition, ProvisionStage, TenantId,
};
