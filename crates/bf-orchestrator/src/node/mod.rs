//! Node lifecycle: status transitions and heartbeat-driven health

pub mod health;
pub mod state_machine;

pub use health::{HealthMonitor, SweepReport};
pub use state_machine::{is_valid_transition, NodeStateMachine};
