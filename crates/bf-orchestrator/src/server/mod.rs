//! Agent-facing TCP server

mod handler;
mod listener;

pub use handler::{Rejection, REGISTER_TIMEOUT};
pub use listener::AgentServer;
