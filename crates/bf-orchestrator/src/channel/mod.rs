//! Command dispatch to node agents

mod command_channel;
mod transport;

pub use command_channel::{CommandChannel, DEFAULT_COMMAND_TIMEOUT};
pub use transport::TunnelTransport;
