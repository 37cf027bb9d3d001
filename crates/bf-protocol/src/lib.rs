//! bf-protocol: Wire protocol for botfleet node agents
//!
//! This crate defines the newline-delimited JSON protocol spoken between
//! the orchestrator and the agent running on every worker node: the closed
//! set of commands the orchestrator can issue, the messages an agent can
//! send back, and the codec that frames both over a byte stream.

pub mod codec;
pub mod command;
pub mod error;
pub mod message;

pub use codec::{FrameCodec, MAX_LINE_LENGTH};
pub use command::{
    ArchivePayload, BackupDownloadPayload, BackupUploadPayload, Command, CommandEnvelope,
    CommandType, ContainerPayload, ImportPayload,
};
pub use error::ProtocolError;
pub use message::{
    AgentMessage, CommandResult, ContainerReport, Heartbeat, OutboundFrame, RegisterAck,
    Registration,
};
