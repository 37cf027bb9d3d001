//! Core error types for botfleet
//!
//! Every failure that crosses a component boundary is an enum variant, so
//! callers branch on the kind of failure and never on message text.

use std::path::PathBuf;
use std::time::Duration;

use bf_protocol::{CommandType, ProtocolError};
use thiserror::Error;

use crate::types::{NodeId, NodeStatus};

/// Top-level error type for the botfleet ecosystem
#[derive(Error, Debug)]
pub enum FleetError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Node state error
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    /// Command channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Repository error
    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    /// Cloud provider error
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Container runtime error
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Repository failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    /// Record does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Record with the same key already exists
    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },

    /// Conditional update saw a different status than expected
    #[error("status conflict: expected {expected}, found {actual}")]
    Conflict {
        expected: NodeStatus,
        actual: NodeStatus,
    },

    /// Storage backend failure
    #[error("backend failure: {0}")]
    Backend(String),
}

impl RepoError {
    /// Missing node record
    pub fn node_not_found(id: &NodeId) -> Self {
        RepoError::NotFound {
            entity: "node",
            id: id.to_string(),
        }
    }
}

/// Node state machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Node is not registered
    #[error("Node not found: {0}")]
    NotFound(NodeId),

    /// Transition is not in the transition table
    #[error("Invalid transition for node {node_id}: {from} -> {to}")]
    InvalidTransition {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// Another caller transitioned the node first
    #[error("Concurrent transition on node {node_id}: expected {expected}, found {actual}")]
    ConcurrentTransition {
        node_id: NodeId,
        expected: NodeStatus,
        actual: NodeStatus,
    },

    /// Repository failure
    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),
}

/// Transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport has been closed
    #[error("Transport closed")]
    Closed,

    /// Underlying I/O failure
    #[error("Transport I/O error: {0}")]
    Io(String),
}

/// Command channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No live transport for the node
    #[error("Node {0} is not connected")]
    NotConnected(NodeId),

    /// No result arrived before the deadline
    #[error("Command {command} timed out after {after:?}")]
    Timeout { command: CommandType, after: Duration },

    /// The transport closed while the command was pending
    #[error("Node {node_id} disconnected while {command} was pending")]
    Disconnected { node_id: NodeId, command: CommandType },

    /// The agent reported failure
    #[error("{command} failed: {message}")]
    Remote { command: CommandType, message: String },

    /// Writing to the transport failed
    #[error("Failed to send {command}: {source}")]
    Send {
        command: CommandType,
        #[source]
        source: TransportError,
    },
}

/// Cloud provider errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Provider answered with an error status
    #[error("Cloud API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Resource does not exist
    #[error("Cloud resource not found: {0}")]
    NotFound(String),

    /// Network or client failure
    #[error("Cloud transport error: {0}")]
    Transport(String),

    /// Response could not be decoded
    #[error("Cloud response decode error: {0}")]
    Decode(String),
}

/// Container runtime errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Container or image does not exist
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Runtime rejected the request
    #[error("Container runtime error: {0}")]
    Api(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Config file exists but could not be read
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file or its directory could not be written
    #[error("Failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
