//! Message types for the botfleet agent protocol
//!
//! # Message Flow
//!
//! 1. Agent connects and sends `register`
//! 2. Orchestrator responds with `register_ack`
//! 3. Agent sends `heartbeat` periodically with its running containers
//! 4. Orchestrator sends commands (`{"id", "type", "payload"}`), agent
//!    answers each with a `command_result` carrying the same `id`
//!
//! Inbound messages with an unrecognized `type` decode to
//! [`AgentMessage::Unknown`] so a newer agent cannot wedge the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::CommandEnvelope;

/// Registration sent by an agent as the first message on a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Node ID assigned at provisioning time (or chosen by a self-hosted agent)
    pub node_id: String,
    /// Address the node is reachable at
    pub host: String,
    /// Memory available for bots; `null` or `0` means unlimited
    #[serde(default)]
    pub capacity_mb: Option<u64>,
    /// Agent build version
    #[serde(default)]
    pub agent_version: String,
    /// Shared secret issued to the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_secret: Option<String>,
}

/// One running container reported in a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReport {
    /// Container name
    pub name: String,
    /// Memory currently used by the container
    #[serde(default)]
    pub memory_mb: u64,
}

/// Periodic agent heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Containers currently running on the node
    #[serde(default)]
    pub containers: Vec<ContainerReport>,
    /// Agent build version
    #[serde(default)]
    pub agent_version: Option<String>,
}

impl Heartbeat {
    /// Total memory used by all reported containers, saturating at `u64::MAX`
    pub fn used_mb(&self) -> u64 {
        self.containers
            .iter()
            .fold(0u64, |total, c| total.saturating_add(c.memory_mb))
    }

    /// Names of all reported containers
    pub fn container_names(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }
}

/// Result of a previously issued command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Correlation id of the command
    pub id: String,
    /// Wire name of the command this answers
    #[serde(default)]
    pub command: Option<String>,
    /// Whether the command succeeded
    pub success: bool,
    /// Command-specific result data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// Successful result
    pub fn ok(id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            command: None,
            success: true,
            data,
            error: None,
        }
    }

    /// Failed result
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: None,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Messages sent by a node agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Agent registration
    Register(Registration),
    /// Periodic heartbeat
    Heartbeat(Heartbeat),
    /// Result of a command
    CommandResult(CommandResult),
    /// Anything else; logged and dropped by the orchestrator
    #[serde(other)]
    Unknown,
}

/// Registration acknowledgment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "register_ack")]
pub struct RegisterAck {
    /// Whether registration was accepted
    pub accepted: bool,
    /// Reason if not accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Messages sent by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundFrame {
    /// A correlated command
    Command(CommandEnvelope),
    /// Answer to `register`
    RegisterAck(RegisterAck),
}

impl OutboundFrame {
    /// Accepted registration
    pub fn accepted() -> Self {
        OutboundFrame::RegisterAck(RegisterAck {
            accepted: true,
            reason: None,
        })
    }

    /// Rejected registration
    pub fn rejected(reason: impl Into<String>) -> Self {
        OutboundFrame::RegisterAck(RegisterAck {
            accepted: false,
            reason: Some(reason.into()),
        })
    }

    /// The command envelope, if this frame carries one
    pub fn as_command(&self) -> Option<&CommandEnvelope> {
        match self {
            OutboundFrame::Command(envelope) => Some(envelope),
            OutboundFrame::RegisterAck(_) => None,
        }
    }
}
