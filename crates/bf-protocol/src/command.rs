//! Commands issued by the orchestrator to node agents
//!
//! Commands form a closed set. Each variant carries a typed payload and is
//! serialized as `{"type": "bot.stop", "payload": {...}}`; the envelope adds
//! the correlation id so the wire form is `{"id", "type", "payload"}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Payload addressing a single container on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPayload {
    /// Container name (`tenant_<tenantId>`)
    pub container: String,
}

impl ContainerPayload {
    /// Create a payload for the given container name
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

/// Payload moving a container to or from an archive on the node's disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePayload {
    /// Container name
    pub container: String,
    /// Archive location on the node
    pub archive_path: String,
}

/// Payload for `backup.upload`: node disk to durable storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupUploadPayload {
    /// Archive location on the node
    pub archive_path: String,
    /// Object key in durable storage
    pub storage_key: String,
}

/// Payload for `backup.download`: durable storage to node disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDownloadPayload {
    /// Object key in durable storage
    pub storage_key: String,
    /// Destination on the node
    pub archive_path: String,
}

/// Payload for `bot.import`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportPayload {
    /// Container name to create from the archive
    pub container: String,
    /// Archive location on the node
    pub archive_path: String,
    /// Memory limit for the recreated container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

/// A command for a node agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Command {
    /// Export a container to an archive
    #[serde(rename = "bot.export")]
    Export(ArchivePayload),
    /// Stop a running container
    #[serde(rename = "bot.stop")]
    Stop(ContainerPayload),
    /// Remove a container
    #[serde(rename = "bot.remove")]
    Remove(ContainerPayload),
    /// Start an existing container
    #[serde(rename = "bot.start")]
    Start(ContainerPayload),
    /// Recreate a container from an archive
    #[serde(rename = "bot.import")]
    Import(ImportPayload),
    /// Report container state
    #[serde(rename = "bot.inspect")]
    Inspect(ContainerPayload),
    /// Upload an archive to durable storage
    #[serde(rename = "backup.upload")]
    BackupUpload(BackupUploadPayload),
    /// Download an archive from durable storage
    #[serde(rename = "backup.download")]
    BackupDownload(BackupDownloadPayload),
}

impl Command {
    /// Get the command type for this command
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Export(_) => CommandType::Export,
            Command::Stop(_) => CommandType::Stop,
            Command::Remove(_) => CommandType::Remove,
            Command::Start(_) => CommandType::Start,
            Command::Import(_) => CommandType::Import,
            Command::Inspect(_) => CommandType::Inspect,
            Command::BackupUpload(_) => CommandType::BackupUpload,
            Command::BackupDownload(_) => CommandType::BackupDownload,
        }
    }

    /// Shorthand for `bot.stop`
    pub fn stop(container: impl Into<String>) -> Self {
        Command::Stop(ContainerPayload::new(container))
    }

    /// Shorthand for `bot.start`
    pub fn start(container: impl Into<String>) -> Self {
        Command::Start(ContainerPayload::new(container))
    }

    /// Shorthand for `bot.remove`
    pub fn remove(container: impl Into<String>) -> Self {
        Command::Remove(ContainerPayload::new(container))
    }

    /// Shorthand for `bot.inspect`
    pub fn inspect(container: impl Into<String>) -> Self {
        Command::Inspect(ContainerPayload::new(container))
    }
}

/// Command type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    #[serde(rename = "bot.export")]
    Export,
    #[serde(rename = "bot.stop")]
    Stop,
    #[serde(rename = "bot.remove")]
    Remove,
    #[serde(rename = "bot.start")]
    Start,
    #[serde(rename = "bot.import")]
    Import,
    #[serde(rename = "bot.inspect")]
    Inspect,
    #[serde(rename = "backup.upload")]
    BackupUpload,
    #[serde(rename = "backup.download")]
    BackupDownload,
}

impl CommandType {
    /// All command types
    pub const ALL: [CommandType; 8] = [
        CommandType::Export,
        CommandType::Stop,
        CommandType::Remove,
        CommandType::Start,
        CommandType::Import,
        CommandType::Inspect,
        CommandType::BackupUpload,
        CommandType::BackupDownload,
    ];

    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Export => "bot.export",
            CommandType::Stop => "bot.stop",
            CommandType::Remove => "bot.remove",
            CommandType::Start => "bot.start",
            CommandType::Import => "bot.import",
            CommandType::Inspect => "bot.inspect",
            CommandType::BackupUpload => "backup.upload",
            CommandType::BackupDownload => "backup.download",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownCommandType(s.to_string()))
    }
}

/// A command tagged with its correlation id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Correlation id echoed back in the `command_result`
    pub id: String,
    /// The command itself
    #[serde(flatten)]
    pub command: Command,
}

impl CommandEnvelope {
    /// Wrap a command with a correlation id
    pub fn new(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}
