//! Container runtime trait

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Label carrying the bot ID on every bot container
pub const BOT_LABEL: &str = "botfleet.bot-id";

/// Health probe state reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
}

/// Everything needed to (re)create a container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub memory_mb: Option<u64>,
}

/// Container as returned by a list call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

/// Container as returned by inspect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerDetails {
    pub id: String,
    /// Content digest of the image the container runs
    pub image_id: String,
    pub running: bool,
    /// `None` when no health probe is configured
    pub health: Option<HealthStatus>,
    /// Configuration the container was created with
    pub spec: ContainerSpec,
}

/// Local container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Containers carrying `key=value`
    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Inspect a container
    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError>;

    /// Stop a container
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove a container
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Start a container
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Pull an image
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create a container, returning its ID
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
}
