//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the orchestrator daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address agents connect to
    pub bind_address: String,

    /// Default deadline for a command result
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Create records for agents registering with an unknown node ID
    pub allow_unknown_nodes: bool,

    /// Heartbeat-driven health tracking
    pub health: HealthConfig,

    /// Tenant migration
    pub migration: MigrationConfig,

    /// Rolling image updates
    pub update: UpdateConfig,

    /// Node provisioning
    pub provisioning: ProvisioningConfig,

    /// DigitalOcean API access
    pub digitalocean: DigitalOceanConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7400".to_string(),
            command_timeout: Duration::from_secs(60),
            allow_unknown_nodes: true,
            health: HealthConfig::default(),
            migration: MigrationConfig::default(),
            update: UpdateConfig::default(),
            provisioning: ProvisioningConfig::default(),
            digitalocean: DigitalOceanConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = [
            ("command_timeout", self.command_timeout),
            ("health.sweep_interval", self.health.sweep_interval),
            ("update.health_interval", self.update.health_interval),
            ("provisioning.poll_interval", self.provisioning.poll_interval),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
        }

        // A node must pass through unhealthy before it can go offline
        if self.health.offline_after <= self.health.unhealthy_after {
            return Err(ConfigError::Invalid(format!(
                "health.offline_after ({:?}) must exceed health.unhealthy_after ({:?})",
                self.health.offline_after, self.health.unhealthy_after
            )));
        }
        Ok(())
    }
}

/// Heartbeat staleness thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// How often node health is re-evaluated
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Silence after which an active node becomes unhealthy
    #[serde(with = "duration_secs")]
    pub unhealthy_after: Duration,

    /// Silence after which an unhealthy node goes offline
    #[serde(with = "duration_secs")]
    pub offline_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(15),
            unhealthy_after: Duration::from_secs(90),
            offline_after: Duration::from_secs(300),
        }
    }
}

/// Migration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory on nodes used for export/import archives
    pub archive_dir: PathBuf,

    /// Key prefix in durable storage
    pub storage_prefix: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("/var/lib/botfleet/archives"),
            storage_prefix: "migrations".to_string(),
        }
    }
}

/// Rolling update settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// How long a new container has to become healthy
    #[serde(with = "duration_secs")]
    pub health_timeout: Duration,

    /// Delay between health polls
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            health_timeout: Duration::from_secs(60),
            health_interval: Duration::from_secs(5),
        }
    }
}

/// Provisioning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Delay between provider polls
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Deadline for the instance to become active with a public address
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Deadline for the agent's first heartbeat once the instance is up
    #[serde(with = "duration_secs")]
    pub agent_timeout: Duration,

    /// Default region for CPU nodes
    pub region: String,

    /// Default size for CPU nodes
    pub size: String,

    /// Image for CPU nodes
    pub image: String,

    /// Default region for GPU nodes
    pub gpu_region: String,

    /// Default size for GPU nodes
    pub gpu_size: String,

    /// Image for GPU nodes
    pub gpu_image: String,

    /// Address agents are told to connect to
    pub orchestrator_address: String,

    /// Tags applied to every instance
    pub tags: Vec<String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
            agent_timeout: Duration::from_secs(600),
            region: "nyc3".to_string(),
            size: "s-4vcpu-8gb".to_string(),
            image: "ubuntu-24-04-x64".to_string(),
            gpu_region: "tor1".to_string(),
            gpu_size: "gpu-h100x1-80gb".to_string(),
            gpu_image: "gpu-h100x1-base".to_string(),
            orchestrator_address: "127.0.0.1:7400".to_string(),
            tags: vec!["botfleet".to_string()],
        }
    }
}

/// DigitalOcean API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOceanConfig {
    /// API base URL
    pub api_base: String,

    /// Environment variable holding the API token
    pub token_env: String,
}

impl Default for DigitalOceanConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.digitalocean.com".to_string(),
            token_env: "DIGITALOCEAN_TOKEN".to_string(),
        }
    }
}
