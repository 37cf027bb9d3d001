//! Configuration management for botfleet

mod orchestrator;
pub mod serde_utils;

pub use orchestrator::{
    DigitalOceanConfig, HealthConfig, MigrationConfig, OrchestratorConfig, ProvisioningConfig,
    UpdateConfig,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Environment variable that points the daemon at a config file
pub const CONFIG_ENV: &str = "BOTFLEET_CONFIG";

/// Per-user botfleet directory, `./botfleet` if the platform has none
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("botfleet")
}

/// `$BOTFLEET_CONFIG` if set, else `<config dir>/botfleet/config.toml`
pub fn default_config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => default_config_dir().join("config.toml"),
    }
}

/// Read and validate an orchestrator config
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let config: OrchestratorConfig = toml::from_str(&content)?;
    config.validate()?;
    tracing::debug!(path = %path.display(), bind = %config.bind_address, "Loaded config");
    Ok(config)
}

/// Write a config, creating its directory if needed
pub fn save_config(path: &Path, config: &OrchestratorConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, content).map_err(write_err)
}
