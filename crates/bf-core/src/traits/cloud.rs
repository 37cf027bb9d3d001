//! Cloud provider trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudError;

/// Class of compute a node is provisioned for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Cpu,
    Gpu,
}

/// Request for a new compute instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub name: String,
    pub region: String,
    pub size: String,
    pub image: String,
    pub user_data: Option<String>,
    pub tags: Vec<String>,
}

/// Provider-reported instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    New,
    Active,
    Off,
    Archive,
    #[serde(other)]
    Unknown,
}

/// A compute instance as seen by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub status: InstanceStatus,
    /// Public IPv4 addresses assigned so far
    pub public_ipv4: Vec<String>,
}

impl Instance {
    /// First public IPv4 address, if one has been assigned
    pub fn public_address(&self) -> Option<&str> {
        self.public_ipv4.first().map(String::as_str)
    }
}

/// A provider region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub slug: String,
    pub name: String,
    pub available: bool,
    /// Size slugs offered in this region
    pub sizes: Vec<String>,
}

/// A provider instance size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub slug: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub price_monthly: f64,
    pub available: bool,
    pub regions: Vec<String>,
    pub gpu: bool,
}

impl Size {
    /// Whether the size belongs to the requested class
    pub fn is_class(&self, class: NodeClass) -> bool {
        match class {
            NodeClass::Gpu => self.gpu,
            NodeClass::Cpu => !self.gpu,
        }
    }

    /// Monthly price in cents
    pub fn monthly_cost_cents(&self) -> u64 {
        (self.price_monthly * 100.0).round().max(0.0) as u64
    }
}

/// Cloud compute provider
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Request a new instance
    async fn create(&self, spec: &InstanceSpec) -> Result<Instance, CloudError>;

    /// Current status and addresses of an instance
    async fn get(&self, id: &str) -> Result<Instance, CloudError>;

    /// Delete an instance
    async fn delete(&self, id: &str) -> Result<(), CloudError>;

    /// All regions
    async fn list_regions(&self) -> Result<Vec<Region>, CloudError>;

    /// All sizes
    async fn list_sizes(&self) -> Result<Vec<Size>, CloudError>;
}
