//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

use bf_protocol::Registration;

/// Prefix of every tenant container name on a node
pub const CONTAINER_PREFIX: &str = "tenant_";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the raw ID string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier for a worker node
    NodeId
);
string_id!(
    /// Unique identifier for a tenant
    TenantId
);
string_id!(
    /// Unique identifier for a bot instance
    BotId
);

impl TenantId {
    /// Name of the container running this tenant's bot
    pub fn container_name(&self) -> String {
        format!("{}{}", CONTAINER_PREFIX, self.0)
    }

    /// Parse a tenant ID out of a container name following the
    /// `tenant_<tenantId>` convention
    pub fn from_container_name(name: &str) -> Option<Self> {
        let name = name.strip_prefix('/').unwrap_or(name);
        name.strip_prefix(CONTAINER_PREFIX)
            .filter(|rest| !rest.is_empty())
            .map(Self::new)
    }
}

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Cloud instance is being created
    Provisioning,
    /// Healthy and accepting work
    Active,
    /// Heartbeats have stopped recently
    Unhealthy,
    /// Heartbeats have been missing long enough to give up on the node
    Offline,
    /// Tenants of an offline node are being restored elsewhere
    Recovering,
    /// Node reconnected; stale containers are being cleaned up
    Returning,
    /// Tenants are being migrated off before decommissioning
    Draining,
    /// Provisioning or return failed
    Failed,
}

impl NodeStatus {
    /// All node states
    pub const ALL: [NodeStatus; 8] = [
        NodeStatus::Provisioning,
        NodeStatus::Active,
        NodeStatus::Unhealthy,
        NodeStatus::Offline,
        NodeStatus::Recovering,
        NodeStatus::Returning,
        NodeStatus::Draining,
        NodeStatus::Failed,
    ];

    /// Stable string form
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Provisioning => "provisioning",
            NodeStatus::Active => "active",
            NodeStatus::Unhealthy => "unhealthy",
            NodeStatus::Offline => "offline",
            NodeStatus::Recovering => "recovering",
            NodeStatus::Returning => "returning",
            NodeStatus::Draining => "draining",
            NodeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory capacity of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "mb", rename_all = "snake_case")]
pub enum Capacity {
    /// A fixed amount of memory in MB
    Limited(u64),
    /// No limit enforced by the orchestrator
    Unlimited,
}

impl Capacity {
    /// Convert the wire representation, where `None` or `0` means unlimited
    pub fn from_wire(capacity_mb: Option<u64>) -> Self {
        match capacity_mb {
            None | Some(0) => Capacity::Unlimited,
            Some(mb) => Capacity::Limited(mb),
        }
    }

    /// Free memory given the current usage; `None` when unlimited
    pub fn free_mb(&self, used_mb: u64) -> Option<u64> {
        match self {
            Capacity::Limited(total) => Some(total.saturating_sub(used_mb)),
            Capacity::Unlimited => None,
        }
    }

    /// Free memory for ranking placement candidates; unlimited ranks highest
    pub fn headroom(&self, used_mb: u64) -> u64 {
        self.free_mb(used_mb).unwrap_or(u64::MAX)
    }
}

/// Stage of an in-flight provisioning request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    Pending,
    Creating,
    WaitingActive,
    WaitingAgent,
    Ready,
    Failed,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProvisionStage::Pending => "pending",
            ProvisionStage::Creating => "creating",
            ProvisionStage::WaitingActive => "waiting_active",
            ProvisionStage::WaitingAgent => "waiting_agent",
            ProvisionStage::Ready => "ready",
            ProvisionStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    InProgress,
    Drained,
    Failed,
}

/// A worker node hosting tenant bot containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub host: String,
    pub status: NodeStatus,
    pub capacity: Capacity,
    pub used_mb: u64,
    pub agent_version: Option<String>,
    /// Unix millis of the last heartbeat
    pub last_heartbeat_at: Option<u64>,
    pub registered_at: u64,
    pub updated_at: u64,

    // Provisioning metadata, written only by a provisioner
    pub cloud_instance_id: Option<String>,
    pub region: Option<String>,
    pub size: Option<String>,
    pub monthly_cost_cents: Option<u64>,
    pub provision_stage: Option<ProvisionStage>,
    pub last_error: Option<String>,

    // Drain bookkeeping
    pub drain_status: Option<DrainStatus>,
    pub drain_migrated: u32,
    pub drain_total: u32,

    // Self-hosted ownership
    pub owner_user_id: Option<String>,
    pub node_secret: Option<String>,
    pub label: Option<String>,
}

impl Node {
    /// Create a node record in the `provisioning` state
    pub fn new(id: NodeId, host: impl Into<String>, capacity: Capacity, now: u64) -> Self {
        Self {
            id,
            host: host.into(),
            status: NodeStatus::Provisioning,
            capacity,
            used_mb: 0,
            agent_version: None,
            last_heartbeat_at: None,
            registered_at: now,
            updated_at: now,
            cloud_instance_id: None,
            region: None,
            size: None,
            monthly_cost_cents: None,
            provision_stage: None,
            last_error: None,
            drain_status: None,
            drain_migrated: 0,
            drain_total: 0,
            owner_user_id: None,
            node_secret: None,
            label: None,
        }
    }

    /// Create a node record from an agent registration
    pub fn from_registration(registration: &NodeRegistration, now: u64) -> Self {
        let mut node = Self::new(
            registration.node_id.clone(),
            registration.host.clone(),
            registration.capacity,
            now,
        );
        node.agent_version = Some(registration.agent_version.clone());
        node
    }

    /// Free memory; `None` when capacity is unlimited
    pub fn free_mb(&self) -> Option<u64> {
        self.capacity.free_mb(self.used_mb)
    }

    /// Whether the node may be destroyed without losing workload
    pub fn is_empty_or_drained(&self) -> bool {
        self.used_mb == 0 || self.drain_status == Some(DrainStatus::Drained)
    }
}

/// Append-only audit record of an accepted state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTransition {
    pub id: String,
    pub node_id: NodeId,
    pub from_status: NodeStatus,
    pub to_status: NodeStatus,
    pub reason: String,
    pub triggered_by: String,
    pub created_at: u64,
}

/// Billing state of a bot instance, owned by the billing system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    Active,
    Grace,
    Suspended,
    Cancelled,
}

/// A tenant's bot workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotInstance {
    pub id: BotId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Current node assignment
    pub node_id: Option<NodeId>,
    pub billing_state: BillingState,
}

impl BotInstance {
    /// Name of the container running this bot
    pub fn container_name(&self) -> String {
        self.tenant_id.container_name()
    }
}

/// Registration input produced when an agent connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub host: String,
    pub capacity: Capacity,
    pub agent_version: String,
}

impl From<&Registration> for NodeRegistration {
    fn from(registration: &Registration) -> Self {
        Self {
            node_id: NodeId::new(registration.node_id.clone()),
            host: registration.host.clone(),
            capacity: Capacity::from_wire(registration.capacity_mb),
            agent_version: registration.agent_version.clone(),
        }
    }
}

/// Heartbeat data written to the node record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatUpdate {
    pub used_mb: u64,
    pub agent_version: Option<String>,
    pub at: u64,
}

/// Partial update of provisioning metadata; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningUpdate {
    pub stage: Option<ProvisionStage>,
    pub cloud_instance_id: Option<String>,
    pub host: Option<String>,
    pub monthly_cost_cents: Option<u64>,
    pub last_error: Option<String>,
}

impl ProvisioningUpdate {
    /// Update only the stage
    pub fn stage(stage: ProvisionStage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }
}

/// Drain progress written to the node record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainProgress {
    pub status: DrainStatus,
    pub migrated: u32,
    pub total: u32,
}
