//! Repository traits

use async_trait::async_trait;

use crate::error::RepoError;
use crate::types::{
    BillingState, BotId, BotInstance, DrainProgress, HeartbeatUpdate, Node, NodeId,
    NodeRegistration, NodeTransition, NodeStatus, ProvisioningUpdate, TenantId,
};

/// Node persistence
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// Get a node by ID
    async fn get(&self, id: &NodeId) -> Result<Option<Node>, RepoError>;

    /// List all nodes
    async fn list(&self) -> Result<Vec<Node>, RepoError>;

    /// Insert a new node; fails with `Duplicate` if the ID is taken
    async fn insert(&self, node: Node) -> Result<(), RepoError>;

    /// Refresh host, capacity and agent version from a registration
    async fn record_registration(
        &self,
        registration: &NodeRegistration,
        at: u64,
    ) -> Result<(), RepoError>;

    /// Record a heartbeat
    async fn update_heartbeat(&self, id: &NodeId, update: HeartbeatUpdate)
        -> Result<(), RepoError>;

    /// Set `status = record.to_status` only if the current status equals
    /// `expected`, appending `record` to the audit log in the same atomic
    /// step. Fails with `Conflict` if the status changed underneath.
    async fn transition(
        &self,
        id: &NodeId,
        expected: NodeStatus,
        record: NodeTransition,
    ) -> Result<(), RepoError>;

    /// Audit history for a node, oldest first
    async fn transitions(&self, id: &NodeId) -> Result<Vec<NodeTransition>, RepoError>;

    /// Active node with the most free capacity, excluding `exclude`
    async fn find_best_for_recovery(&self, exclude: &NodeId) -> Result<Option<Node>, RepoError>;

    /// Write provisioning metadata
    async fn update_provisioning(
        &self,
        id: &NodeId,
        update: ProvisioningUpdate,
    ) -> Result<(), RepoError>;

    /// Write drain progress
    async fn update_drain(&self, id: &NodeId, progress: DrainProgress) -> Result<(), RepoError>;

    /// Delete a node record
    async fn delete(&self, id: &NodeId) -> Result<(), RepoError>;
}

/// Bot instance persistence
#[async_trait]
pub trait BotInstanceRepository: Send + Sync {
    /// Get a bot instance by ID
    async fn get_by_id(&self, id: &BotId) -> Result<Option<BotInstance>, RepoError>;

    /// Bots currently assigned to a node
    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<BotInstance>, RepoError>;

    /// Bots owned by a tenant
    async fn list_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<BotInstance>, RepoError>;

    /// Create a bot instance (initial placement)
    async fn create(&self, bot: BotInstance) -> Result<(), RepoError>;

    /// Move a bot's assignment to another node
    async fn reassign(&self, id: &BotId, node_id: &NodeId) -> Result<(), RepoError>;

    /// Update billing state
    async fn set_billing_state(&self, id: &BotId, state: BillingState) -> Result<(), RepoError>;
}
