//! In-memory repositories
//!
//! `MemoryStore` backs both repository traits with a single lock so that a
//! status change and its audit row are applied together or not at all. The
//! daemon uses it when no external persistence is wired in.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use bf_core::error::RepoError;
use bf_core::traits::{BotInstanceRepository, NodeRepository};
use bf_core::types::{
    BillingState, BotId, BotInstance, DrainProgress, HeartbeatUpdate, Node, NodeId,
    NodeRegistration, NodeStatus, NodeTransition, ProvisioningUpdate, TenantId,
};

#[derive(Default)]
struct StoreInner {
    nodes: HashMap<NodeId, Node>,
    transitions: Vec<NodeTransition>,
    bots: HashMap<BotId, BotInstance>,
}

impl StoreInner {
    fn node_mut(&mut self, id: &NodeId) -> Result<&mut Node, RepoError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| RepoError::node_not_found(id))
    }

    fn bot_mut(&mut self, id: &BotId) -> Result<&mut BotInstance, RepoError> {
        self.bots.get_mut(id).ok_or_else(|| RepoError::NotFound {
            entity: "bot_instance",
            id: id.to_string(),
        })
    }
}

/// Process-local node and bot instance store
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRepository for MemoryStore {
    async fn get(&self, id: &NodeId) -> Result<Option<Node>, RepoError> {
        Ok(self.inner.read().await.nodes.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Node>, RepoError> {
        let inner = self.inner.read().await;
        let mut nodes: Vec<Node> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn insert(&self, node: Node) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        if inner.nodes.contains_key(&node.id) {
            return Err(RepoError::Duplicate {
                entity: "node",
                id: node.id.to_string(),
            });
        }
        inner.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    async fn record_registration(
        &self,
        registration: &NodeRegistration,
        at: u64,
    ) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(&registration.node_id)?;
        node.host = registration.host.clone();
        node.capacity = registration.capacity;
        node.agent_version = Some(registration.agent_version.clone());
        node.updated_at = at;
        Ok(())
    }

    async fn update_heartbeat(
        &self,
        id: &NodeId,
        update: HeartbeatUpdate,
    ) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(id)?;
        node.used_mb = update.used_mb;
        if let Some(version) = update.agent_version {
            node.agent_version = Some(version);
        }
        node.last_heartbeat_at = Some(update.at);
        node.updated_at = update.at;
        Ok(())
    }

    async fn transition(
        &self,
        id: &NodeId,
        expected: NodeStatus,
        record: NodeTransition,
    ) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(id)?;
        if node.status != expected {
            return Err(RepoError::Conflict {
                expected,
                actual: node.status,
            });
        }
        node.status = record.to_status;
        node.updated_at = record.created_at;
        inner.transitions.push(record);
        Ok(())
    }

    async fn transitions(&self, id: &NodeId) -> Result<Vec<NodeTransition>, RepoError> {
        let inner = self.inner.read().await;
        Ok(inner
            .transitions
            .iter()
            .filter(|t| &t.node_id == id)
            .cloned()
            .collect())
    }

    async fn find_best_for_recovery(&self, exclude: &NodeId) -> Result<Option<Node>, RepoError> {
        let inner = self.inner.read().await;
        Ok(inner
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active && &n.id != exclude)
            .max_by(|a, b| {
                a.capacity
                    .headroom(a.used_mb)
                    .cmp(&b.capacity.headroom(b.used_mb))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .cloned())
    }

    async fn update_provisioning(
        &self,
        id: &NodeId,
        update: ProvisioningUpdate,
    ) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(id)?;
        if let Some(stage) = update.stage {
            node.provision_stage = Some(stage);
        }
        if let Some(instance_id) = update.cloud_instance_id {
            node.cloud_instance_id = Some(instance_id);
        }
        if let Some(host) = update.host {
            node.host = host;
        }
        if let Some(cost) = update.monthly_cost_cents {
            node.monthly_cost_cents = Some(cost);
        }
        if let Some(error) = update.last_error {
            node.last_error = Some(error);
        }
        Ok(())
    }

    async fn update_drain(&self, id: &NodeId, progress: DrainProgress) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        let node = inner.node_mut(id)?;
        node.drain_status = Some(progress.status);
        node.drain_migrated = progress.migrated;
        node.drain_total = progress.total;
        Ok(())
    }

    async fn delete(&self, id: &NodeId) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        inner
            .nodes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RepoError::node_not_found(id))
    }
}

#[async_trait]
impl BotInstanceRepository for MemoryStore {
    async fn get_by_id(&self, id: &BotId) -> Result<Option<BotInstance>, RepoError> {
        Ok(self.inner.read().await.bots.get(id).cloned())
    }

    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<BotInstance>, RepoError> {
        let inner = self.inner.read().await;
        let mut bots: Vec<BotInstance> = inner
            .bots
            .values()
            .filter(|b| b.node_id.as_ref() == Some(node_id))
            .cloned()
            .collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }

    async fn list_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<BotInstance>, RepoError> {
        let inner = self.inner.read().await;
        let mut bots: Vec<BotInstance> = inner
            .bots
            .values()
            .filter(|b| &b.tenant_id == tenant_id)
            .cloned()
            .collect();
        bots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(bots)
    }

    async fn create(&self, bot: BotInstance) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        if inner.bots.contains_key(&bot.id) {
            return Err(RepoError::Duplicate {
                entity: "bot_instance",
                id: bot.id.to_string(),
            });
        }
        inner.bots.insert(bot.id.clone(), bot);
        Ok(())
    }

    async fn reassign(&self, id: &BotId, node_id: &NodeId) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        inner.bot_mut(id)?.node_id = Some(node_id.clone());
        Ok(())
    }

    async fn set_billing_state(&self, id: &BotId, state: BillingState) -> Result<(), RepoError> {
        let mut inner = self.inner.write().await;
        inner.bot_mut(id)?.billing_state = state;
        Ok(())
    }
}
