//! Node provisioning
//!
//! [`NodeProvisioner`] turns a request into a running, registered node:
//!
//! 1. insert a placeholder record (`provisioning`, stage `pending`)
//! 2. ask the cloud provider for an instance (`creating`)
//! 3. poll until the instance is active with a public address
//!    (`waiting_active`)
//! 4. poll until the node's agent has sent a heartbeat (`waiting_agent`)
//! 5. move the node to `active` (`ready`)
//!
//! Any failure marks the node `failed` with `last_error` set, so a record
//! never stays in an intermediate stage.

mod digitalocean;
mod gpu;

pub use digitalocean::DigitalOceanProvider;
pub use gpu::GpuNodeProvisioner;

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;

use bf_core::config::ProvisioningConfig;
use bf_core::error::{CloudError, NodeError, RepoError};
use bf_core::time::current_time_millis;
use bf_core::traits::{CloudProvider, InstanceSpec, InstanceStatus, NodeClass, NodeRepository, Region, Size};
use bf_core::types::{Capacity, Node, NodeId, NodeStatus, ProvisionStage, ProvisioningUpdate};

use crate::node::NodeStateMachine;

const TRIGGERED_BY: &str = "node_provisioner";

/// Provisioning failures
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Cloud provider error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Instance {instance_id} is active but has no public IPv4 address")]
    MissingPublicIp { instance_id: String },

    #[error("Instance {instance_id} not active after {after:?}")]
    InstanceTimeout { instance_id: String, after: Duration },

    #[error("Agent on node {node_id} did not report within {after:?}")]
    AgentTimeout { node_id: NodeId, after: Duration },

    #[error("Unknown size: {0}")]
    UnknownSize(String),

    #[error("Size {size} is not a {class:?} size")]
    SizeNotInClass { size: String, class: NodeClass },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {node_id} still hosts {used_mb} MB of workload and is not drained")]
    HasWorkload { node_id: NodeId, used_mb: u64 },

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),
}

/// Parameters for a new node; unset fields use the configured defaults
#[derive(Debug, Clone, Default)]
pub struct ProvisionRequest {
    pub region: Option<String>,
    pub size: Option<String>,
    pub label: Option<String>,
    pub owner_user_id: Option<String>,
}

/// Creates and destroys cloud-backed nodes of one class
pub struct NodeProvisioner {
    cloud: Arc<dyn CloudProvider>,
    nodes: Arc<dyn NodeRepository>,
    state_machine: Arc<NodeStateMachine>,
    config: ProvisioningConfig,
    class: NodeClass,
}

impl NodeProvisioner {
    /// Provisioner for CPU nodes
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        nodes: Arc<dyn NodeRepository>,
        state_machine: Arc<NodeStateMachine>,
        config: ProvisioningConfig,
    ) -> Self {
        Self::for_class(cloud, nodes, state_machine, config, NodeClass::Cpu)
    }

    pub(crate) fn for_class(
        cloud: Arc<dyn CloudProvider>,
        nodes: Arc<dyn NodeRepository>,
        state_machine: Arc<NodeStateMachine>,
        config: ProvisioningConfig,
        class: NodeClass,
    ) -> Self {
        Self {
            cloud,
            nodes,
            state_machine,
            config,
            class,
        }
    }

    fn default_region(&self) -> &str {
        match self.class {
            NodeClass::Cpu => &self.config.region,
            NodeClass::Gpu => &self.config.gpu_region,
        }
    }

    fn default_size(&self) -> &str {
        match self.class {
            NodeClass::Cpu => &self.config.size,
            NodeClass::Gpu => &self.config.gpu_size,
        }
    }

    fn image(&self) -> &str {
        match self.class {
            NodeClass::Cpu => &self.config.image,
            NodeClass::Gpu => &self.config.gpu_image,
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self.class {
            NodeClass::Cpu => "node-",
            NodeClass::Gpu => "gpu-",
        }
    }

    /// Provision a node and wait until its agent is reporting.
    ///
    /// Returns the final node record. On failure the node (if one was
    /// inserted) is left `failed` with the error recorded.
    #[instrument(skip_all, fields(class = ?self.class))]
    pub async fn provision(&self, request: ProvisionRequest) -> Result<Node, ProvisionError> {
        let region = request
            .region
            .unwrap_or_else(|| self.default_region().to_string());
        let size_slug = request
            .size
            .unwrap_or_else(|| self.default_size().to_string());
        let size = self.lookup_size(&size_slug).await?;

        let node_id = NodeId::new(format!(
            "{}{}",
            self.id_prefix(),
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        ));
        let secret = generate_secret();

        let mut node = Node::new(
            node_id.clone(),
            "",
            Capacity::Limited(size.memory_mb),
            current_time_millis(),
        );
        node.region = Some(region.clone());
        node.size = Some(size.slug.clone());
        node.label = request.label;
        node.owner_user_id = request.owner_user_id;
        node.node_secret = Some(secret.clone());
        node.provision_stage = Some(ProvisionStage::Pending);
        self.nodes.insert(node).await?;

        tracing::info!(node_id = %node_id, region = %region, size = %size.slug, "Provisioning node");

        if let Err(e) = self.bring_up(&node_id, &region, &size, &secret).await {
            tracing::error!(node_id = %node_id, error = %e, "Provisioning failed");
            self.mark_failed(&node_id, &e).await;
            return Err(e);
        }

        self.nodes
            .get(&node_id)
            .await?
            .ok_or(ProvisionError::NodeNotFound(node_id))
    }

    async fn bring_up(
        &self,
        node_id: &NodeId,
        region: &str,
        size: &Size,
        secret: &str,
    ) -> Result<(), ProvisionError> {
        self.set_stage(node_id, ProvisionStage::Creating).await?;
        let spec = InstanceSpec {
            name: node_id.to_string(),
            region: region.to_string(),
            size: size.slug.clone(),
            image: self.image().to_string(),
            user_data: Some(cloud_init(
                node_id,
                secret,
                &self.config.orchestrator_address,
            )),
            tags: self.config.tags.clone(),
        };
        let instance = self.cloud.create(&spec).await?;
        self.nodes
            .update_provisioning(
                node_id,
                ProvisioningUpdate {
                    cloud_instance_id: Some(instance.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.set_stage(node_id, ProvisionStage::WaitingActive).await?;
        let address = self.wait_active(&instance.id).await?;
        self.nodes
            .update_provisioning(
                node_id,
                ProvisioningUpdate {
                    stage: Some(ProvisionStage::WaitingAgent),
                    host: Some(address.clone()),
                    monthly_cost_cents: Some(size.monthly_cost_cents()),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(node_id = %node_id, address = %address, "Instance is up, waiting for agent");

        self.wait_agent(node_id).await?;

        self.state_machine
            .transition(node_id, NodeStatus::Active, "provision_complete", TRIGGERED_BY)
            .await?;
        self.set_stage(node_id, ProvisionStage::Ready).await?;
        Ok(())
    }

    async fn set_stage(&self, node_id: &NodeId, stage: ProvisionStage) -> Result<(), RepoError> {
        tracing::debug!(node_id = %node_id, %stage, "Provisioning stage");
        self.nodes
            .update_provisioning(node_id, ProvisioningUpdate::stage(stage))
            .await
    }

    /// Poll until the instance is active, returning its public address
    async fn wait_active(&self, instance_id: &str) -> Result<String, ProvisionError> {
        let deadline = Instant::now() + self.config.timeout;

        loop {
            let instance = self.cloud.get(instance_id).await?;
            if instance.status == InstanceStatus::Active {
                return instance
                    .public_address()
                    .map(str::to_string)
                    .ok_or_else(|| ProvisionError::MissingPublicIp {
                        instance_id: instance_id.to_string(),
                    });
            }

            if Instant::now() + self.config.poll_interval > deadline {
                return Err(ProvisionError::InstanceTimeout {
                    instance_id: instance_id.to_string(),
                    after: self.config.timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Poll until the node has recorded a heartbeat
    async fn wait_agent(&self, node_id: &NodeId) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + self.config.agent_timeout;

        loop {
            let node = self
                .nodes
                .get(node_id)
                .await?
                .ok_or_else(|| ProvisionError::NodeNotFound(node_id.clone()))?;
            if node.last_heartbeat_at.is_some() {
                return Ok(());
            }

            if Instant::now() + self.config.poll_interval > deadline {
                return Err(ProvisionError::AgentTimeout {
                    node_id: node_id.clone(),
                    after: self.config.agent_timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn mark_failed(&self, node_id: &NodeId, error: &ProvisionError) {
        let update = ProvisioningUpdate {
            stage: Some(ProvisionStage::Failed),
            last_error: Some(error.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.nodes.update_provisioning(node_id, update).await {
            tracing::error!(node_id = %node_id, error = %e, "Failed to record provisioning error");
        }
        if let Err(e) = self
            .state_machine
            .transition(node_id, NodeStatus::Failed, "provision_failed", TRIGGERED_BY)
            .await
        {
            tracing::error!(node_id = %node_id, error = %e, "Failed to mark node failed");
        }
    }

    /// Delete a node's cloud instance and its record.
    ///
    /// Refused while the node still carries workload, unless it has been
    /// fully drained.
    #[instrument(skip_all, fields(node_id = %node_id))]
    pub async fn destroy(&self, node_id: &NodeId) -> Result<(), ProvisionError> {
        let node = self
            .nodes
            .get(node_id)
            .await?
            .ok_or_else(|| ProvisionError::NodeNotFound(node_id.clone()))?;

        if !node.is_empty_or_drained() {
            return Err(ProvisionError::HasWorkload {
                node_id: node_id.clone(),
                used_mb: node.used_mb,
            });
        }

        match node.cloud_instance_id.as_deref() {
            Some(instance_id) => match self.cloud.delete(instance_id).await {
                Ok(()) => tracing::info!(instance_id, "Deleted cloud instance"),
                Err(CloudError::NotFound(_)) => {
                    tracing::info!(instance_id, "Cloud instance already gone")
                }
                Err(e) => return Err(e.into()),
            },
            None => tracing::debug!("No cloud instance allocated"),
        }

        self.nodes.delete(node_id).await?;
        tracing::info!("Node destroyed");
        Ok(())
    }

    /// Available sizes of this provisioner's class
    pub async fn list_sizes(&self) -> Result<Vec<Size>, ProvisionError> {
        let class = self.class;
        Ok(self
            .cloud
            .list_sizes()
            .await?
            .into_iter()
            .filter(|size| size.available && size.is_class(class))
            .collect())
    }

    /// Available regions offering at least one size of this class
    pub async fn list_regions(&self) -> Result<Vec<Region>, ProvisionError> {
        let sizes: Vec<String> = self
            .list_sizes()
            .await?
            .into_iter()
            .map(|size| size.slug)
            .collect();

        Ok(self
            .cloud
            .list_regions()
            .await?
            .into_iter()
            .filter(|region| region.available && region.sizes.iter().any(|s| sizes.contains(s)))
            .collect())
    }

    async fn lookup_size(&self, slug: &str) -> Result<Size, ProvisionError> {
        let size = self
            .cloud
            .list_sizes()
            .await?
            .into_iter()
            .find(|size| size.slug == slug)
            .ok_or_else(|| ProvisionError::UnknownSize(slug.to_string()))?;

        if !size.is_class(self.class) {
            return Err(ProvisionError::SizeNotInClass {
                size: slug.to_string(),
                class: self.class,
            });
        }
        Ok(size)
    }
}

/// Random per-node secret the agent presents when registering
fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// First-boot script handing the agent its identity
fn cloud_init(node_id: &NodeId, secret: &str, orchestrator: &str) -> String {
    format!(
        "#!/bin/bash\n\
         set -euo pipefail\n\
         mkdir -p /etc/botfleet\n\
         cat > /etc/botfleet/agent.env <<'EOF'\n\
         BOTFLEET_NODE_ID={node_id}\n\
         BOTFLEET_NODE_SECRET={secret}\n\
         BOTFLEET_ORCHESTRATOR={orchestrator}\n\
         EOF\n\
         chmod 600 /etc/botfleet/agent.env\n\
         systemctl enable --now botfleet-agent\n"
    )
}
