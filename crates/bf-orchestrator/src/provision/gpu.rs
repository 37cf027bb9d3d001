//! GPU node provisioning

use std::sync::Arc;

use bf_core::config::ProvisioningConfig;
use bf_core::traits::{CloudProvider, NodeClass, NodeRepository, Region, Size};
use bf_core::types::{Node, NodeId};

use super::{NodeProvisioner, ProvisionError, ProvisionRequest};
use crate::node::NodeStateMachine;

/// Provisioner restricted to GPU sizes, using the GPU region, size and
/// image defaults. Node IDs carry a `gpu-` prefix.
pub struct GpuNodeProvisioner {
    inner: NodeProvisioner,
}

impl GpuNodeProvisioner {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        nodes: Arc<dyn NodeRepository>,
        state_machine: Arc<NodeStateMachine>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            inner: NodeProvisioner::for_class(cloud, nodes, state_machine, config, NodeClass::Gpu),
        }
    }

    pub async fn provision(&self, request: ProvisionRequest) -> Result<Node, ProvisionError> {
        self.inner.provision(request).await
    }

    pub async fn destroy(&self, node_id: &NodeId) -> Result<(), ProvisionError> {
        self.inner.destroy(node_id).await
    }

    pub async fn list_sizes(&self) -> Result<Vec<Size>, ProvisionError> {
        self.inner.list_sizes().await
    }

    pub async fn list_regions(&self) -> Result<Vec<Region>, ProvisionError> {
        self.inner.list_regions().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::FakeCloud;
    use bf_core::time::current_time_millis;
    use bf_core::traits::InstanceStatus;
    use bf_core::types::{HeartbeatUpdate, NodeStatus};
    use std::time::Duration;

    fn catalogue() -> FakeCloud {
        FakeCloud {
            sizes: vec![
                FakeCloud::size("s-4vcpu-8gb", false, 48.0),
                FakeCloud::size("gpu-h100x1-80gb", true, 2534.4),
            ],
            regions: vec![
                FakeCloud::region("nyc3", &["s-4vcpu-8gb"]),
                FakeCloud::region("tor1", &["s-4vcpu-8gb", "gpu-h100x1-80gb"]),
            ],
            ..Default::default()
        }
    }

    fn provisioner(store: Arc<MemoryStore>, cloud: Arc<FakeCloud>) -> GpuNodeProvisioner {
        GpuNodeProvisioner::new(
            cloud,
            store.clone(),
            Arc::new(NodeStateMachine::new(store)),
            ProvisioningConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_only_gpu_catalogue() {
        let gpu = provisioner(Arc::new(MemoryStore::new()), Arc::new(catalogue()));

        let sizes = gpu.list_sizes().await.unwrap();
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].slug, "gpu-h100x1-80gb");

        let regions = gpu.list_regions().await.unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].slug, "tor1");
    }

    #[tokio::test]
    async fn test_cpu_size_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let gpu = provisioner(store.clone(), Arc::new(catalogue()));

        let err = gpu
            .provision(ProvisionRequest {
                size: Some("s-4vcpu-8gb".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::SizeNotInClass { class: NodeClass::Gpu, .. }));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_uses_gpu_defaults() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(catalogue().with_polls(vec![FakeCloud::instance(
            "301",
            InstanceStatus::Active,
            &["198.51.100.4"],
        )]));
        let gpu = provisioner(store.clone(), cloud.clone());

        let reporter = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            for node in reporter.list().await.unwrap() {
                reporter
                    .update_heartbeat(
                        &node.id,
                        HeartbeatUpdate {
                            used_mb: 0,
                            agent_version: None,
                            at: current_time_millis(),
                        },
                    )
                    .await
                    .unwrap();
            }
        });

        let node = gpu.provision(ProvisionRequest::default()).await.unwrap();

        assert!(node.id.as_str().starts_with("gpu-"));
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(node.region.as_deref(), Some("tor1"));
        assert_eq!(node.size.as_deref(), Some("gpu-h100x1-80gb"));
        assert_eq!(node.monthly_cost_cents, Some(253440));

        let specs = cloud.created_specs.lock().unwrap().clone();
        assert_eq!(specs[0].image, "gpu-h100x1-base");
        assert_eq!(specs[0].region, "tor1");
    }
}
