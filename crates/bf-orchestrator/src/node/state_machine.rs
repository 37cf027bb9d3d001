//! Node state machine
//!
//! Every status change goes through [`NodeStateMachine::transition`], which
//! validates the move against the transition table and applies it as a
//! conditional update: the write only lands if the node is still in the
//! status that was read, so two racing callers cannot both win.

use std::sync::Arc;

use tracing::instrument;

use bf_core::error::{NodeError, RepoError};
use bf_core::time::current_time_millis;
use bf_core::traits::NodeRepository;
use bf_core::types::{NodeId, NodeStatus, NodeTransition};

/// Allowed targets for each source status
fn allowed_targets(from: NodeStatus) -> &'static [NodeStatus] {
    use NodeStatus::*;

    match from {
        Provisioning => &[Active, Failed],
        Active => &[Unhealthy, Draining],
        Unhealthy => &[Active, Offline],
        Offline => &[Recovering, Returning],
        Recovering => &[Offline, Returning],
        Returning => &[Active, Failed],
        Draining => &[Offline],
        Failed => &[Returning],
    }
}

/// Whether `from -> to` appears in the transition table
pub fn is_valid_transition(from: NodeStatus, to: NodeStatus) -> bool {
    allowed_targets(from).contains(&to)
}

/// Audited, concurrency-safe status transitions
pub struct NodeStateMachine {
    nodes: Arc<dyn NodeRepository>,
}

impl NodeStateMachine {
    pub fn new(nodes: Arc<dyn NodeRepository>) -> Self {
        Self { nodes }
    }

    /// Move a node to `to`, recording who asked and why.
    ///
    /// Fails with `ConcurrentTransition` if another caller changed the
    /// node's status between the read and the write; the caller should
    /// re-read and decide again.
    #[instrument(skip_all, fields(node_id = %node_id, to = %to))]
    pub async fn transition(
        &self,
        node_id: &NodeId,
        to: NodeStatus,
        reason: &str,
        triggered_by: &str,
    ) -> Result<NodeTransition, NodeError> {
        let node = self
            .nodes
            .get(node_id)
            .await?
            .ok_or_else(|| NodeError::NotFound(node_id.clone()))?;
        let from = node.status;

        if !is_valid_transition(from, to) {
            return Err(NodeError::InvalidTransition {
                node_id: node_id.clone(),
                from,
                to,
            });
        }

        let record = NodeTransition {
            id: uuid::Uuid::new_v4().to_string(),
            node_id: node_id.clone(),
            from_status: from,
            to_status: to,
            reason: reason.to_string(),
            triggered_by: triggered_by.to_string(),
            created_at: current_time_millis(),
        };

        match self.nodes.transition(node_id, from, record.clone()).await {
            Ok(()) => {
                tracing::info!(%from, reason, triggered_by, "Node transitioned");
                Ok(record)
            }
            Err(RepoError::Conflict { expected, actual }) => {
                tracing::debug!(%expected, %actual, "Lost transition race");
                Err(NodeError::ConcurrentTransition {
                    node_id: node_id.clone(),
                    expected,
                    actual,
                })
            }
            Err(RepoError::NotFound { .. }) => Err(NodeError::NotFound(node_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Audit history for a node, oldest first
    pub async fn history(&self, node_id: &NodeId) -> Result<Vec<NodeTransition>, NodeError> {
        Ok(self.nodes.transitions(node_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use bf_core::types::{
        Capacity, DrainProgress, HeartbeatUpdate, Node, NodeRegistration, ProvisioningUpdate,
    };
    use tokio::sync::Barrier;

    async fn store_with(id: &str, status: NodeStatus) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let mut node = Node::new(NodeId::new(id), "10.0.0.1", Capacity::Unlimited, 0);
        node.status = status;
        store.insert(node).await.unwrap();
        store
    }

    #[test]
    fn test_table_pairs_are_valid() {
        let valid = [
            (NodeStatus::Provisioning, NodeStatus::Active),
            (NodeStatus::Provisioning, NodeStatus::Failed),
            (NodeStatus::Active, NodeStatus::Unhealthy),
            (NodeStatus::Active, NodeStatus::Draining),
            (NodeStatus::Unhealthy, NodeStatus::Active),
            (NodeStatus::Unhealthy, NodeStatus::Offline),
            (NodeStatus::Offline, NodeStatus::Recovering),
            (NodeStatus::Offline, NodeStatus::Returning),
            (NodeStatus::Recovering, NodeStatus::Offline),
            (NodeStatus::Recovering, NodeStatus::Returning),
            (NodeStatus::Returning, NodeStatus::Active),
            (NodeStatus::Returning, NodeStatus::Failed),
            (NodeStatus::Draining, NodeStatus::Offline),
            (NodeStatus::Failed, NodeStatus::Returning),
        ];

        let mut accepted = 0;
        for from in NodeStatus::ALL {
            for to in NodeStatus::ALL {
                let expected = valid.contains(&(from, to));
                assert_eq!(
                    is_valid_transition(from, to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
                if expected {
                    accepted += 1;
                }
            }
        }
        assert_eq!(accepted, valid.len());
    }

    #[test]
    fn test_self_transitions_are_rejected() {
        for status in NodeStatus::ALL {
            assert!(!is_valid_transition(status, status), "{}", status);
        }
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found() {
        let machine = NodeStateMachine::new(Arc::new(MemoryStore::new()));

        let err = machine
            .transition(&NodeId::new("ghost"), NodeStatus::Active, "test", "test")
            .await
            .unwrap_err();
        assert_eq!(err, NodeError::NotFound(NodeId::new("ghost")));
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_no_audit_row() {
        let store = store_with("n1", NodeStatus::Active).await;
        let machine = NodeStateMachine::new(store.clone());

        let err = machine
            .transition(&NodeId::new("n1"), NodeStatus::Returning, "test", "test")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NodeError::InvalidTransition {
                from: NodeStatus::Active,
                to: NodeStatus::Returning,
                ..
            }
        ));
        assert!(machine.history(&NodeId::new("n1")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_writes_audit_row() {
        let store = store_with("n1", NodeStatus::Active).await;
        let machine = NodeStateMachine::new(store.clone());

        let record = machine
            .transition(&NodeId::new("n1"), NodeStatus::Draining, "drain_requested", "admin")
            .await
            .unwrap();
        assert_eq!(record.from_status, NodeStatus::Active);
        assert_eq!(record.to_status, NodeStatus::Draining);

        let history = machine.history(&NodeId::new("n1")).await.unwrap();
        assert_eq!(history, vec![record]);
        let node = store.get(&NodeId::new("n1")).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Draining);
    }

    /// Holds every `get` until two readers have arrived, so both callers
    /// observe the same status before either writes.
    struct LockstepRepo {
        inner: Arc<MemoryStore>,
        barrier: Barrier,
    }

    #[async_trait]
    impl NodeRepository for LockstepRepo {
        async fn get(&self, id: &NodeId) -> Result<Option<Node>, RepoError> {
            let node = self.inner.get(id).await;
            self.barrier.wait().await;
            node
        }
        async fn list(&self) -> Result<Vec<Node>, RepoError> {
            self.inner.list().await
        }
        async fn insert(&self, node: Node) -> Result<(), RepoError> {
            self.inner.insert(node).await
        }
        async fn record_registration(
            &self,
            registration: &NodeRegistration,
            at: u64,
        ) -> Result<(), RepoError> {
            self.inner.record_registration(registration, at).await
        }
        async fn update_heartbeat(
            &self,
            id: &NodeId,
            update: HeartbeatUpdate,
        ) -> Result<(), RepoError> {
            self.inner.update_heartbeat(id, update).await
        }
        async fn transition(
            &self,
            id: &NodeId,
            expected: NodeStatus,
            record: NodeTransition,
        ) -> Result<(), RepoError> {
            self.inner.transition(id, expected, record).await
        }
        async fn transitions(&self, id: &NodeId) -> Result<Vec<NodeTransition>, RepoError> {
            self.inner.transitions(id).await
        }
        async fn find_best_for_recovery(
            &self,
            exclude: &NodeId,
        ) -> Result<Option<Node>, RepoError> {
            self.inner.find_best_for_recovery(exclude).await
        }
        async fn update_provisioning(
            &self,
            id: &NodeId,
            update: ProvisioningUpdate,
        ) -> Result<(), RepoError> {
            self.inner.update_provisioning(id, update).await
        }
        async fn update_drain(
            &self,
            id: &NodeId,
            progress: DrainProgress,
        ) -> Result<(), RepoError> {
            self.inner.update_drain(id, progress).await
        }
        async fn delete(&self, id: &NodeId) -> Result<(), RepoError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_transitions_exactly_one_wins() {
        let store = store_with("n1", NodeStatus::Active).await;
        let machine = Arc::new(NodeStateMachine::new(Arc::new(LockstepRepo {
            inner: store.clone(),
            barrier: Barrier::new(2),
        })));

        let a = {
            let machine = machine.clone();
            tokio::spawn(async move {
                machine
                    .transition(&NodeId::new("n1"), NodeStatus::Unhealthy, "heartbeat_timeout", "a")
                    .await
            })
        };
        let b = {
            let machine = machine.clone();
            tokio::spawn(async move {
                machine
                    .transition(&NodeId::new("n1"), NodeStatus::Draining, "drain_requested", "b")
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let won = results.iter().filter(|r| r.is_ok()).count();
        let lost: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();

        assert_eq!(won, 1);
        assert_eq!(lost.len(), 1);
        assert!(matches!(
            lost[0],
            NodeError::ConcurrentTransition {
                expected: NodeStatus::Active,
                ..
            }
        ));
        assert_eq!(store.transitions(&NodeId::new("n1")).await.unwrap().len(), 1);
    }
}
