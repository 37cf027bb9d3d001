//! In-process fakes shared by the unit tests

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use bf_core::error::{CloudError, RuntimeError};
use bf_core::traits::{
    CloudProvider, ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary,
    HealthStatus, Instance, InstanceSpec, InstanceStatus, Region, Size,
};
use bf_core::traits::{BotInstanceRepository, NodeRepository};
use bf_core::types::{
    BillingState, BotId, BotInstance, Capacity, Node, NodeId, NodeStatus, TenantId,
};
use bf_protocol::{AgentMessage, Command, CommandResult, CommandType, OutboundFrame};

use crate::channel::{CommandChannel, TunnelTransport};
use crate::metrics::FleetMetrics;
use crate::store::MemoryStore;

/// Store, metrics and channel wired together
pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<FleetMetrics>,
    pub channel: Arc<CommandChannel>,
    pub log: CommandLog,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(FleetMetrics::new());
        let channel = Arc::new(CommandChannel::new(store.clone(), metrics.clone()));
        Self {
            store,
            metrics,
            channel,
            log: CommandLog::default(),
        }
    }

    pub async fn add_node(&self, id: &str, status: NodeStatus) {
        let mut node = Node::new(NodeId::new(id), format!("{}.internal", id), Capacity::Limited(8192), 0);
        node.status = status;
        self.store.insert(node).await.unwrap();
    }

    pub async fn add_bot(&self, id: &str, tenant: &str, node: Option<&str>) {
        self.store
            .create(BotInstance {
                id: BotId::new(id),
                tenant_id: TenantId::new(tenant),
                name: format!("{} bot", tenant),
                node_id: node.map(NodeId::new),
                billing_state: BillingState::Active,
            })
            .await
            .unwrap();
    }

    pub async fn status(&self, id: &str) -> NodeStatus {
        self.store.get(&NodeId::new(id)).await.unwrap().unwrap().status
    }

    /// Connect a fake agent for `node_id` answering with `respond`
    pub fn agent<F>(&self, node_id: &str, respond: F) -> Arc<TunnelTransport>
    where
        F: Fn(&Command) -> AgentReply + Send + 'static,
    {
        spawn_agent(&self.channel, node_id, &self.log, respond)
    }
}

/// How a fake agent answers a command
pub(crate) enum AgentReply {
    Ok(Option<Value>),
    Fail(String),
    /// Never answer
    Silent,
}

impl AgentReply {
    pub fn ok() -> Self {
        AgentReply::Ok(None)
    }

    pub fn fail(message: &str) -> Self {
        AgentReply::Fail(message.to_string())
    }
}

/// Every command delivered to a fake agent, in order
#[derive(Clone, Default)]
pub(crate) struct CommandLog(Arc<Mutex<Vec<(NodeId, Command)>>>);

impl CommandLog {
    fn record(&self, node_id: &NodeId, command: &Command) {
        self.0.lock().unwrap().push((node_id.clone(), command.clone()));
    }

    pub fn entries(&self) -> Vec<(NodeId, Command)> {
        self.0.lock().unwrap().clone()
    }

    /// `(node, command type)` pairs in delivery order
    pub fn sequence(&self) -> Vec<(String, CommandType)> {
        self.entries()
            .into_iter()
            .map(|(node, command)| (node.to_string(), command.command_type()))
            .collect()
    }

    pub fn sent_to(&self, node_id: &str) -> Vec<Command> {
        self.entries()
            .into_iter()
            .filter(|(node, _)| node.as_str() == node_id)
            .map(|(_, command)| command)
            .collect()
    }
}

/// Register a transport for `node_id` and answer its commands in a task
pub(crate) fn spawn_agent<F>(
    channel: &Arc<CommandChannel>,
    node_id: &str,
    log: &CommandLog,
    respond: F,
) -> Arc<TunnelTransport>
where
    F: Fn(&Command) -> AgentReply + Send + 'static,
{
    let node_id = NodeId::new(node_id);
    let (transport, mut frame_rx) = TunnelTransport::new(64);
    let transport = Arc::new(transport);
    channel.accept(&node_id, transport.clone());

    let channel = Arc::clone(channel);
    let log = log.clone();
    tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let OutboundFrame::Command(envelope) = frame else {
                continue;
            };
            log.record(&node_id, &envelope.command);

            let result = match respond(&envelope.command) {
                AgentReply::Ok(data) => CommandResult::ok(envelope.id, data),
                AgentReply::Fail(message) => CommandResult::failed(envelope.id, message),
                AgentReply::Silent => continue,
            };
            channel
                .handle_message(&node_id, AgentMessage::CommandResult(result))
                .await;
        }
    });

    transport
}

/// Scripted cloud provider
#[derive(Default)]
pub(crate) struct FakeCloud {
    /// Instance returned by `create`
    pub created: Mutex<Option<Instance>>,
    /// Answers to `get`; the last one repeats
    pub polls: Mutex<VecDeque<Instance>>,
    pub create_error: Mutex<Option<CloudError>>,
    pub created_specs: Mutex<Vec<InstanceSpec>>,
    pub deleted: Mutex<Vec<String>>,
    pub regions: Vec<Region>,
    pub sizes: Vec<Size>,
}

impl FakeCloud {
    pub fn instance(id: &str, status: InstanceStatus, ips: &[&str]) -> Instance {
        Instance {
            id: id.to_string(),
            status,
            public_ipv4: ips.iter().map(|ip| ip.to_string()).collect(),
        }
    }

    pub fn size(slug: &str, gpu: bool, price_monthly: f64) -> Size {
        Size {
            slug: slug.to_string(),
            memory_mb: 8192,
            vcpus: 4,
            price_monthly,
            available: true,
            regions: vec!["nyc3".to_string(), "tor1".to_string()],
            gpu,
        }
    }

    pub fn region(slug: &str, sizes: &[&str]) -> Region {
        Region {
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            available: true,
            sizes: sizes.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_polls(self, instances: Vec<Instance>) -> Self {
        if let Some(first) = instances.first() {
            *self.created.lock().unwrap() = Some(Self::instance(&first.id, InstanceStatus::New, &[]));
        }
        *self.polls.lock().unwrap() = instances.into();
        self
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create(&self, spec: &InstanceSpec) -> Result<Instance, CloudError> {
        self.created_specs.lock().unwrap().push(spec.clone());
        if let Some(error) = self.create_error.lock().unwrap().take() {
            return Err(error);
        }
        self.created
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CloudError::Api {
                status: 500,
                message: "no instance scripted".to_string(),
            })
    }

    async fn get(&self, id: &str) -> Result<Instance, CloudError> {
        let mut polls = self.polls.lock().unwrap();
        let instance = if polls.len() > 1 {
            polls.pop_front()
        } else {
            polls.front().cloned()
        };
        instance.ok_or_else(|| CloudError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<(), CloudError> {
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list_regions(&self) -> Result<Vec<Region>, CloudError> {
        Ok(self.regions.clone())
    }

    async fn list_sizes(&self) -> Result<Vec<Size>, CloudError> {
        Ok(self.sizes.clone())
    }
}

#[derive(Default)]
struct RuntimeState {
    next_id: u32,
    containers: BTreeMap<String, ContainerDetails>,
    /// Health answers per image; the last one repeats
    health: HashMap<String, VecDeque<Option<HealthStatus>>>,
    calls: Vec<String>,
}

/// In-memory container runtime
#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<RuntimeState>,
    pub fail_pull: Mutex<HashSet<String>>,
    pub fail_create: Mutex<HashSet<String>>,
    pub fail_start: Mutex<HashSet<String>>,
    pub fail_remove: Mutex<HashSet<String>>,
    /// Images whose containers exit right after a successful start
    pub exit_on_start: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    /// Digest the fake assigns to an image reference
    pub fn digest(image: &str) -> String {
        format!("sha256:{}", image)
    }

    /// Add an existing container, returning its ID
    pub fn seed(&self, spec: ContainerSpec, running: bool) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.containers.insert(
            id.clone(),
            ContainerDetails {
                id: id.clone(),
                image_id: Self::digest(&spec.image),
                running,
                health: None,
                spec,
            },
        );
        id
    }

    /// Script the health answers for containers running `image`
    pub fn script_health(&self, image: &str, answers: Vec<Option<HealthStatus>>) {
        self.state
            .lock()
            .unwrap()
            .health
            .insert(image.to_string(), answers.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn containers(&self) -> Vec<ContainerDetails> {
        self.state.lock().unwrap().containers.values().cloned().collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|c| c.spec.labels.get(key).map(String::as_str) == Some(value))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                image: c.spec.image.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let image = state
            .containers
            .get(id)
            .map(|c| c.spec.image.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        let health = match state.health.get_mut(&image) {
            Some(answers) if answers.len() > 1 => answers.pop_front().flatten(),
            Some(answers) => answers.front().copied().flatten(),
            None => None,
        };

        let mut details = state
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        details.health = health;
        Ok(details)
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop {}", id));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove {}", id));
        let image = state
            .containers
            .get(id)
            .map(|c| c.spec.image.clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if self.fail_remove.lock().unwrap().contains(&image) {
            return Err(RuntimeError::Api(format!("cannot remove {}", id)));
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start {}", id));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if self.fail_start.lock().unwrap().contains(&container.spec.image) {
            return Err(RuntimeError::Api(format!("cannot start {}", container.spec.image)));
        }
        container.running = !self.exit_on_start.lock().unwrap().contains(&container.spec.image);
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().calls.push(format!("pull {}", image));
        if self.fail_pull.lock().unwrap().contains(image) {
            return Err(RuntimeError::NotFound(image.to_string()));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("create {}", spec.image));
        }
        if self.fail_create.lock().unwrap().contains(&spec.image) {
            return Err(RuntimeError::Api(format!("cannot create from {}", spec.image)));
        }
        Ok(self.seed(spec.clone(), false))
    }
}
