//! Tenant migration, recovery and drain
//!
//! A migration moves one bot between nodes as a fixed sequence of agent
//! commands:
//!
//! 1. export the source container to an archive
//! 2. upload the archive to durable storage
//! 3. download the archive onto the target (pre-stage)
//! 4. stop the source container
//! 5. import and start on the target
//! 6. inspect the target container
//! 7. reassign the bot to the target
//!
//! Steps 1-3 run while the source is still serving, so failing there is a
//! clean abort. Step 4 is the point of no return: any failure from there
//! until the reassignment lands triggers a best-effort restart of the
//! source, and the caller still gets the original failure. Downtime is
//! measured from the start of step 4 to the end of step 7.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;

use bf_core::config::MigrationConfig;
use bf_core::error::{ChannelError, NodeError, RepoError};
use bf_core::time::as_millis;
use bf_core::traits::{BotInstanceRepository, NodeRepository};
use bf_core::types::{BotId, BotInstance, DrainProgress, DrainStatus, NodeId, NodeStatus};
use bf_protocol::{
    ArchivePayload, BackupDownloadPayload, BackupUploadPayload, Command, ImportPayload,
};

use crate::channel::CommandChannel;
use crate::node::NodeStateMachine;

const TRIGGERED_BY: &str = "migration_orchestrator";

/// Migration steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStep {
    Export,
    Upload,
    PreStage,
    StopSource,
    Import,
    Start,
    Verify,
    Commit,
}

/// Reasons a migration cannot start
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Bot instance not found: {0}")]
    BotNotFound(BotId),

    #[error("Bot instance {0} is not assigned to a node")]
    Unassigned(BotId),

    #[error("No other active node available for bot {0}")]
    NoTarget(BotId),

    #[error("Target node {0} is the bot's current node")]
    SameNode(NodeId),

    #[error("Target node not found: {0}")]
    TargetNotFound(NodeId),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),
}

/// Outcome of a migration that got past its preconditions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub bot_id: BotId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    /// Time the tenant was down; only set on success
    pub downtime_ms: Option<u64>,
    pub failed_step: Option<MigrationStep>,
    pub error: Option<String>,
    /// Whether the source was restarted after a failure past the point of
    /// no return; `None` if no restart was needed
    pub source_restarted: Option<bool>,
}

/// A bot restored onto another node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredBot {
    pub bot_id: BotId,
    pub target_node_id: NodeId,
}

/// A bot that could not be moved
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotFailure {
    pub bot_id: BotId,
    pub error: String,
}

/// Outcome of restoring an offline node's bots elsewhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub node_id: NodeId,
    pub recovered: Vec<RecoveredBot>,
    pub failed: Vec<BotFailure>,
}

/// Outcome of draining a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub node_id: NodeId,
    pub total: u32,
    pub migrated: u32,
    pub failed: Vec<BotFailure>,
    /// Whether every bot moved and the node went offline
    pub drained: bool,
}

#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Repository(#[from] RepoError),

    #[error("container {0} is not running")]
    NotRunning(String),
}

/// Runs migrations, offline recovery and drains
pub struct MigrationOrchestrator {
    channel: Arc<CommandChannel>,
    nodes: Arc<dyn NodeRepository>,
    bots: Arc<dyn BotInstanceRepository>,
    state_machine: Arc<NodeStateMachine>,
    config: MigrationConfig,
}

impl MigrationOrchestrator {
    pub fn new(
        channel: Arc<CommandChannel>,
        nodes: Arc<dyn NodeRepository>,
        bots: Arc<dyn BotInstanceRepository>,
        state_machine: Arc<NodeStateMachine>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            channel,
            nodes,
            bots,
            state_machine,
            config,
        }
    }

    /// Move a bot to `target`, or to the active node with the most free
    /// capacity when no target is given.
    ///
    /// Must not be called again for the same bot while a migration for it
    /// is running.
    #[instrument(skip_all, fields(bot_id = %bot_id))]
    pub async fn migrate(
        &self,
        bot_id: &BotId,
        target: Option<&NodeId>,
    ) -> Result<MigrationResult, MigrationError> {
        let bot = self
            .bots
            .get_by_id(bot_id)
            .await?
            .ok_or_else(|| MigrationError::BotNotFound(bot_id.clone()))?;
        let source = bot
            .node_id
            .clone()
            .ok_or_else(|| MigrationError::Unassigned(bot_id.clone()))?;
        let target = self.resolve_target(&bot, &source, target).await?;

        tracing::info!(source = %source, target_node = %target, "Starting migration");
        Ok(self.run(&bot, source, target).await)
    }

    async fn resolve_target(
        &self,
        bot: &BotInstance,
        source: &NodeId,
        requested: Option<&NodeId>,
    ) -> Result<NodeId, MigrationError> {
        let target = match requested {
            Some(id) => self
                .nodes
                .get(id)
                .await?
                .map(|node| node.id)
                .ok_or_else(|| MigrationError::TargetNotFound(id.clone()))?,
            None => self
                .nodes
                .find_best_for_recovery(source)
                .await?
                .map(|node| node.id)
                .ok_or_else(|| MigrationError::NoTarget(bot.id.clone()))?,
        };

        if &target == source {
            return Err(MigrationError::SameNode(target));
        }
        Ok(target)
    }

    async fn run(&self, bot: &BotInstance, source: NodeId, target: NodeId) -> MigrationResult {
        let migration_id = uuid::Uuid::new_v4().to_string();
        let container = bot.container_name();
        let archive_path = self.archive_path(&bot.id);
        let storage_key = format!(
            "{}/{}/{}.tar.gz",
            self.config.storage_prefix, bot.id, migration_id
        );

        let mut result = MigrationResult {
            success: false,
            bot_id: bot.id.clone(),
            source_node_id: source.clone(),
            target_node_id: target.clone(),
            downtime_ms: None,
            failed_step: None,
            error: None,
            source_restarted: None,
        };

        let prepared = self
            .prepare(&source, &target, &container, &archive_path, &storage_key)
            .await;
        if let Err((step, e)) = prepared {
            tracing::warn!(?step, error = %e, "Migration aborted before cutover");
            result.failed_step = Some(step);
            result.error = Some(e.to_string());
            return result;
        }

        let stopped_at = Instant::now();
        let cutover = self
            .cutover(bot, &source, &target, &container, &archive_path)
            .await;
        match cutover {
            Ok(()) => {
                let downtime_ms = as_millis(stopped_at.elapsed());
                tracing::info!(downtime_ms, "Migration complete");
                result.success = true;
                result.downtime_ms = Some(downtime_ms);

                if let Err(e) = self.channel.send(&source, Command::remove(&container)).await {
                    tracing::warn!(source = %source, error = %e, "Failed to remove source container");
                }
            }
            Err((step, e)) => {
                tracing::error!(?step, error = %e, "Migration failed after stopping source");
                if step == MigrationStep::Commit {
                    if let Err(stop) = self.channel.send(&target, Command::stop(&container)).await {
                        tracing::warn!(target_node = %target, error = %stop, "Failed to stop target copy");
                    }
                }
                result.source_restarted = Some(self.restart_source(&source, &container).await);
                result.failed_step = Some(step);
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Steps 1-3; the source keeps serving throughout
    async fn prepare(
        &self,
        source: &NodeId,
        target: &NodeId,
        container: &str,
        archive_path: &str,
        storage_key: &str,
    ) -> Result<(), (MigrationStep, StepError)> {
        self.command(
            source,
            Command::Export(ArchivePayload {
                container: container.to_string(),
                archive_path: archive_path.to_string(),
            }),
        )
        .await
        .map_err(|e| (MigrationStep::Export, e))?;

        self.command(
            source,
            Command::BackupUpload(BackupUploadPayload {
                archive_path: archive_path.to_string(),
                storage_key: storage_key.to_string(),
            }),
        )
        .await
        .map_err(|e| (MigrationStep::Upload, e))?;

        self.command(
            target,
            Command::BackupDownload(BackupDownloadPayload {
                storage_key: storage_key.to_string(),
                archive_path: archive_path.to_string(),
            }),
        )
        .await
        .map_err(|e| (MigrationStep::PreStage, e))?;

        Ok(())
    }

    /// Steps 4-7; the tenant is down from the first command until the
    /// reassignment lands
    async fn cutover(
        &self,
        bot: &BotInstance,
        source: &NodeId,
        target: &NodeId,
        container: &str,
        archive_path: &str,
    ) -> Result<(), (MigrationStep, StepError)> {
        self.command(source, Command::stop(container))
            .await
            .map_err(|e| (MigrationStep::StopSource, e))?;

        self.start_from_archive(target, container, archive_path)
            .await?;

        self.bots
            .reassign(&bot.id, target)
            .await
            .map_err(|e| (MigrationStep::Commit, e.into()))
    }

    /// Import, start and verify a container on `node_id`
    async fn start_from_archive(
        &self,
        node_id: &NodeId,
        container: &str,
        archive_path: &str,
    ) -> Result<(), (MigrationStep, StepError)> {
        self.command(
            node_id,
            Command::Import(ImportPayload {
                container: container.to_string(),
                archive_path: archive_path.to_string(),
                memory_mb: None,
            }),
        )
        .await
        .map_err(|e| (MigrationStep::Import, e))?;

        self.command(node_id, Command::start(container))
            .await
            .map_err(|e| (MigrationStep::Start, e))?;

        self.verify_running(node_id, container)
            .await
            .map_err(|e| (MigrationStep::Verify, e))
    }

    async fn command(&self, node_id: &NodeId, command: Command) -> Result<Option<Value>, StepError> {
        Ok(self.channel.send(node_id, command).await?)
    }

    async fn verify_running(&self, node_id: &NodeId, container: &str) -> Result<(), StepError> {
        let data = self.command(node_id, Command::inspect(container)).await?;
        let running = data
            .as_ref()
            .and_then(|d| d.get("running"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if running {
            Ok(())
        } else {
            Err(StepError::NotRunning(container.to_string()))
        }
    }

    /// Best-effort restart of the source; the outcome is only logged
    async fn restart_source(&self, source: &NodeId, container: &str) -> bool {
        match self.channel.send(source, Command::start(container)).await {
            Ok(_) => {
                tracing::info!(source = %source, container, "Restarted source container");
                true
            }
            Err(e) => {
                tracing::error!(
                    source = %source,
                    container,
                    error = %e,
                    "Failed to restart source container"
                );
                false
            }
        }
    }

    fn archive_path(&self, bot_id: &BotId) -> String {
        self.config
            .archive_dir
            .join(format!("{}.tar.gz", bot_id))
            .to_string_lossy()
            .into_owned()
    }

    /// Restore an offline node's bots onto healthy nodes from their latest
    /// backups, then return the node to `offline`.
    #[instrument(skip_all, fields(node_id = %node_id))]
    pub async fn recover_node(&self, node_id: &NodeId) -> Result<RecoveryReport, NodeError> {
        self.state_machine
            .transition(node_id, NodeStatus::Recovering, "recovery_started", TRIGGERED_BY)
            .await?;

        let bots = self.bots.list_by_node(node_id).await?;
        let mut report = RecoveryReport {
            node_id: node_id.clone(),
            recovered: Vec::new(),
            failed: Vec::new(),
        };

        for bot in bots {
            match self.restore_elsewhere(&bot, node_id).await {
                Ok(target) => {
                    tracing::info!(bot_id = %bot.id, target_node = %target, "Recovered bot");
                    report.recovered.push(RecoveredBot {
                        bot_id: bot.id,
                        target_node_id: target,
                    });
                }
                Err(error) => {
                    tracing::warn!(bot_id = %bot.id, %error, "Failed to recover bot");
                    report.failed.push(BotFailure {
                        bot_id: bot.id,
                        error,
                    });
                }
            }
        }

        match self
            .state_machine
            .transition(node_id, NodeStatus::Offline, "recovery_complete", TRIGGERED_BY)
            .await
        {
            Ok(_) => {}
            Err(NodeError::InvalidTransition { from, .. }) => {
                tracing::info!(status = %from, "Node changed state during recovery");
            }
            Err(NodeError::ConcurrentTransition { actual, .. }) => {
                tracing::info!(status = %actual, "Node changed state during recovery");
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    async fn restore_elsewhere(&self, bot: &BotInstance, source: &NodeId) -> Result<NodeId, String> {
        let target = self
            .nodes
            .find_best_for_recovery(source)
            .await
            .map_err(|e| e.to_string())?
            .map(|node| node.id)
            .ok_or_else(|| MigrationError::NoTarget(bot.id.clone()).to_string())?;

        let container = bot.container_name();
        let archive_path = self.archive_path(&bot.id);
        let storage_key = format!("{}/{}/latest.tar.gz", self.config.storage_prefix, bot.id);

        self.command(
            &target,
            Command::BackupDownload(BackupDownloadPayload {
                storage_key,
                archive_path: archive_path.clone(),
            }),
        )
        .await
        .map_err(|e| e.to_string())?;

        self.start_from_archive(&target, &container, &archive_path)
            .await
            .map_err(|(_, e)| e.to_string())?;

        self.bots
            .reassign(&bot.id, &target)
            .await
            .map_err(|e| e.to_string())?;

        Ok(target)
    }

    /// Migrate every bot off an active node. When all succeed the node is
    /// marked drained and goes `offline`; otherwise it stays `draining`
    /// with the drain marked failed.
    #[instrument(skip_all, fields(node_id = %node_id))]
    pub async fn drain_node(&self, node_id: &NodeId) -> Result<DrainReport, NodeError> {
        self.state_machine
            .transition(node_id, NodeStatus::Draining, "drain_requested", TRIGGERED_BY)
            .await?;

        let bots = self.bots.list_by_node(node_id).await?;
        let total = bots.len() as u32;
        let mut migrated = 0;
        let mut failed = Vec::new();

        self.nodes
            .update_drain(
                node_id,
                DrainProgress {
                    status: DrainStatus::InProgress,
                    migrated,
                    total,
                },
            )
            .await?;

        for bot in bots {
            let error = match self.migrate(&bot.id, None).await {
                Ok(result) if result.success => None,
                Ok(result) => result.error,
                Err(e) => Some(e.to_string()),
            };

            match error {
                None => {
                    migrated += 1;
                    self.nodes
                        .update_drain(
                            node_id,
                            DrainProgress {
                                status: DrainStatus::InProgress,
                                migrated,
                                total,
                            },
                        )
                        .await?;
                }
                Some(error) => failed.push(BotFailure {
                    bot_id: bot.id,
                    error,
                }),
            }
        }

        let drained = failed.is_empty();
        let status = if drained {
            DrainStatus::Drained
        } else {
            DrainStatus::Failed
        };
        self.nodes
            .update_drain(
                node_id,
                DrainProgress {
                    status,
                    migrated,
                    total,
                },
            )
            .await?;

        if drained {
            self.state_machine
                .transition(node_id, NodeStatus::Offline, "drain_complete", TRIGGERED_BY)
                .await?;
        }

        tracing::info!(migrated, total, drained, "Drain finished");
        Ok(DrainReport {
            node_id: node_id.clone(),
            total,
            migrated,
            failed,
            drained,
        })
    }
}
