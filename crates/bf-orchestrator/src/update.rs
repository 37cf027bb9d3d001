//! Rolling image updates
//!
//! Replaces a bot's container with one running a new image and only keeps
//! the result if it comes up healthy. Once the old container has been
//! removed any failure rolls back to the image digest it was running; a
//! rollback that itself fails is reported as [`UpdateError::RollbackFailed`]
//! because the bot is then down with no automatic way back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;

use bf_core::config::UpdateConfig;
use bf_core::error::RuntimeError;
use bf_core::traits::{ContainerRuntime, ContainerSpec, HealthStatus, BOT_LABEL};
use bf_core::types::BotId;

/// Escalated update failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// The bot has no container to update
    #[error("No container found for bot {0}")]
    ContainerNotFound(BotId),

    /// The update failed and so did restoring the previous image; the bot
    /// needs manual intervention
    #[error("Rollback failed for bot {bot_id}: {rollback} (update failed with: {original})")]
    RollbackFailed {
        bot_id: BotId,
        original: String,
        rollback: String,
    },
}

/// Outcome of an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub success: bool,
    pub bot_id: BotId,
    /// Image digest the bot was running before the update
    pub previous_image: Option<String>,
    pub new_image: String,
    /// Container now serving the bot
    pub container_id: Option<String>,
    pub rolled_back: bool,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
enum Failure {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("container reported unhealthy")]
    Unhealthy,

    #[error("container not healthy after {0:?}")]
    HealthTimeout(Duration),

    #[error("container stopped while starting")]
    Exited,
}

/// What the old container looked like before it was removed
struct Previous {
    image_id: String,
    was_running: bool,
    spec: ContainerSpec,
}

/// Health-gated image updates against a container runtime
pub struct RollingUpdater {
    runtime: Arc<dyn ContainerRuntime>,
    config: UpdateConfig,
}

impl RollingUpdater {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: UpdateConfig) -> Self {
        Self { runtime, config }
    }

    /// Update `bot_id` to `image`.
    ///
    /// Ordinary failures come back as `Ok` with `success == false`;
    /// `Err` means either there was nothing to update or the bot could not
    /// be restored.
    #[instrument(skip_all, fields(bot_id = %bot_id, image = %image))]
    pub async fn update(&self, bot_id: &BotId, image: &str) -> Result<UpdateResult, UpdateError> {
        let mut result = UpdateResult {
            success: false,
            bot_id: bot_id.clone(),
            previous_image: None,
            new_image: image.to_string(),
            container_id: None,
            rolled_back: false,
            error: None,
        };

        if let Err(e) = self.runtime.pull(image).await {
            tracing::warn!(error = %e, "Failed to pull image");
            result.error = Some(e.to_string());
            return Ok(result);
        }

        let existing = match self.runtime.list_by_label(BOT_LABEL, bot_id.as_str()).await {
            Ok(containers) => containers.into_iter().next(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list bot containers");
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };
        let existing = existing.ok_or_else(|| UpdateError::ContainerNotFound(bot_id.clone()))?;
        result.container_id = Some(existing.id.clone());

        let previous = match self.retire(&existing.id).await {
            Ok(previous) => previous,
            Err((previous, e)) => {
                // Old container still present; nothing to roll back
                tracing::warn!(error = %e, "Update failed before removing old container");
                result.previous_image = previous.map(|p| p.image_id);
                result.error = Some(e.to_string());
                return Ok(result);
            }
        };
        result.previous_image = Some(previous.image_id.clone());

        let mut new_id = None;
        let outcome = self.replace(&previous, image, &mut new_id).await;
        match outcome {
            Ok(()) => {
                tracing::info!(container_id = ?new_id, "Update complete");
                result.success = true;
                result.container_id = new_id;
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Update failed, rolling back");
                let original = e.to_string();

                match self.rollback(&previous, new_id.as_deref()).await {
                    Ok(restored_id) => {
                        tracing::info!(container_id = %restored_id, "Rolled back to previous image");
                        result.rolled_back = true;
                        result.container_id = Some(restored_id);
                        result.error = Some(original);
                        Ok(result)
                    }
                    Err(rollback) => {
                        tracing::error!(
                            error = %original,
                            rollback_error = %rollback,
                            "Rollback failed; bot needs manual intervention"
                        );
                        Err(UpdateError::RollbackFailed {
                            bot_id: bot_id.clone(),
                            original,
                            rollback: rollback.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Record the old container's state, then stop and remove it.
    ///
    /// On failure the old container may still exist, so no rollback is
    /// needed.
    async fn retire(&self, id: &str) -> Result<Previous, (Option<Previous>, RuntimeError)> {
        let details = self.runtime.inspect(id).await.map_err(|e| (None, e))?;
        let previous = Previous {
            image_id: details.image_id,
            was_running: details.running,
            spec: details.spec,
        };

        if previous.was_running {
            if let Err(e) = self.runtime.stop(id).await {
                return Err((Some(previous), e));
            }
        }
        if let Err(e) = self.runtime.remove(id).await {
            if previous.was_running {
                if let Err(restart) = self.runtime.start(id).await {
                    tracing::error!(error = %restart, "Failed to restart old container");
                }
            }
            return Err((Some(previous), e));
        }
        Ok(previous)
    }

    /// Create the new container and wait for it to become healthy
    async fn replace(
        &self,
        previous: &Previous,
        image: &str,
        new_id: &mut Option<String>,
    ) -> Result<(), Failure> {
        let spec = ContainerSpec {
            image: image.to_string(),
            ..previous.spec.clone()
        };
        let id = self.runtime.create(&spec).await?;
        *new_id = Some(id.clone());

        if !previous.was_running {
            tracing::debug!("Previous container was stopped; leaving new one stopped");
            return Ok(());
        }

        self.runtime.start(&id).await?;
        self.wait_healthy(&id).await
    }

    /// Poll until healthy, failing fast on an unhealthy report
    async fn wait_healthy(&self, id: &str) -> Result<(), Failure> {
        let deadline = Instant::now() + self.config.health_timeout;

        loop {
            let details = self.runtime.inspect(id).await?;
            match (details.health, details.running) {
                (Some(HealthStatus::Unhealthy), _) => return Err(Failure::Unhealthy),
                (Some(HealthStatus::Healthy), true) | (None, true) => return Ok(()),
                (None, false) => return Err(Failure::Exited),
                (Some(HealthStatus::Healthy), false) | (Some(HealthStatus::Starting), _) => {}
            }

            if Instant::now() + self.config.health_interval > deadline {
                return Err(Failure::HealthTimeout(self.config.health_timeout));
            }
            tokio::time::sleep(self.config.health_interval).await;
        }
    }

    /// Discard the new container and recreate the previous image
    async fn rollback(
        &self,
        previous: &Previous,
        new_id: Option<&str>,
    ) -> Result<String, RuntimeError> {
        if let Some(new_id) = new_id {
            if let Err(e) = self.runtime.stop(new_id).await {
                tracing::debug!(error = %e, "Stopping failed container");
            }
            if let Err(e) = self.runtime.remove(new_id).await {
                tracing::warn!(error = %e, "Failed to remove failed container");
            }
        }

        let spec = ContainerSpec {
            image: previous.image_id.clone(),
            ..previous.spec.clone()
        };
        let id = self.runtime.create(&spec).await?;
        if previous.was_running {
            self.runtime.start(&id).await?;
        }
        Ok(id)
    }
}
