//! GPFS family: lost mounts and a stopped daemon.

use super::episode::{cleanup_node, Episode};
use super::{Policy, PolicyCore};
use crate::actions::{labels, ActionContext, RemedyAction};
use crate::bridge::ApiBridge;
use crate::error::Result;
use crate::escalation::restart_node;
use crate::observation::{condition, FaultObservation};
use crate::tickets::WorkflowAction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

const FAMILY: &str = "gpfs";

const CONDITIONS: &[&str] = &[condition::GPFS_MOUNT_LOST, condition::GPFS_DOWN];

pub struct GpfsPolicy {
    core: PolicyCore,
}

impl Default for GpfsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl GpfsPolicy {
    pub const fn new() -> Self {
        Self {
            core: PolicyCore::new("gpfs"),
        }
    }

    fn remedy_for(status: &FaultObservation) -> RemedyAction {
        if status.condition == condition::GPFS_DOWN {
            RemedyAction::RestartGpfs
        } else {
            RemedyAction::RemountGpfs
        }
    }
}

#[async_trait]
impl Policy for GpfsPolicy {
    fn name(&self) -> &'static str {
        "gpfs"
    }

    fn conditions(&self) -> &'static [&'static str] {
        CONDITIONS
    }

    fn create_instance(&self, bridge: Arc<ApiBridge>) -> Result<()> {
        self.core.install(bridge)
    }

    async fn evaluate(&self, _node: &str, _status: &FaultObservation) -> bool {
        self.core.is_initialized()
    }

    #[instrument(skip(self, ctx, status), fields(condition = %status.condition))]
    async fn execute(
        &self,
        ctx: &ActionContext,
        node: &str,
        status: &FaultObservation,
    ) -> Result<()> {
        let bridge = self.core.bridge()?;
        let Some(episode) = Episode::open(bridge, ctx, FAMILY, status).await? else {
            return Ok(());
        };
        bridge
            .actions()
            .set_fault_label(node, labels::GPFS_UNAVAILABLE)
            .await?;

        let remedies = episode.successes(WorkflowAction::Remedy).await?;
        if remedies >= bridge.config.thresholds.max_remedies {
            info!(ticket = %episode.key(), remedies, "GPFS remedies exhausted, restarting node");
            let result = restart_node(bridge, ctx, episode.key(), FAMILY, None).await;
            return episode.escalated(result).await;
        }

        let action = Self::remedy_for(status);
        let filesystem = status.id.clone().unwrap_or_default();
        episode
            .attempt(
                WorkflowAction::Remedy,
                bridge
                    .actions()
                    .remedy(ctx, node, action, FAMILY, &filesystem),
            )
            .await?;
        Ok(())
    }

    async fn cleanup(
        &self,
        _ctx: &ActionContext,
        node: &str,
        _status: &FaultObservation,
    ) -> Result<()> {
        let bridge = self.core.bridge()?;
        cleanup_node(bridge, node, FAMILY, &[labels::GPFS_UNAVAILABLE], None).await
    }
}
