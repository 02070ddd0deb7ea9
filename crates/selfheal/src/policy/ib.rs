//! InfiniBand family.

use super::episode::{cleanup_node, Episode};
use super::{Policy, PolicyCore};
use crate::actions::{labels, ActionContext, RemedyAction};
use crate::bridge::ApiBridge;
use crate::error::Result;
use crate::observation::{condition, FaultObservation, HardwareType};
use crate::tickets::WorkflowAction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

const FAMILY: &str = "ib";

const CONDITIONS: &[&str] = &[
    condition::IB_LINK_DOWN,
    condition::IB_PORT_FLAPPING,
    condition::IB_DEGRADED,
];

pub struct IbPolicy {
    core: PolicyCore,
}

impl Default for IbPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl IbPolicy {
    pub const fn new() -> Self {
        Self {
            core: PolicyCore::new("ib"),
        }
    }

    /// Many nodes losing IB together points at the fabric, not the node
    async fn is_storm(&self, bridge: &ApiBridge, status: &FaultObservation) -> bool {
        let query = format!("condition={}", status.condition);
        match bridge.status.list_nodes_with_query(&query).await {
            Ok(nodes) => nodes.len() >= bridge.config.thresholds.ib_storm_nodes,
            Err(e) => {
                warn!(error = %e, "IB storm lookup failed");
                false
            }
        }
    }

    async fn restart_link(&self, episode: &Episode<'_>, status: &FaultObservation) -> Result<()> {
        let bridge = episode.bridge();
        if episode.successes(WorkflowAction::Remedy).await? >= bridge.config.thresholds.max_remedies {
            return episode
                .diagnose_and_dispatch(status, "IB link keeps going down after openibd restarts")
                .await;
        }

        let port = status.id.clone().unwrap_or_default();
        let restarted = episode
            .attempt(
                WorkflowAction::Remedy,
                bridge.actions().remedy(
                    episode.ctx(),
                    episode.node(),
                    RemedyAction::RestartOpenibd,
                    FAMILY,
                    &port,
                ),
            )
            .await?;
        if restarted.is_none() {
            return Ok(());
        }

        let Some(report) = episode
            .attempt(
                WorkflowAction::HealthCheck,
                bridge.actions().health_check(episode.ctx(), episode.node()),
            )
            .await?
        else {
            return Ok(());
        };
        if report.hardware_type == HardwareType::Ib {
            return episode
                .dispatch("IB health check still failing after openibd restart")
                .await;
        }
        info!(ticket = %episode.key(), "IB link recovered, waiting for the fault to clear");
        Ok(())
    }
}

#[async_trait]
impl Policy for IbPolicy {
    fn name(&self) -> &'static str {
        "ib"
    }

    fn conditions(&self) -> &'static [&'static str] {
        CONDITIONS
    }

    fn create_instance(&self, bridge: Arc<ApiBridge>) -> Result<()> {
        self.core.install(bridge)
    }

    async fn evaluate(&self, node: &str, status: &FaultObservation) -> bool {
        let Ok(bridge) = self.core.bridge() else {
            return false;
        };
        if self.is_storm(bridge, status).await {
            warn!(node = %node, condition = %status.condition, "Fabric-wide IB fault, leaving nodes alone");
            return false;
        }
        true
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
            .set_fault_label(node, labels::IB_UNAVAILABLE)
            .await?;

        match status.condition.as_str() {
            condition::IB_LINK_DOWN => self.restart_link(&episode, status).await,
            condition::IB_PORT_FLAPPING => {
                episode
                    .diagnose_and_dispatch(status, "IB port flapping, check cable and switch port")
                    .await
            }
            _ => {
                if episode.is_frequent().await? {
                    return episode
                        .diagnose_and_dispatch(status, "IB degradation keeps recurring on this node")
                        .await;
                }
                info!(ticket = %episode.key(), "IB degraded, node labelled and cordoned");
                Ok(())
            }
        }
    }

    async fn cleanup(
        &self,
        _ctx: &ActionContext,
        node: &str,
        _status: &FaultObservation,
    ) -> Result<()> {
        let bridge = self.core.bridge()?;
        cleanup_node(bridge, node, FAMILY, &[labels::IB_UNAVAILABLE], None).await
    }
}
