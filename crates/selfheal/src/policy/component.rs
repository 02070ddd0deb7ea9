//! Node software components: kubelet and the GPU/RDMA device plugins.

use super::episode::{cleanup_node, Episode};
use super::{Policy, PolicyCore};
use crate::actions::{ActionContext, RemedyAction};
use crate::bridge::ApiBridge;
use crate::error::Result;
use crate::escalation::restart_node;
use crate::observation::{condition, FaultObservation, HardwareType};
use crate::tickets::WorkflowAction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const KUBELET_FAMILY: &str = "kubelet";

const CONDITIONS: &[&str] = &[
    condition::KUBELET_UNHEALTHY,
    condition::PLEG_UNHEALTHY,
    condition::DEVICE_PLUGIN_UNHEALTHY,
    condition::RDMA_PLUGIN_UNHEALTHY,
];

/// DaemonSet pod backing a device plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginPod {
    pub family: &'static str,
    pub namespace: &'static str,
    pub selector: &'static str,
}

pub const DEVICE_PLUGIN: PluginPod = PluginPod {
    family: "device-plugin",
    namespace: "nvidia-device-plugin",
    selector: "app=nvidia-device-plugin-daemonset",
};

pub const RDMA_PLUGIN: PluginPod = PluginPod {
    family: "rdma-plugin",
    namespace: "kube-system",
    selector: "app=rdma-shared-dp",
};

fn plugin_for(status: &FaultObservation) -> Option<PluginPod> {
    match status.condition.as_str() {
        condition::DEVICE_PLUGIN_UNHEALTHY => Some(DEVICE_PLUGIN),
        condition::RDMA_PLUGIN_UNHEALTHY => Some(RDMA_PLUGIN),
        _ => None,
    }
}

pub struct ComponentPolicy {
    core: PolicyCore,
}

impl Default for ComponentPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentPolicy {
    pub const fn new() -> Self {
        Self {
            core: PolicyCore::new("component"),
        }
    }

    /// Plugins are restarted by kubelet anyway once it recovers
    async fn kubelet_unhealthy(&self, bridge: &ApiBridge, node: &str) -> bool {
        match bridge
            .status
            .get_node_statuses(node, HardwareType::Kubelet)
            .await
        {
            Ok(statuses) => !statuses.is_empty(),
            Err(e) => {
                warn!(node = %node, error = %e, "Kubelet status lookup failed");
                false
            }
        }
    }

    async fn restart_kubelet(&self, episode: &Episode<'_>) -> Result<()> {
        let bridge = episode.bridge();
        if episode.successes(WorkflowAction::Remedy).await? >= bridge.config.thresholds.max_remedies {
            info!(ticket = %episode.key(), "Kubelet restart did not hold, restarting node");
            let result = restart_node(bridge, episode.ctx(), episode.key(), KUBELET_FAMILY, None).await;
            return episode.escalated(result).await;
        }
        episode
            .attempt(
                WorkflowAction::Remedy,
                bridge.actions().remedy(
                    episode.ctx(),
                    episode.node(),
                    RemedyAction::RestartKubelet,
                    KUBELET_FAMILY,
                    "",
                ),
            )
            .await?;
        Ok(())
    }

    async fn restart_plugin(&self, episode: &Episode<'_>, plugin: PluginPod) -> Result<()> {
        let bridge = episode.bridge();
        let restarts = episode.successes(WorkflowAction::RestartPod).await?;
        if restarts >= bridge.config.thresholds.max_pod_restarts {
            return episode
                .dispatch(format!("{} still unhealthy after {restarts} pod restarts", plugin.family))
                .await;
        }
        let restarted = episode
            .attempt(
                WorkflowAction::RestartPod,
                bridge.actions().restart_daemon_pod(
                    episode.ctx(),
                    episode.node(),
                    plugin.namespace,
                    plugin.selector,
                ),
            )
            .await?;
        if restarted.is_some() {
            info!(ticket = %episode.key(), plugin = plugin.family, "Plugin pod restarted");
        }
        Ok(())
    }
}

#[async_trait]
impl Policy for ComponentPolicy {
    fn name(&self) -> &'static str {
        "component"
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
        if plugin_for(status).is_some() && self.kubelet_unhealthy(bridge, node).await {
            debug!(node = %node, condition = %status.condition, "Kubelet unhealthy, skipping plugin");
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
        match plugin_for(status) {
            Some(plugin) => {
                let Some(episode) =
                    Episode::open_component(bridge, ctx, plugin.family, plugin.namespace, status)
                        .await?
                else {
                    return Ok(());
                };
                self.restart_plugin(&episode, plugin).await
            }
            None => {
                let Some(episode) = Episode::open(bridge, ctx, KUBELET_FAMILY, status).await? else {
                    return Ok(());
                };
                self.restart_kubelet(&episode).await
            }
        }
    }

    async fn cleanup(
        &self,
        _ctx: &ActionContext,
        node: &str,
        status: &FaultObservation,
    ) -> Result<()> {
        let bridge = self.core.bridge()?;
        let family = plugin_for(status).map_or(KUBELET_FAMILY, |p| p.family);
        cleanup_node(bridge, node, family, &[], None).await
    }
}
