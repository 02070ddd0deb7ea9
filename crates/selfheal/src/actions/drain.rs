//! Eviction-based drain.

use super::poll::{await_terminal, ActionContext, Phase, ABSENCE_INTERVAL};
use super::NodeActions;
use crate::cluster::{
    is_daemonset_pod, is_managed_by_engine, is_mirror_pod, is_pod_finished, is_unschedulable,
    PodQuery,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tracing::{info, instrument, warn};

impl NodeActions<'_> {
    /// Pods a drain has to remove from the node
    async fn drain_targets(&self, node: &str) -> Result<Vec<Pod>> {
        let ignore_daemonsets = self.bridge.config.drain.ignore_daemonsets;
        let pods = self.cluster().list_pods(&PodQuery::on_node(node)).await?;
        Ok(pods
            .into_iter()
            .filter(|p| !is_pod_finished(p))
            .filter(|p| !is_mirror_pod(p))
            .filter(|p| !is_managed_by_engine(p))
            .filter(|p| !(ignore_daemonsets && is_daemonset_pod(p)))
            .collect())
    }

    async fn evict_all(&self, pods: &[Pod]) {
        let grace = self.bridge.config.drain.grace_period_seconds;
        for pod in pods {
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let ns = pod.metadata.namespace.as_deref().unwrap_or("default");
            let name = pod.metadata.name.as_deref().unwrap_or_default();
            if let Err(e) = self.cluster().evict_pod(ns, name, grace).await {
                // PDB refusals come back as 429; the next round retries them
                warn!(pod = %name, namespace = %ns, error = %e, "Eviction refused");
            }
        }
    }

    /// Evicts every non-DaemonSet pod from a cordoned node and waits for them to go.
    ///
    /// Fails with [`Error::NotCordoned`] on a schedulable node and
    /// [`Error::DrainTimeout`] when pods remain after the configured timeout.
    #[instrument(skip(self, ctx))]
    pub async fn drain(&self, ctx: &ActionContext, node: &str) -> Result<()> {
        let current = self.cluster().get_node(node).await?;
        if !is_unschedulable(&current) {
            return Err(Error::NotCordoned {
                node: node.to_string(),
            });
        }

        let config = &self.bridge.config.drain;
        let targets = self.drain_targets(node).await?;
        if !config.force {
            if let Some(orphan) = targets.iter().find(|p| p.metadata.owner_references.is_none()) {
                return Err(Error::NodeBusy {
                    node: node.to_string(),
                    reason: format!(
                        "unmanaged pod {} blocks drain without force",
                        orphan.metadata.name.as_deref().unwrap_or_default()
                    ),
                });
            }
        }
        if targets.is_empty() {
            info!(node = %node, "Nothing to drain");
            return Ok(());
        }

        info!(node = %node, pods = targets.len(), "Draining node");
        self.evict_all(&targets).await;

        let timeout = Duration::from_secs(config.timeout_seconds);
        let scoped = ctx.with_timeout(timeout);
        let waited = await_terminal(&scoped, &format!("drain-{node}"), ABSENCE_INTERVAL, || async move {
            let remaining = self.drain_targets(node).await?;
            if remaining.is_empty() {
                return Ok::<_, Error>(Phase::Succeeded);
            }
            self.evict_all(&remaining).await;
            Ok(Phase::Pending)
        })
        .await;

        match waited {
            Ok(_) => {
                info!(node = %node, "✅ Node drained");
                Ok(())
            }
            Err(Error::ContextDone(_)) if !ctx.is_cancelled() => Err(Error::DrainTimeout {
                node: node.to_string(),
                seconds: config.timeout_seconds,
            }),
            Err(e) => Err(e),
        }
    }
}
