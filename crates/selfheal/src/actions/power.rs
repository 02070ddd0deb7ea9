//! Graceful restart and shutdown.
//!
//! Both compose the same steps: refuse while user workloads still run, warn with a node
//! event, cordon, drain, then run the power job (`reboot-<node>` / `shutdown-<node>`) under
//! its own timeout. Shutdown first waits for GPU workloads to leave on their own.

use super::naming::ActionNaming;
use super::poll::{await_terminal, ActionContext, Phase, POLL_INTERVAL};
use super::NodeActions;
use crate::cluster::{
    is_daemonset_pod, is_managed_by_engine, is_mirror_pod, is_pod_finished, requests_gpu,
    PodQuery,
};
use crate::error::{Error, Result};
use crate::template::TemplateKind;
use k8s_openapi::api::core::v1::Pod;
use tracing::{info, instrument, warn};

const POTENTIAL_EVICTION_REASON: &str = "PotentialEviction";

impl NodeActions<'_> {
    fn is_protected(&self, pod: &Pod) -> bool {
        pod.metadata
            .namespace
            .as_deref()
            .is_some_and(|ns| self.bridge.config.protected_namespaces.iter().any(|p| p == ns))
    }

    /// Live pods that are neither DaemonSet, mirror, protected nor ours
    async fn workload_pods(&self, node: &str) -> Result<Vec<Pod>> {
        let pods = self.cluster().list_pods(&PodQuery::on_node(node)).await?;
        Ok(pods
            .into_iter()
            .filter(|p| !is_pod_finished(p))
            .filter(|p| !is_daemonset_pod(p) && !is_mirror_pod(p))
            .filter(|p| !is_managed_by_engine(p) && !self.is_protected(p))
            .collect())
    }

    async fn ensure_no_workload(&self, node: &str) -> Result<()> {
        let pods = self.workload_pods(node).await?;
        if let Some(pod) = pods.first() {
            return Err(Error::NodeBusy {
                node: node.to_string(),
                reason: format!(
                    "{} workload pod(s) still running, e.g. {}/{}",
                    pods.len(),
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default()
                ),
            });
        }
        Ok(())
    }

    async fn warn_eviction(&self, node: &str, operation: &str) {
        let message = format!("selfheal is about to {operation} this node; remaining pods will be evicted");
        if let Err(e) = self
            .cluster()
            .record_node_event(node, POTENTIAL_EVICTION_REASON, &message)
            .await
        {
            warn!(node = %node, error = %e, "Failed to record node event");
        }
    }

    async fn power_cycle(
        &self,
        ctx: &ActionContext,
        node: &str,
        kind: TemplateKind,
        action: &str,
    ) -> Result<()> {
        self.ensure_no_workload(node).await?;
        self.warn_eviction(node, action).await;
        self.cordon(node).await?;
        self.drain(ctx, node).await?;

        let name = ActionNaming::name(action, node);
        let mut params = self.bridge.base_params(node);
        params.insert("job_name".to_string(), name.clone());
        self.run_job(ctx, kind, &name, &params).await
    }

    /// Reboots the node through a `reboot-<node>` job, bounded by the restart timeout
    #[instrument(skip(self, ctx))]
    pub async fn graceful_restart(&self, ctx: &ActionContext, node: &str) -> Result<()> {
        let scoped = ctx.with_timeout(self.bridge.config.timeouts.restart());
        self.power_cycle(&scoped, node, TemplateKind::RebootJob, "reboot")
            .await?;
        info!(node = %node, "🔄 Node restarted");
        Ok(())
    }

    /// Powers the node off. GPU workloads get up to the pre-wait timeout to finish first.
    #[instrument(skip(self, ctx))]
    pub async fn graceful_shutdown(&self, ctx: &ActionContext, node: &str) -> Result<()> {
        self.await_gpu_vacated(ctx, node).await?;

        let scoped = ctx.with_timeout(self.bridge.config.timeouts.shutdown());
        self.power_cycle(&scoped, node, TemplateKind::ShutdownJob, "shutdown")
            .await?;
        info!(node = %node, "⏻ Node powered off");
        Ok(())
    }

    async fn await_gpu_vacated(&self, ctx: &ActionContext, node: &str) -> Result<()> {
        let pre_wait = self.bridge.config.timeouts.shutdown_pre_wait();
        let scoped = ctx.with_timeout(pre_wait);
        let waited = await_terminal(&scoped, &format!("gpu-pods-{node}"), POLL_INTERVAL, || async move {
            let busy = self
                .workload_pods(node)
                .await?
                .iter()
                .filter(|p| requests_gpu(p))
                .count();
            Ok::<_, Error>(if busy == 0 {
                Phase::Succeeded
            } else {
                Phase::Pending
            })
        })
        .await;

        match waited {
            Ok(_) => Ok(()),
            Err(Error::ContextDone(_)) if !ctx.is_cancelled() => Err(Error::NodeBusy {
                node: node.to_string(),
                reason: format!("GPU pods still running after {}s", pre_wait.as_secs()),
            }),
            Err(e) => Err(e),
        }
    }
}
