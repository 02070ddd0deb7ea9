//! Remedy and repair jobs, plus daemon pod restarts.

use super::naming::ActionNaming;
use super::poll::{await_terminal, ActionContext, Phase, ABSENCE_INTERVAL};
use super::NodeActions;
use crate::cluster::{is_pod_ready, PodQuery};
use crate::error::{Error, Result};
use crate::template::TemplateKind;
use std::fmt;
use tracing::{info, instrument};

/// Named host-side actions understood by the remedy image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemedyAction {
    RestartFabricmanager,
    DropCache,
    ConfigPeerMem,
    RestartKubelet,
    RestartOpenibd,
    RemountGpfs,
    RestartGpfs,
    RestartNetwork,
    /// Post-reboot fixups (driver persistence mode, clocks, fabric manager)
    PostReboot,
}

impl fmt::Display for RemedyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl NodeActions<'_> {
    /// Runs `action` on the node through a `remedy-<node>` job
    #[instrument(skip(self, ctx, parameters))]
    pub async fn remedy(
        &self,
        ctx: &ActionContext,
        node: &str,
        action: RemedyAction,
        component: &str,
        parameters: &str,
    ) -> Result<()> {
        let scoped = ctx.with_timeout(self.bridge.config.timeouts.remedy());
        let name = ActionNaming::name("remedy", node);
        let mut params = self.bridge.base_params(node);
        params.insert("job_name".to_string(), name.clone());
        params.insert("action".to_string(), action.to_string());
        params.insert("component".to_string(), component.to_string());
        params.insert("parameters".to_string(), parameters.to_string());

        self.run_job(&scoped, TemplateKind::RemedyJob, &name, &params)
            .await?;
        info!(node = %node, action = %action, "🩹 Remedy succeeded");
        Ok(())
    }

    /// Drains the node, then runs `action` through a `repair-<node>` job
    #[instrument(skip(self, ctx))]
    pub async fn repair(
        &self,
        ctx: &ActionContext,
        node: &str,
        action: RemedyAction,
        component: &str,
    ) -> Result<()> {
        let scoped = ctx.with_timeout(self.bridge.config.timeouts.repair());
        self.drain(&scoped, node).await?;

        let name = ActionNaming::name("repair", node);
        let mut params = self.bridge.base_params(node);
        params.insert("job_name".to_string(), name.clone());
        params.insert("action".to_string(), action.to_string());
        params.insert("component".to_string(), component.to_string());
        params.insert("parameters".to_string(), String::new());

        self.run_job(&scoped, TemplateKind::RepairJob, &name, &params)
            .await?;
        info!(node = %node, action = %action, "🔧 Repair succeeded");
        Ok(())
    }

    /// Deletes the DaemonSet pod matching `selector` on the node and waits for a Ready
    /// replacement.
    #[instrument(skip(self, ctx))]
    pub async fn restart_daemon_pod(
        &self,
        ctx: &ActionContext,
        node: &str,
        namespace: &str,
        selector: &str,
    ) -> Result<()> {
        let query = PodQuery::on_node(node)
            .in_namespace(namespace)
            .with_labels(selector);
        let pods = self.cluster().list_pods(&query).await?;
        let old = pods
            .first()
            .ok_or_else(|| Error::not_found(format!("pod {selector} on {node}")))?;
        let old_uid = old.metadata.uid.clone();
        let old_name = old.metadata.name.clone().unwrap_or_default();

        self.cluster().delete_pod(namespace, &old_name).await?;
        info!(node = %node, pod = %old_name, "Deleted daemon pod, waiting for replacement");

        let scoped = ctx.with_timeout(self.bridge.config.timeouts.pod_ready());
        let query = &query;
        let old_uid = &old_uid;
        await_terminal(&scoped, &old_name, ABSENCE_INTERVAL, || async move {
            let pods = self.cluster().list_pods(query).await?;
            let ready = pods
                .iter()
                .any(|p| p.metadata.uid != *old_uid && is_pod_ready(p));
            Ok::<_, Error>(if ready { Phase::Succeeded } else { Phase::Pending })
        })
        .await?;
        info!(node = %node, selector = %selector, "✅ Daemon pod replaced and Ready");
        Ok(())
    }
}
