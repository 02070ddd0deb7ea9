//! Render → pre-empt → create → poll for the Jobs and Pods the primitives spawn.

use super::poll::{await_absent, await_terminal, job_phase, pod_phase, ActionContext, POLL_INTERVAL};
use super::NodeActions;
use crate::error::{Error, Result};
use crate::template::{TemplateKind, TemplateParams};
use k8s_openapi::api::core::v1::Pod;
use kube::core::ObjectMeta;
use tracing::{debug, info, instrument, warn};

/// Final state of an ephemeral pod
#[derive(Debug, Clone)]
pub struct PodOutcome {
    pub succeeded: bool,
    pub pod: Pod,
}

impl PodOutcome {
    /// Exit code of the first terminated container
    pub fn exit_code(&self) -> Option<i32> {
        self.pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses.iter().find_map(|cs| {
                    cs.state
                        .as_ref()
                        .and_then(|st| st.terminated.as_ref())
                        .map(|t| t.exit_code)
                })
            })
    }
}

impl NodeActions<'_> {
    fn stamp(&self, metadata: &mut ObjectMeta, name: &str) {
        metadata.name = Some(name.to_string());
        metadata.namespace = Some(self.namespace().to_string());
        if let Some(owner) = self.bridge.owner_reference() {
            metadata.owner_references = Some(vec![owner.clone()]);
        }
    }

    /// Deletes a previous job with this name and waits until the API no longer returns it.
    ///
    /// Critical section: between the absence check and the create in
    /// [`Self::run_job`] nothing stops a second caller for the same (action, node) from
    /// doing the same. Callers serialize per node.
    async fn preempt_job(&self, ctx: &ActionContext, name: &str) -> Result<()> {
        let ns = self.namespace();
        if self.cluster().get_job(ns, name).await?.is_none() {
            return Ok(());
        }
        info!(job = %name, "Deleting previous remediation job");
        self.cluster().delete_job(ns, name).await?;
        await_absent(ctx, name, || async move {
            Ok::<_, Error>(self.cluster().get_job(ns, name).await?.is_some())
        })
        .await
    }

    /// Pod counterpart of [`Self::preempt_job`], same critical section
    async fn preempt_pod(&self, ctx: &ActionContext, name: &str) -> Result<()> {
        let ns = self.namespace();
        if self.cluster().get_pod(ns, name).await?.is_none() {
            return Ok(());
        }
        info!(pod = %name, "Deleting previous remediation pod");
        self.cluster().delete_pod(ns, name).await?;
        await_absent(ctx, name, || async move {
            Ok::<_, Error>(self.cluster().get_pod(ns, name).await?.is_some())
        })
        .await
    }

    /// Runs a Job to completion. A Job that ends Failed is [`Error::JobFailed`].
    #[instrument(skip(self, ctx, params), fields(namespace = %self.namespace()))]
    pub(crate) async fn run_job(
        &self,
        ctx: &ActionContext,
        kind: TemplateKind,
        name: &str,
        params: &TemplateParams,
    ) -> Result<()> {
        let mut job = self.bridge.templates.render_job(kind, params)?;
        self.stamp(&mut job.metadata, name);

        self.preempt_job(ctx, name).await?;

        let ns = self.namespace();
        self.cluster().create_job(ns, &job).await?;
        info!(job = %name, "Created remediation job");

        let succeeded = await_terminal(ctx, name, POLL_INTERVAL, || async move {
            match self.cluster().get_job(ns, name).await? {
                Some(job) => Ok(job_phase(&job)),
                None => Err(Error::not_found(format!("job/{name}"))),
            }
        })
        .await?;

        if succeeded {
            info!(job = %name, "Remediation job succeeded");
            Ok(())
        } else {
            warn!(job = %name, "Remediation job failed");
            Err(Error::JobFailed {
                kind: "Job".to_string(),
                name: name.to_string(),
            })
        }
    }

    /// Runs a Pod to a terminal phase and returns it for inspection
    #[instrument(skip(self, ctx, params), fields(namespace = %self.namespace()))]
    pub(crate) async fn run_pod(
        &self,
        ctx: &ActionContext,
        kind: TemplateKind,
        name: &str,
        params: &TemplateParams,
    ) -> Result<PodOutcome> {
        let mut pod = self.bridge.templates.render_pod(kind, params)?;
        self.stamp(&mut pod.metadata, name);

        self.preempt_pod(ctx, name).await?;

        let ns = self.namespace();
        self.cluster().create_pod(ns, &pod).await?;
        info!(pod = %name, "Created remediation pod");

        let succeeded = await_terminal(ctx, name, POLL_INTERVAL, || async move {
            match self.cluster().get_pod(ns, name).await? {
                Some(pod) => Ok(pod_phase(&pod)),
                None => Err(Error::not_found(format!("pod/{name}"))),
            }
        })
        .await?;

        let pod = self
            .cluster()
            .get_pod(ns, name)
            .await?
            .ok_or_else(|| Error::not_found(format!("pod/{name}")))?;
        debug!(pod = %name, succeeded, "Remediation pod finished");
        Ok(PodOutcome { succeeded, pod })
    }
}
