//! Job/Pod templates for the action primitives.
//!
//! Templates are plain YAML manifests with `{{key}}` placeholders. Rendering runs in
//! strict mode so a missing parameter fails the call before anything touches the cluster.

use crate::error::{Error, Result};
use handlebars::Handlebars;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Parameters substituted into a template.
pub type TemplateParams = BTreeMap<String, String>;

/// Every template the primitives know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    RebootJob,
    ShutdownJob,
    RemedyJob,
    RepairJob,
    DiagnosePod,
    HealthCheckPod,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 6] = [
        TemplateKind::RebootJob,
        TemplateKind::ShutdownJob,
        TemplateKind::RemedyJob,
        TemplateKind::RepairJob,
        TemplateKind::DiagnosePod,
        TemplateKind::HealthCheckPod,
    ];

    /// File name under the template directory
    pub fn file_name(self) -> &'static str {
        match self {
            TemplateKind::RebootJob => "reboot-job.yaml",
            TemplateKind::ShutdownJob => "shutdown-job.yaml",
            TemplateKind::RemedyJob => "remedy-job.yaml",
            TemplateKind::RepairJob => "repair-job.yaml",
            TemplateKind::DiagnosePod => "diagnose-pod.yaml",
            TemplateKind::HealthCheckPod => "healthcheck-pod.yaml",
        }
    }

    fn embedded(self) -> &'static str {
        match self {
            TemplateKind::RebootJob => include_str!("../templates/reboot-job.yaml"),
            TemplateKind::ShutdownJob => include_str!("../templates/shutdown-job.yaml"),
            TemplateKind::RemedyJob => include_str!("../templates/remedy-job.yaml"),
            TemplateKind::RepairJob => include_str!("../templates/repair-job.yaml"),
            TemplateKind::DiagnosePod => include_str!("../templates/diagnose-pod.yaml"),
            TemplateKind::HealthCheckPod => include_str!("../templates/healthcheck-pod.yaml"),
        }
    }
}

/// Registered templates, ready to render.
pub struct TemplateStore {
    registry: Handlebars<'static>,
}

impl std::fmt::Debug for TemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateStore").finish_non_exhaustive()
    }
}

impl TemplateStore {
    fn empty() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    /// Templates compiled into the binary
    pub fn embedded() -> Result<Self> {
        let mut store = Self::empty();
        for kind in TemplateKind::ALL {
            store.register(kind, kind.embedded())?;
        }
        Ok(store)
    }

    /// Templates from a directory; files that are absent fall back to the embedded copy
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut store = Self::empty();
        for kind in TemplateKind::ALL {
            let path = dir.join(kind.file_name());
            if path.is_file() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    Error::TemplateError(format!("failed to read {}: {e}", path.display()))
                })?;
                debug!(template = %path.display(), "Loaded template from disk");
                store.register(kind, &content)?;
            } else {
                store.register(kind, kind.embedded())?;
            }
        }
        Ok(store)
    }

    fn register(&mut self, kind: TemplateKind, content: &str) -> Result<()> {
        self.registry
            .register_template_string(kind.file_name(), content)
            .map_err(|e| Error::TemplateError(format!("{}: {e}", kind.file_name())))
    }

    /// Render a template to YAML text
    pub fn render(&self, kind: TemplateKind, params: &TemplateParams) -> Result<String> {
        self.registry
            .render(kind.file_name(), params)
            .map_err(|e| Error::TemplateError(format!("{}: {e}", kind.file_name())))
    }

    pub fn render_job(&self, kind: TemplateKind, params: &TemplateParams) -> Result<Job> {
        let yaml = self.render(kind, params)?;
        Ok(serde_yaml::from_str(&yaml)?)
    }

    pub fn render_pod(&self, kind: TemplateKind, params: &TemplateParams) -> Result<Pod> {
        let yaml = self.render(kind, params)?;
        Ok(serde_yaml::from_str(&yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TemplateParams {
        [
            ("registry", "ghcr.io"),
            ("repository", "5dlabs/node-remedy"),
            ("image", "v1.2.0"),
            ("job_name", "reboot-gpu-a-001"),
            ("pod_name", "diagnose-gpu-a-001"),
            ("namespace", "selfheal"),
            ("node_name", "gpu-a-001"),
            ("region", "us-east"),
            ("cluster", "h100"),
            ("action", "RestartFabricmanager"),
            ("component", "gpu"),
            ("alert_name", "XidError"),
            ("type", "gpu"),
            ("parameters", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn renders_reboot_job_with_node_affinity() {
        let store = TemplateStore::embedded().unwrap();
        let job = store.render_job(TemplateKind::RebootJob, &params()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("reboot-gpu-a-001"));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("ghcr.io/5dlabs/node-remedy:v1.2.0")
        );
        assert!(container
            .args
            .as_ref()
            .unwrap()
            .contains(&"--node=gpu-a-001".to_string()));
    }

    #[test]
    fn renders_every_template() {
        let store = TemplateStore::embedded().unwrap();
        for kind in [
            TemplateKind::RebootJob,
            TemplateKind::ShutdownJob,
            TemplateKind::RemedyJob,
            TemplateKind::RepairJob,
        ] {
            assert!(store.render_job(kind, &params()).is_ok(), "{kind:?}");
        }
        let pod = store
            .render_pod(TemplateKind::HealthCheckPod, &params())
            .unwrap();
        assert_eq!(
            pod.spec.unwrap().node_name.as_deref(),
            Some("gpu-a-001")
        );
        assert!(store.render_pod(TemplateKind::DiagnosePod, &params()).is_ok());
    }

    #[test]
    fn missing_parameter_is_a_render_error() {
        let store = TemplateStore::embedded().unwrap();
        let mut p = params();
        p.remove("node_name");
        let err = store.render_job(TemplateKind::RemedyJob, &p).unwrap_err();
        assert!(matches!(err, Error::TemplateError(_)));
    }

    #[test]
    fn values_are_not_html_escaped() {
        let store = TemplateStore::embedded().unwrap();
        let mut p = params();
        p.insert("parameters".to_string(), "a=1&b=<2>".to_string());
        let yaml = store.render(TemplateKind::RemedyJob, &p).unwrap();
        assert!(yaml.contains("--parameters=a=1&b=<2>"));
    }

    #[test]
    fn directory_overrides_embedded_templates() {
        let dir = std::env::temp_dir().join(format!("selfheal-tpl-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("remedy-job.yaml"),
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: \"custom-{{node_name}}\"\n",
        )
        .unwrap();

        let store = TemplateStore::from_dir(&dir).unwrap();
        let job = store.render_job(TemplateKind::RemedyJob, &params()).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("custom-gpu-a-001"));
        // untouched kinds still come from the embedded set
        assert!(store.render_job(TemplateKind::RebootJob, &params()).is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }
}
