//! Cluster API seam.
//!
//! Everything the engine does to the cluster goes through [`ClusterClient`], so the
//! action primitives can be exercised without an API server. [`KubeCluster`] is the
//! production implementation on top of `kube::Client`.

mod kube_client;

pub use kube_client::KubeCluster;

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::Value;
use std::collections::BTreeMap;

/// Label put on every Job/Pod the engine spawns
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "selfheal";

/// Extended resource name advertised by the GPU device plugin
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Annotation marking a cordon the engine owns
pub const CORDONED_ANNOTATION: &str = "selfheal.5dlabs.com/cordoned";

/// Filter for pod listings. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct PodQuery {
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub node_name: Option<String>,
}

impl PodQuery {
    pub fn on_node(node: &str) -> Self {
        Self {
            node_name: Some(node.to_string()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    #[must_use]
    pub fn with_labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }
}

/// Cluster operations used by the action primitives.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// JSON merge patch against the node (spec, labels, annotations)
    async fn patch_node(&self, name: &str, patch: Value) -> Result<Node>;

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    /// Foreground deletion; an absent job is not an error
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    /// Foreground deletion; an absent pod is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pods(&self, query: &PodQuery) -> Result<Vec<Pod>>;

    /// Eviction subresource; an absent pod is not an error
    async fn evict_pod(&self, namespace: &str, name: &str, grace_seconds: i64) -> Result<()>;

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String>;

    /// Warning event attached to the node
    async fn record_node_event(&self, node: &str, reason: &str, message: &str) -> Result<()>;
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

pub fn node_label<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

pub fn node_annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

pub fn has_taint(node: &Node, key: &str) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|t| t.key == key))
}

/// Pod is owned by a DaemonSet
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"))
}

/// Static pod mirrored by the kubelet
pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"))
}

pub fn is_managed_by_engine(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|v| v == MANAGED_BY_VALUE)
}

/// Pod has reached Succeeded or Failed
pub fn is_pod_finished(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Pod requests or limits at least one GPU
pub fn requests_gpu(pod: &Pod) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.containers.iter().any(|c| {
        c.resources.as_ref().is_some_and(|r| {
            asks_for_gpu(r.limits.as_ref()) || asks_for_gpu(r.requests.as_ref())
        })
    })
}

fn asks_for_gpu(resources: Option<&BTreeMap<String, Quantity>>) -> bool {
    resources
        .and_then(|m| m.get(GPU_RESOURCE))
        .is_some_and(|q| q.0 != "0")
}
