use super::{ClusterClient, PodQuery};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, EventSource, Node, ObjectReference, Pod};
use kube::api::{
    Api, DeleteParams, EvictParams, ListParams, LogParams, Patch, PatchParams, PostParams,
};
use kube::core::ObjectMeta;
use kube::Client;
use serde_json::Value;
use tracing::debug;

const FIELD_MANAGER: &str = "selfheal";
const EVENT_NAMESPACE: &str = "default";

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Swallow 404s, the object is already gone
fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_node(&self, name: &str) -> Result<Node> {
        match self.nodes().get(name).await {
            Ok(node) => Ok(node),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::not_found(format!("node/{name}"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_node(&self, name: &str, patch: Value) -> Result<Node> {
        debug!(node = %name, patch = %patch, "Patching node");
        let params = PatchParams::apply(FIELD_MANAGER);
        Ok(self.nodes().patch(name, &params, &Patch::Merge(&patch)).await?)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.jobs(namespace).get_opt(name).await?)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        Ok(self.jobs(namespace).create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.jobs(namespace)
                .delete(name, &DeleteParams::foreground())
                .await,
        )
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods(namespace).get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.pods(namespace)
                .delete(name, &DeleteParams::foreground())
                .await,
        )
    }

    async fn list_pods(&self, query: &PodQuery) -> Result<Vec<Pod>> {
        let api: Api<Pod> = match &query.namespace {
            Some(ns) => self.pods(ns),
            None => Api::all(self.client.clone()),
        };
        let mut params = ListParams::default();
        if let Some(selector) = &query.label_selector {
            params = params.labels(selector);
        }
        if let Some(node) = &query.node_name {
            params = params.fields(&format!("spec.nodeName={node}"));
        }
        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str, grace_seconds: i64) -> Result<()> {
        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(grace_seconds.max(0) as u32),
                ..DeleteParams::default()
            }),
            post_options: PostParams::default(),
        };
        ignore_not_found(self.pods(namespace).evict(name, &params).await)
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        Ok(self
            .pods(namespace)
            .logs(name, &LogParams::default())
            .await?)
    }

    async fn record_node_event(&self, node: &str, reason: &str, message: &str) -> Result<()> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), EVENT_NAMESPACE);
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{node}.")),
                namespace: Some(EVENT_NAMESPACE.to_string()),
                ..ObjectMeta::default()
            },
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Node".to_string()),
                name: Some(node.to_string()),
                uid: Some(node.to_string()),
                ..ObjectReference::default()
            },
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            type_: Some("Warning".to_string()),
            count: Some(1),
            source: Some(EventSource {
                component: Some(FIELD_MANAGER.to_string()),
                host: None,
            }),
            ..Event::default()
        };
        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}
