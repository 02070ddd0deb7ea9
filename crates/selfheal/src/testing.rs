//! In-memory collaborators for unit tests.

use crate::bridge::ApiBridge;
use crate::cluster::{ClusterClient, PodQuery};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::observation::{FaultObservation, HardwareType};
use crate::status::{GpuStatus, StatusQuery};
use crate::template::TemplateStore;
use crate::tickets::{MemoryTicketManager, TicketKey};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// How spawned Jobs/Pods end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOutcome {
    Succeeded,
    Failed,
    /// Never reaches a terminal phase
    Running,
}

#[derive(Default)]
struct FakeState {
    nodes: BTreeMap<String, Node>,
    jobs: BTreeMap<(String, String), Job>,
    pods: BTreeMap<(String, String), Pod>,
    outcomes: Vec<(String, FakeOutcome)>,
    exit_codes: Vec<(String, i32)>,
    logs: HashMap<String, String>,
    refuse_evictions: bool,
    uid_seq: u64,
    node_patches: usize,
    created_jobs: Vec<String>,
    created_pods: Vec<String>,
    deleted: Vec<String>,
    evictions: Vec<String>,
    events: Vec<String>,
}

impl FakeState {
    fn next_uid(&mut self) -> String {
        self.uid_seq += 1;
        format!("uid-{}", self.uid_seq)
    }

    fn outcome_for(&self, name: &str) -> FakeOutcome {
        self.outcomes
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map_or(FakeOutcome::Succeeded, |(_, o)| *o)
    }

    fn exit_code_for(&self, name: &str) -> i32 {
        self.exit_codes
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map_or(0, |(_, c)| *c)
    }
}

/// Cluster that records every mutation and finishes spawned work instantly
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

fn api_error(code: u16, reason: &str, message: &str) -> Error {
    Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k.trim())).is_some_and(|x| x == v.trim()),
            None => labels.is_some_and(|l| l.contains_key(term.trim())),
        })
}

fn pod_on(pod: &Pod, node: &str) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .is_some_and(|n| n == node)
}

impl FakeCluster {
    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, name: &str) {
        let node: Node = serde_json::from_value(json!({
            "metadata": {"name": name, "labels": {"kubernetes.io/hostname": name}},
            "spec": {}
        }))
        .unwrap();
        self.lock().nodes.insert(name.to_string(), node);
    }

    /// Node cordoned by someone else
    pub fn add_cordoned_node(&self, name: &str) {
        let node: Node = serde_json::from_value(json!({
            "metadata": {"name": name},
            "spec": {"unschedulable": true}
        }))
        .unwrap();
        self.lock().nodes.insert(name.to_string(), node);
    }

    /// Leftover job from an earlier run, still active
    pub fn seed_job(&self, namespace: &str, name: &str) {
        let job: Job = serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": namespace},
            "status": {"active": 1}
        }))
        .unwrap();
        self.lock()
            .jobs
            .insert((namespace.to_string(), name.to_string()), job);
    }

    pub fn set_outcome(&self, name_prefix: &str, outcome: FakeOutcome) {
        self.lock()
            .outcomes
            .insert(0, (name_prefix.to_string(), outcome));
    }

    pub fn set_exit_code(&self, name_prefix: &str, code: i32) {
        self.lock()
            .exit_codes
            .insert(0, (name_prefix.to_string(), code));
    }

    pub fn set_logs(&self, pod_name: &str, logs: &str) {
        self.lock()
            .logs
            .insert(pod_name.to_string(), logs.to_string());
    }

    pub fn refuse_evictions(&self, refuse: bool) {
        self.lock().refuse_evictions = refuse;
    }

    /// Running ReplicaSet pod, optionally holding GPUs
    pub fn add_workload_pod(&self, namespace: &str, name: &str, node: &str, gpu: bool) {
        let resources = if gpu {
            json!({"limits": {"nvidia.com/gpu": "8"}})
        } else {
            json!({})
        };
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "namespace": namespace,
                "uid": format!("{name}-uid"),
                "ownerReferences": [{
                    "apiVersion": "apps/v1", "kind": "ReplicaSet", "name": format!("{name}-rs"), "uid": "rs"
                }]
            },
            "spec": {"nodeName": node, "containers": [{"name": "main", "resources": resources}]},
            "status": {"phase": "Running"}
        }))
        .unwrap();
        self.lock()
            .pods
            .insert((namespace.to_string(), name.to_string()), pod);
    }

    /// Ready DaemonSet pod; deleting it spawns a Ready replacement
    pub fn add_daemonset_pod(&self, namespace: &str, name: &str, node: &str, selector: &str) {
        let labels: BTreeMap<String, String> = selector
            .split(',')
            .filter_map(|t| t.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let pod = daemonset_pod(namespace, name, node, &labels, &format!("{name}-uid"));
        self.lock()
            .pods
            .insert((namespace.to_string(), name.to_string()), pod);
    }

    pub fn node_patches(&self) -> usize {
        self.lock().node_patches
    }

    pub fn created_jobs(&self) -> Vec<String> {
        self.lock().created_jobs.clone()
    }

    pub fn created_pods(&self) -> Vec<String> {
        self.lock().created_pods.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn evictions(&self) -> Vec<String> {
        self.lock().evictions.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.lock()
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod_names_on(&self, node: &str) -> Vec<String> {
        self.lock()
            .pods
            .values()
            .filter(|p| pod_on(p, node))
            .filter_map(|p| p.metadata.name.clone())
            .collect()
    }

    /// Every write the engine performed
    pub fn mutations(&self) -> usize {
        let s = self.lock();
        s.node_patches
            + s.created_jobs.len()
            + s.created_pods.len()
            + s.deleted.len()
            + s.evictions.len()
            + s.events.len()
    }
}

fn daemonset_pod(
    namespace: &str,
    name: &str,
    node: &str,
    labels: &BTreeMap<String, String>,
    uid: &str,
) -> Pod {
    serde_json::from_value(json!({
        "metadata": {
            "name": name,
            "namespace": namespace,
            "uid": uid,
            "labels": labels,
            "ownerReferences": [{
                "apiVersion": "apps/v1", "kind": "DaemonSet", "name": "ds", "uid": "ds"
            }]
        },
        "spec": {"nodeName": node, "containers": [{"name": "plugin"}]},
        "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
    }))
    .unwrap()
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_node(&self, name: &str) -> Result<Node> {
        self.lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node/{name}")))
    }

    async fn patch_node(&self, name: &str, patch: Value) -> Result<Node> {
        let mut s = self.lock();
        let node = s
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node/{name}")))?;
        let mut value = serde_json::to_value(&node)?;
        merge_patch(&mut value, &patch);
        let patched: Node = serde_json::from_value(value)?;
        s.nodes.insert(name.to_string(), patched.clone());
        s.node_patches += 1;
        Ok(patched)
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>> {
        Ok(self.job(namespace, name))
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let mut s = self.lock();
        let name = job.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        if s.jobs.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", "job exists"));
        }
        let status = match s.outcome_for(&name) {
            FakeOutcome::Succeeded => json!({"succeeded": 1}),
            FakeOutcome::Failed => json!({"failed": 1}),
            FakeOutcome::Running => json!({"active": 1}),
        };
        let mut created = job.clone();
        created.metadata.uid = Some(s.next_uid());
        created.status = Some(serde_json::from_value(status)?);
        s.jobs.insert(key, created.clone());
        s.created_jobs.push(name);
        Ok(created)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let mut s = self.lock();
        if s
            .jobs
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            s.deleted.push(format!("job/{name}"));
        }
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let mut s = self.lock();
        let name = pod.metadata.name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name.clone());
        if s.pods.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", "pod exists"));
        }
        let outcome = s.outcome_for(&name);
        let exit_code = s.exit_code_for(&name);
        let status = match outcome {
            FakeOutcome::Running => json!({"phase": "Running"}),
            _ => {
                let phase = if outcome == FakeOutcome::Failed || exit_code != 0 {
                    "Failed"
                } else {
                    "Succeeded"
                };
                json!({
                    "phase": phase,
                    "containerStatuses": [{
                        "name": "main", "image": "x", "imageID": "", "ready": false, "restartCount": 0,
                        "state": {"terminated": {"exitCode": exit_code}}
                    }]
                })
            }
        };
        let mut created = pod.clone();
        created.metadata.uid = Some(s.next_uid());
        created.status = Some(serde_json::from_value(status)?);
        s.pods.insert(key, created.clone());
        s.created_pods.push(name);
        Ok(created)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut s = self.lock();
        let Some(old) = s.pods.remove(&(namespace.to_string(), name.to_string())) else {
            return Ok(());
        };
        s.deleted.push(format!("pod/{name}"));
        if crate::cluster::is_daemonset_pod(&old) {
            let node = old
                .spec
                .as_ref()
                .and_then(|sp| sp.node_name.clone())
                .unwrap_or_default();
            let labels = old.metadata.labels.clone().unwrap_or_default();
            let replacement_name = format!("{name}-r");
            let uid = s.next_uid();
            let pod = daemonset_pod(namespace, &replacement_name, &node, &labels, &uid);
            s.pods
                .insert((namespace.to_string(), replacement_name), pod);
        }
        Ok(())
    }

    async fn list_pods(&self, query: &PodQuery) -> Result<Vec<Pod>> {
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), _)| query.namespace.as_ref().is_none_or(|q| q == ns))
            .filter(|(_, p)| query.node_name.as_ref().is_none_or(|n| pod_on(p, n)))
            .filter(|(_, p)| {
                query
                    .label_selector
                    .as_ref()
                    .is_none_or(|sel| labels_match(p.metadata.labels.as_ref(), sel))
            })
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn evict_pod(&self, namespace: &str, name: &str, _grace_seconds: i64) -> Result<()> {
        let mut s = self.lock();
        if s.refuse_evictions {
            return Err(api_error(429, "TooManyRequests", "disruption budget"));
        }
        if s.pods
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
        {
            s.evictions.push(format!("{namespace}/{name}"));
        }
        Ok(())
    }

    async fn pod_logs(&self, _namespace: &str, name: &str) -> Result<String> {
        Ok(self.lock().logs.get(name).cloned().unwrap_or_default())
    }

    async fn record_node_event(&self, node: &str, reason: &str, _message: &str) -> Result<()> {
        self.lock().events.push(format!("{node}:{reason}"));
        Ok(())
    }
}

/// Status service answering from fixed data
#[derive(Default)]
pub struct StaticStatus {
    statuses: Mutex<Vec<FaultObservation>>,
    gpus: Mutex<HashMap<String, Vec<GpuStatus>>>,
    queries: Mutex<HashMap<String, Vec<String>>>,
}

impl StaticStatus {
    pub fn add_status(&self, status: FaultObservation) {
        self.statuses.lock().unwrap().push(status);
    }

    pub fn set_gpus(&self, node: &str, gpus: Vec<GpuStatus>) {
        self.gpus.lock().unwrap().insert(node.to_string(), gpus);
    }

    pub fn set_query(&self, query: &str, nodes: &[&str]) {
        self.queries.lock().unwrap().insert(
            query.to_string(),
            nodes.iter().map(|n| (*n).to_string()).collect(),
        );
    }
}

#[async_trait]
impl StatusQuery for StaticStatus {
    async fn get_node_statuses(
        &self,
        node: &str,
        hardware_type: HardwareType,
    ) -> Result<Vec<FaultObservation>> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.node_name == node && s.hardware_type == hardware_type)
            .cloned()
            .collect())
    }

    async fn get_node_gpu_statuses(&self, node: &str) -> Result<Vec<GpuStatus>> {
        Ok(self
            .gpus
            .lock()
            .unwrap()
            .get(node)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_nodes_with_query(&self, query: &str) -> Result<Vec<String>> {
        Ok(self
            .queries
            .lock()
            .unwrap()
            .get(query)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub status: Arc<StaticStatus>,
    pub tickets: Arc<MemoryTicketManager>,
    pub bridge: Arc<ApiBridge>,
}

impl Harness {
    /// Backdates every root-cause timestamp on the open ticket
    pub fn age_root_cause(&self, key: &TicketKey, hours: i64) {
        let store = self.tickets.store();
        let mut book = store.book(&key.node);
        let ticket = book.open.get_mut(&key.family).unwrap();
        let then = Utc::now() - Duration::hours(hours);
        for ts in &mut ticket.root_cause.timestamps {
            *ts = then;
        }
        store.seed(&key.node, book);
    }
}

pub fn harness(config: EngineConfig) -> Harness {
    let status = Arc::new(StaticStatus::default());
    harness_with_status(config, status.clone(), status)
}

pub fn harness_with_status(
    config: EngineConfig,
    static_status: Arc<StaticStatus>,
    query: Arc<dyn StatusQuery>,
) -> Harness {
    let cluster = Arc::new(FakeCluster::default());
    let tickets = Arc::new(MemoryTicketManager::in_memory(
        config.tickets.history_depth,
    ));
    let bridge = Arc::new(ApiBridge::new(
        cluster.clone(),
        query,
        tickets.clone(),
        TemplateStore::embedded().unwrap(),
        config,
    ));
    Harness {
        cluster,
        status: static_status,
        tickets,
        bridge,
    }
}

pub fn aggressive_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.remediation.aggressive = true;
    config
}
