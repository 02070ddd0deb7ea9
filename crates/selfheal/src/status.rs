//! Node status service client.
//!
//! The classifier that produces [`FaultObservation`]s also serves its current view of every
//! node over HTTP. Policies read it to decide whether a condition is superseded, whether GPUs
//! are busy, and whether a fault is spread across many nodes at once.

use crate::config::StatusConfig;
use crate::error::{Error, Result};
use crate::observation::{FaultObservation, HardwareType};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Per-GPU state on a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuStatus {
    pub index: u32,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub pci_bdf: Option<String>,
    /// Bound to a running pod
    #[serde(default)]
    pub allocated: bool,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

/// Read-only queries against the node status service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusQuery: Send + Sync {
    /// Active observations on a node for one subsystem
    async fn get_node_statuses(
        &self,
        node: &str,
        hardware_type: HardwareType,
    ) -> Result<Vec<FaultObservation>>;

    async fn get_node_gpu_statuses(&self, node: &str) -> Result<Vec<GpuStatus>>;

    /// Names of nodes matching a status query such as `condition=IBLinkDown`
    async fn list_nodes_with_query(&self, query: &str) -> Result<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    nodes: Vec<String>,
}

/// [`StatusQuery`] over the status service's REST API
#[derive(Clone)]
pub struct HttpStatusClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusClient {
    pub fn new(config: &StatusConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "Querying node status service");
        let response = self.client.get(&url).query(query).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::StatusError(format!(
                "GET {path} returned {status}: {body}"
            )));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl StatusQuery for HttpStatusClient {
    async fn get_node_statuses(
        &self,
        node: &str,
        hardware_type: HardwareType,
    ) -> Result<Vec<FaultObservation>> {
        let type_param = hardware_type.to_string();
        match self
            .get_json(
                &format!("/api/v1/nodes/{node}/statuses"),
                &[("type", type_param.as_str())],
            )
            .await
        {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    async fn get_node_gpu_statuses(&self, node: &str) -> Result<Vec<GpuStatus>> {
        match self
            .get_json(&format!("/api/v1/nodes/{node}/gpus"), &[])
            .await
        {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    async fn list_nodes_with_query(&self, query: &str) -> Result<Vec<String>> {
        let list: NodeList = self.get_json("/api/v1/nodes", &[("query", query)]).await?;
        Ok(list.nodes)
    }
}
