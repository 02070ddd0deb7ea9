//! ConfigMap-backed ticket persistence.
//!
//! One ConfigMap per node holds the node's [`TicketBook`] as JSON. Writes carry the
//! `resourceVersion` that was read, so concurrent writers surface as 409 conflicts and the
//! manager reapplies its change on a fresh copy.

use super::{TicketBook, TicketStore};
use crate::cluster::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ListParams, PostParams};
use kube::core::ObjectMeta;
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

const DATA_KEY: &str = "tickets.json";
const NODE_LABEL: &str = "selfheal.5dlabs.com/node";
const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// [`TicketStore`] keeping one ConfigMap per node
#[derive(Clone)]
pub struct ConfigMapStore {
    configmaps: Api<ConfigMap>,
    namespace: String,
}

impl ConfigMapStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// ConfigMap name for a node
    pub fn configmap_name(node: &str) -> String {
        let name = format!("selfheal-tickets-{node}");
        name.chars().take(253).collect()
    }

    /// Nodes that currently have a ticket book
    pub async fn nodes(&self) -> Result<Vec<String>> {
        let params =
            ListParams::default().labels(&format!("{COMPONENT_LABEL}=tickets"));
        let list = self.configmaps.list(&params).await?;
        Ok(list
            .items
            .iter()
            .filter_map(|cm| cm.metadata.labels.as_ref()?.get(NODE_LABEL).cloned())
            .collect())
    }

    fn build(&self, node: &str, book: &TicketBook, version: Option<String>) -> Result<ConfigMap> {
        let json = serde_json::to_string_pretty(book)?;

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(COMPONENT_LABEL.to_string(), "tickets".to_string());
        labels.insert(NODE_LABEL.to_string(), node.to_string());

        let mut data = BTreeMap::new();
        data.insert(DATA_KEY.to_string(), json);
        data.insert("open".to_string(), book.open.len().to_string());

        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(Self::configmap_name(node)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                resource_version: version,
                ..ObjectMeta::default()
            },
            data: Some(data),
            ..ConfigMap::default()
        })
    }
}

/// Parses the stored book; a missing or empty data key is an empty book
fn decode(cm: &ConfigMap) -> Result<TicketBook> {
    match cm.data.as_ref().and_then(|d| d.get(DATA_KEY)) {
        Some(json) if !json.trim().is_empty() => Ok(serde_json::from_str(json)?),
        _ => {
            warn!(
                configmap = cm.metadata.name.as_deref().unwrap_or_default(),
                "ConfigMap missing {} data", DATA_KEY
            );
            Ok(TicketBook::default())
        }
    }
}

#[async_trait]
impl TicketStore for ConfigMapStore {
    async fn load(&self, node: &str) -> Result<(TicketBook, Option<String>)> {
        let name = Self::configmap_name(node);
        match self.configmaps.get_opt(&name).await? {
            Some(cm) => {
                let version = cm.metadata.resource_version.clone();
                Ok((decode(&cm)?, version))
            }
            None => {
                debug!(node = %node, "No ticket ConfigMap yet");
                Ok((TicketBook::default(), None))
            }
        }
    }

    async fn save(&self, node: &str, book: &TicketBook, version: Option<String>) -> Result<bool> {
        let name = Self::configmap_name(node);
        let cm = self.build(node, book, version.clone())?;

        let result = match version {
            None => self.configmaps.create(&PostParams::default(), &cm).await,
            Some(_) => {
                self.configmaps
                    .replace(&name, &PostParams::default(), &cm)
                    .await
            }
        };

        match result {
            Ok(_) => {
                debug!(configmap = %name, "Saved ticket book");
                Ok(true)
            }
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => {
                error!(configmap = %name, error = %e, "Failed to save ticket book");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::TicketKey;
    use chrono::Utc;

    #[test]
    fn decodes_stored_book() {
        let mut book = TicketBook::default();
        book.create(&TicketKey::new("n1", "gpu"), None, "hung", Utc::now());
        let mut data = BTreeMap::new();
        data.insert(DATA_KEY.to_string(), serde_json::to_string(&book).unwrap());
        let cm = ConfigMap {
            data: Some(data),
            ..ConfigMap::default()
        };
        assert_eq!(decode(&cm).unwrap(), book);
    }

    #[test]
    fn empty_configmap_is_empty_book() {
        let cm = ConfigMap::default();
        assert_eq!(decode(&cm).unwrap(), TicketBook::default());
    }

    #[test]
    fn names_are_per_node() {
        assert_eq!(
            ConfigMapStore::configmap_name("gpu-a-001"),
            "selfheal-tickets-gpu-a-001"
        );
    }
}
