//! Node-level patches: cordon, fault labels and taints. No jobs involved.

use super::NodeActions;
use crate::cluster::{has_taint, is_unschedulable, node_annotation, node_label, CORDONED_ANNOTATION};
use crate::error::Result;
use chrono::Utc;
use k8s_openapi::api::core::v1::Taint;
use serde_json::json;
use tracing::{debug, info, instrument};

impl NodeActions<'_> {
    /// Marks the node unschedulable. Returns `false` (and patches nothing) when it
    /// already was.
    #[instrument(skip(self))]
    pub async fn cordon(&self, node: &str) -> Result<bool> {
        let current = self.cluster().get_node(node).await?;
        if is_unschedulable(&current) {
            debug!(node = %node, "Node already cordoned");
            return Ok(false);
        }
        let patch = json!({
            "spec": {"unschedulable": true},
            "metadata": {"annotations": {CORDONED_ANNOTATION: Utc::now().to_rfc3339()}}
        });
        self.cluster().patch_node(node, patch).await?;
        info!(node = %node, "🚧 Cordoned node");
        Ok(true)
    }

    #[instrument(skip(self))]
    pub async fn uncordon(&self, node: &str) -> Result<bool> {
        let current = self.cluster().get_node(node).await?;
        let marked = node_annotation(&current, CORDONED_ANNOTATION).is_some();
        if !is_unschedulable(&current) && !marked {
            return Ok(false);
        }
        let patch = json!({
            "spec": {"unschedulable": false},
            "metadata": {"annotations": {CORDONED_ANNOTATION: null}}
        });
        self.cluster().patch_node(node, patch).await?;
        info!(node = %node, "Uncordoned node");
        Ok(true)
    }

    /// Uncordons only when the cordon was ours
    pub async fn uncordon_if_owned(&self, node: &str) -> Result<bool> {
        let current = self.cluster().get_node(node).await?;
        if node_annotation(&current, CORDONED_ANNOTATION).is_none() {
            debug!(node = %node, "Cordon not owned by selfheal, leaving it");
            return Ok(false);
        }
        self.uncordon(node).await
    }

    pub async fn set_fault_label(&self, node: &str, key: &str) -> Result<bool> {
        let current = self.cluster().get_node(node).await?;
        if node_label(&current, key) == Some("true") {
            return Ok(false);
        }
        let patch = json!({"metadata": {"labels": {key: "true"}}});
        self.cluster().patch_node(node, patch).await?;
        info!(node = %node, label = %key, "Labelled node");
        Ok(true)
    }

    /// No-op when the label is absent
    pub async fn remove_fault_label(&self, node: &str, key: &str) -> Result<bool> {
        let current = self.cluster().get_node(node).await?;
        if node_label(&current, key).is_none() {
            return Ok(false);
        }
        let patch = json!({"metadata": {"labels": {key: null}}});
        self.cluster().patch_node(node, patch).await?;
        info!(node = %node, label = %key, "Removed node label");
        Ok(true)
    }

    /// Adds a NoSchedule taint
    pub async fn add_fault_taint(&self, node: &str, key: &str) -> Result<bool> {
        let current = self.cluster().get_node(node).await?;
        if has_taint(&current, key) {
            return Ok(false);
        }
        let mut taints = current
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        taints.push(Taint {
            key: key.to_string(),
            value: Some("true".to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        });
        // merge patch replaces lists wholesale
        self.cluster()
            .patch_node(node, json!({"spec": {"taints": taints}}))
            .await?;
        info!(node = %node, taint = %key, "Tainted node");
        Ok(true)
    }

    /// No-op when the taint is absent
    pub async fn remove_fault_taint(&self, node: &str, key: &str) -> Result<bool> {
        let current = self.cluster().get_node(node).await?;
        if !has_taint(&current, key) {
            return Ok(false);
        }
        let taints: Vec<Taint> = current
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t.key != key)
            .collect();
        self.cluster()
            .patch_node(node, json!({"spec": {"taints": taints}}))
            .await?;
        info!(node = %node, taint = %key, "Removed node taint");
        Ok(true)
    }
}
