//! Capability bundle shared by every policy.
//!
//! The bridge is built once at startup and never mutated afterwards. Policies hold an
//! `Arc<ApiBridge>` and reach the cluster, the status service and the ticket manager through
//! it; the aggressiveness settings are read from it at every gate.

use crate::actions::NodeActions;
use crate::cluster::ClusterClient;
use crate::config::EngineConfig;
use crate::status::StatusQuery;
use crate::template::{TemplateParams, TemplateStore};
use crate::tickets::TicketManager;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::sync::Arc;

pub struct ApiBridge {
    pub cluster: Arc<dyn ClusterClient>,
    pub status: Arc<dyn StatusQuery>,
    pub tickets: Arc<dyn TicketManager>,
    pub templates: TemplateStore,
    pub config: EngineConfig,
    owner: Option<OwnerReference>,
}

impl std::fmt::Debug for ApiBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiBridge")
            .field("namespace", &self.config.namespace)
            .field("aggressive", &self.aggressive())
            .field("aggressive_level", &self.aggressive_level())
            .finish_non_exhaustive()
    }
}

impl ApiBridge {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        status: Arc<dyn StatusQuery>,
        tickets: Arc<dyn TicketManager>,
        templates: TemplateStore,
        config: EngineConfig,
    ) -> Self {
        let owner = config.owner.as_ref().map(|o| o.to_owner_reference());
        Self {
            cluster,
            status,
            tickets,
            templates,
            config,
            owner,
        }
    }

    /// Gate 1: automation may touch nodes beyond cordon and ticketing
    pub fn aggressive(&self) -> bool {
        self.config.remediation.aggressive
    }

    pub fn aggressive_level(&self) -> u8 {
        self.config.remediation.aggressive_level
    }

    /// Namespace for ephemeral Jobs/Pods
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Owner stamped on every spawned object
    pub fn owner_reference(&self) -> Option<&OwnerReference> {
        self.owner.as_ref()
    }

    /// Action primitives bound to this bridge
    pub fn actions(&self) -> NodeActions<'_> {
        NodeActions::new(self)
    }

    /// Parameters every template understands
    pub(crate) fn base_params(&self, node: &str) -> TemplateParams {
        let mut params = TemplateParams::new();
        params.insert("registry".to_string(), self.config.image.registry.clone());
        params.insert(
            "repository".to_string(),
            self.config.image.repository.clone(),
        );
        params.insert("image".to_string(), self.config.image.tag.clone());
        params.insert("namespace".to_string(), self.config.namespace.clone());
        params.insert("node_name".to_string(), node.to_string());
        params.insert("region".to_string(), self.config.region.clone());
        params.insert("cluster".to_string(), self.config.cluster.clone());
        params
    }
}
