//! Ticket Management
//!
//! A ticket tracks one remediation case per (node, condition family). The engine reads and
//! appends to tickets through [`TicketManager`]; it never persists ticket state itself.
//!
//! Lifecycle: `Created → Adopted → {root causes, diagnoses, workflows accumulate} →
//! Resolved | Closed | DispatchedToSre`. Resolved and Closed tickets move to the node's
//! history, which backs the "N of the last M tickets" frequency test.

mod book;
mod configmap;
mod store;

pub use book::TicketBook;
pub use configmap::ConfigMapStore;
pub use store::{MemoryStore, StoredTicketManager, TicketStore};

use crate::error::Result;
use crate::observation::FaultObservation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ticket manager keeping tickets in memory
pub type MemoryTicketManager = StoredTicketManager<MemoryStore>;

/// Ticket manager keeping one ConfigMap per node
pub type ConfigMapTicketManager = StoredTicketManager<ConfigMapStore>;

/// Identifies the open ticket for a node and condition family
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TicketKey {
    pub node: String,
    pub family: String,
}

impl TicketKey {
    pub fn new(node: impl Into<String>, family: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            family: family.into(),
        }
    }
}

impl fmt::Display for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.family)
    }
}

/// Ticket lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketState {
    Created,
    Adopted,
    Resolved,
    Closed,
    DispatchedToSre,
}

impl TicketState {
    /// Resolved and Closed tickets are history
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketState::Resolved | TicketState::Closed)
    }
}

/// Remediation step recorded on a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowAction {
    HealthCheck,
    Reboot,
    Drain,
    Remedy,
    Repair,
    RestartPod,
    SleepWait,
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

/// One recorded remediation attempt. Append-only on the ticket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub action: WorkflowAction,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Evidence attached to a ticket each time the fault is observed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootCauseDescription {
    pub timestamps: Vec<DateTime<Utc>>,
    pub observations: Vec<FaultObservation>,
}

impl RootCauseDescription {
    /// Time of the first observation
    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.timestamps.iter().min().copied()
    }
}

/// One diagnostic finding parsed from a diagnose pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    pub hint: String,
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

/// Full ticket state as stored by a [`TicketStore`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub node: String,
    pub family: String,
    /// Set for component tickets (device plugin, kubelet)
    #[serde(default)]
    pub component: Option<String>,
    pub title: String,
    pub state: TicketState,
    /// Condition of the observation that opened the ticket
    #[serde(default)]
    pub condition: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub root_cause: RootCauseDescription,
    #[serde(default)]
    pub why_sre: Vec<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub diagnoses: Vec<DiagnosisRecord>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub shutdown_description: Option<String>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub reason: String,
    pub message: String,
}

/// Ticket workflow contract consumed by the policies.
#[async_trait]
pub trait TicketManager: Send + Sync {
    async fn check_ticket_exists(&self, key: &TicketKey) -> Result<bool>;

    /// Families with an open ticket on the node, including tickets with SRE
    async fn open_families(&self, node: &str) -> Result<Vec<String>>;

    /// Current open ticket, if any
    async fn get_ticket(&self, key: &TicketKey) -> Result<Option<Ticket>>;

    async fn create_ticket(&self, key: &TicketKey, title: &str) -> Result<()>;

    async fn create_component_ticket(
        &self,
        key: &TicketKey,
        component: &str,
        title: &str,
    ) -> Result<()>;

    async fn adopt_ticket(&self, key: &TicketKey) -> Result<()>;

    /// Returns the number of observations recorded so far
    async fn add_root_cause_description(
        &self,
        key: &TicketKey,
        status: &FaultObservation,
    ) -> Result<usize>;

    async fn get_root_cause_description(&self, key: &TicketKey) -> Result<RootCauseDescription>;

    async fn add_why_sre(&self, key: &TicketKey, why: &str) -> Result<()>;

    async fn add_conclusion(&self, key: &TicketKey, conclusion: &str) -> Result<()>;

    async fn add_diagnosis(&self, key: &TicketKey, records: &[DiagnosisRecord]) -> Result<()>;

    async fn add_workflow(
        &self,
        key: &TicketKey,
        action: WorkflowAction,
        status: WorkflowStatus,
        message: Option<&str>,
    ) -> Result<()>;

    /// Updates the most recent workflow with this action
    async fn update_workflow(
        &self,
        key: &TicketKey,
        action: WorkflowAction,
        status: WorkflowStatus,
        message: Option<&str>,
    ) -> Result<()>;

    async fn get_workflows(&self, key: &TicketKey) -> Result<Vec<Workflow>>;

    /// Number of Succeeded workflows with this action
    async fn get_action_count(&self, key: &TicketKey, action: WorkflowAction) -> Result<usize>;

    /// At least `threshold` of the node's last `last_n` tickets share this ticket's condition
    async fn is_frequent_issue(
        &self,
        key: &TicketKey,
        last_n: usize,
        threshold: usize,
    ) -> Result<bool>;

    async fn dispatch_ticket_to_sre(&self, key: &TicketKey) -> Result<()>;

    async fn resolve_ticket(&self, key: &TicketKey, reason: &str, message: &str) -> Result<()>;

    async fn close_ticket(&self, key: &TicketKey) -> Result<()>;

    async fn add_shutdown_description(&self, key: &TicketKey, description: &str) -> Result<()>;

    async fn update_shutdown_description(&self, key: &TicketKey, description: &str)
        -> Result<()>;
}
