use super::{
    DiagnosisRecord, Resolution, Ticket, TicketKey, TicketState, Workflow, WorkflowAction,
    WorkflowStatus,
};
use crate::error::{Error, Result};
use crate::observation::FaultObservation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All tickets of one node: open tickets by family plus closed history (newest last).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketBook {
    #[serde(default)]
    pub open: BTreeMap<String, Ticket>,
    #[serde(default)]
    pub history: Vec<Ticket>,
}

impl TicketBook {
    pub fn get(&self, key: &TicketKey) -> Option<&Ticket> {
        self.open.get(&key.family)
    }

    pub fn get_mut(&mut self, key: &TicketKey) -> Result<&mut Ticket> {
        self.open
            .get_mut(&key.family)
            .ok_or_else(|| Error::TicketError(format!("no open ticket for {key}")))
    }

    /// Opens a ticket unless one is already open for the key
    pub fn create(
        &mut self,
        key: &TicketKey,
        component: Option<&str>,
        title: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if self.open.contains_key(&key.family) {
            return false;
        }
        let ticket = Ticket {
            id: uuid::Uuid::new_v4().to_string(),
            node: key.node.clone(),
            family: key.family.clone(),
            component: component.map(str::to_string),
            title: title.to_string(),
            state: TicketState::Created,
            condition: None,
            created_at: now,
            updated_at: now,
            root_cause: super::RootCauseDescription::default(),
            why_sre: Vec::new(),
            conclusion: None,
            diagnoses: Vec::new(),
            workflows: Vec::new(),
            shutdown_description: None,
            resolution: None,
        };
        self.open.insert(key.family.clone(), ticket);
        true
    }

    pub fn adopt(&mut self, key: &TicketKey, now: DateTime<Utc>) -> Result<()> {
        let ticket = self.get_mut(key)?;
        if ticket.state == TicketState::Created {
            ticket.state = TicketState::Adopted;
            ticket.updated_at = now;
        }
        Ok(())
    }

    pub fn add_root_cause(
        &mut self,
        key: &TicketKey,
        status: &FaultObservation,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let ticket = self.get_mut(key)?;
        if ticket.condition.is_none() {
            ticket.condition = Some(status.condition.clone());
        }
        ticket.root_cause.timestamps.push(now);
        ticket.root_cause.observations.push(status.clone());
        ticket.updated_at = now;
        Ok(ticket.root_cause.observations.len())
    }

    pub fn add_diagnosis(
        &mut self,
        key: &TicketKey,
        records: &[DiagnosisRecord],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ticket = self.get_mut(key)?;
        ticket.diagnoses.extend_from_slice(records);
        ticket.updated_at = now;
        Ok(())
    }

    pub fn add_workflow(
        &mut self,
        key: &TicketKey,
        action: WorkflowAction,
        status: WorkflowStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ticket = self.get_mut(key)?;
        ticket.workflows.push(Workflow {
            action,
            status,
            message: message.map(str::to_string),
            started_at: now,
            updated_at: now,
        });
        ticket.updated_at = now;
        Ok(())
    }

    pub fn update_workflow(
        &mut self,
        key: &TicketKey,
        action: WorkflowAction,
        status: WorkflowStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let ticket = self.get_mut(key)?;
        let workflow = ticket
            .workflows
            .iter_mut()
            .rev()
            .find(|w| w.action == action)
            .ok_or_else(|| {
                Error::TicketError(format!("no {action} workflow recorded on {key}"))
            })?;
        workflow.status = status;
        if let Some(message) = message {
            workflow.message = Some(message.to_string());
        }
        workflow.updated_at = now;
        ticket.updated_at = now;
        Ok(())
    }

    pub fn action_count(&self, key: &TicketKey, action: WorkflowAction) -> usize {
        self.get(key).map_or(0, |ticket| {
            ticket
                .workflows
                .iter()
                .filter(|w| w.action == action && w.status == WorkflowStatus::Succeeded)
                .count()
        })
    }

    /// Counts the node's newest `last_n` tickets (open and closed) whose opening condition
    /// matches the open ticket's, and compares against `threshold`.
    pub fn is_frequent(&self, key: &TicketKey, last_n: usize, threshold: usize) -> bool {
        let Some(current) = self.get(key) else {
            return false;
        };
        let condition = current.condition.as_deref().unwrap_or(&current.family);

        let mut tickets: Vec<&Ticket> = self.history.iter().chain(self.open.values()).collect();
        tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let matching = tickets
            .into_iter()
            .take(last_n)
            .filter(|t| t.condition.as_deref().unwrap_or(&t.family) == condition)
            .count();
        matching >= threshold
    }

    pub fn dispatch_to_sre(&mut self, key: &TicketKey, now: DateTime<Utc>) -> Result<()> {
        let ticket = self.get_mut(key)?;
        ticket.state = TicketState::DispatchedToSre;
        ticket.updated_at = now;
        Ok(())
    }

    /// Moves the open ticket to history in a terminal state
    pub fn finish(
        &mut self,
        key: &TicketKey,
        state: TicketState,
        resolution: Option<Resolution>,
        history_depth: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(Error::TicketError(format!(
                "{state:?} does not finish ticket {key}"
            )));
        }
        let mut ticket = self
            .open
            .remove(&key.family)
            .ok_or_else(|| Error::TicketError(format!("no open ticket for {key}")))?;
        ticket.state = state;
        ticket.resolution = resolution;
        ticket.updated_at = now;
        self.history.push(ticket);
        if self.history.len() > history_depth {
            let excess = self.history.len() - history_depth;
            self.history.drain(..excess);
        }
        Ok(())
    }
}
