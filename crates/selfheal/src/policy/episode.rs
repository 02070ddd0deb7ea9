//! The part of `execute` every policy shares.

use crate::actions::ActionContext;
use crate::bridge::ApiBridge;
use crate::error::{Error, Result};
use crate::escalation::{self, record_step, EscalationOutcome};
use crate::observation::FaultObservation;
use crate::tickets::{TicketKey, TicketState, WorkflowAction};
use std::future::Future;
use tracing::{info, warn};

/// One Execute call against an open, adopted ticket
pub struct Episode<'a> {
    bridge: &'a ApiBridge,
    ctx: &'a ActionContext,
    key: TicketKey,
}

impl<'a> Episode<'a> {
    /// Cordons the node, creates or reuses the family's ticket, adopts it and attaches the
    /// observation as root-cause evidence.
    ///
    /// Returns `None` when the ticket is already with SRE: the evidence is still recorded
    /// but automation stays hands-off.
    pub async fn open(
        bridge: &'a ApiBridge,
        ctx: &'a ActionContext,
        family: &str,
        status: &FaultObservation,
    ) -> Result<Option<Episode<'a>>> {
        Self::open_with(bridge, ctx, family, None, status).await
    }

    /// Same as [`Episode::open`] with a component ticket
    pub async fn open_component(
        bridge: &'a ApiBridge,
        ctx: &'a ActionContext,
        family: &str,
        component: &str,
        status: &FaultObservation,
    ) -> Result<Option<Episode<'a>>> {
        Self::open_with(bridge, ctx, family, Some(component), status).await
    }

    async fn open_with(
        bridge: &'a ApiBridge,
        ctx: &'a ActionContext,
        family: &str,
        component: Option<&str>,
        status: &FaultObservation,
    ) -> Result<Option<Episode<'a>>> {
        let node = status.node_name.as_str();
        let key = TicketKey::new(node, family);
        let tickets = bridge.tickets.as_ref();

        bridge.actions().cordon(node).await?;

        match tickets.get_ticket(&key).await? {
            Some(ticket) if ticket.state == TicketState::DispatchedToSre => {
                tickets.add_root_cause_description(&key, status).await?;
                info!(ticket = %key, condition = %status.condition, "Ticket is with SRE, recorded observation only");
                return Ok(None);
            }
            Some(_) => {}
            None => match component {
                Some(component) => {
                    tickets
                        .create_component_ticket(&key, component, &status.title())
                        .await?;
                }
                None => tickets.create_ticket(&key, &status.title()).await?,
            },
        }

        tickets.adopt_ticket(&key).await?;
        let seen = tickets.add_root_cause_description(&key, status).await?;
        info!(ticket = %key, condition = %status.condition, seen, "Episode opened");

        Ok(Some(Episode { bridge, ctx, key }))
    }

    pub fn key(&self) -> &TicketKey {
        &self.key
    }

    pub fn node(&self) -> &str {
        &self.key.node
    }

    pub fn bridge(&self) -> &'a ApiBridge {
        self.bridge
    }

    pub fn ctx(&self) -> &'a ActionContext {
        self.ctx
    }

    /// Successful workflows of this kind on the ticket
    pub async fn successes(&self, action: WorkflowAction) -> Result<usize> {
        self.bridge
            .tickets
            .get_action_count(&self.key, action)
            .await
    }

    /// "N of the node's last M tickets" test with the configured thresholds
    pub async fn is_frequent(&self) -> Result<bool> {
        let thresholds = &self.bridge.config.thresholds;
        self.bridge
            .tickets
            .is_frequent_issue(
                &self.key,
                thresholds.frequency_last_n,
                thresholds.frequency_threshold,
            )
            .await
    }

    /// Hands the ticket to SRE
    pub async fn dispatch(&self, why: impl Into<String>) -> Result<()> {
        let outcome = escalation::dispatch_to_sre(self.bridge.tickets.as_ref(), &self.key, why).await?;
        if let EscalationOutcome::Dispatched(why) = outcome {
            warn!(ticket = %self.key, why = %why, "Automation stopped");
        }
        Ok(())
    }

    /// Best-effort diagnostics, then SRE. Diagnostics only run when aggressive.
    pub async fn diagnose_and_dispatch(
        &self,
        status: &FaultObservation,
        why: impl Into<String>,
    ) -> Result<()> {
        if self.bridge.aggressive() {
            match escalation::diagnose_node(self.bridge, self.ctx, &self.key, status).await {
                Ok(_) => {}
                Err(e) if e.is_deferrable() => return Err(e),
                Err(e) => warn!(ticket = %self.key, error = %e, "Diagnostics failed"),
            }
        }
        self.dispatch(why).await
    }

    /// Runs one primitive as a workflow step behind the aggressiveness gate.
    ///
    /// `Ok(None)` means the step did not succeed and the ticket went to SRE.
    pub async fn attempt<T, F>(&self, action: WorkflowAction, step: F) -> Result<Option<T>>
    where
        F: Future<Output = Result<T>>,
    {
        if !self.bridge.aggressive() {
            self.fail(Error::NotAggressive).await?;
            return Ok(None);
        }
        match record_step(self.bridge.tickets.as_ref(), &self.key, action, step).await {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.fail(e).await?;
                Ok(None)
            }
        }
    }

    /// Folds an escalation helper's result into the episode
    pub async fn escalated(&self, result: Result<EscalationOutcome>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) => self.fail(e).await,
        }
    }

    /// Deferrable errors are returned so the next observation retries; anything else
    /// sends the ticket to SRE.
    pub async fn fail(&self, err: Error) -> Result<()> {
        if err.is_deferrable() {
            info!(ticket = %self.key, error = %err, "Remediation deferred");
            return Err(err);
        }
        let why = match err {
            Error::NotAggressive => "aggressive remediation disabled, manual action required".to_string(),
            other => format!("remediation failed: {other}"),
        };
        self.dispatch(why).await
    }

    pub async fn resolve(&self, reason: &str, message: &str) -> Result<()> {
        self.bridge
            .tickets
            .resolve_ticket(&self.key, reason, message)
            .await?;
        release_node(self.bridge, self.node()).await?;
        Ok(())
    }
}

/// Lifts our cordon once no family on the node has an open ticket left
async fn release_node(bridge: &ApiBridge, node: &str) -> Result<bool> {
    let held = bridge.tickets.open_families(node).await?;
    if !held.is_empty() {
        info!(node = %node, families = ?held, "Node still has open tickets, keeping cordon");
        return Ok(false);
    }
    bridge.actions().uncordon_if_owned(node).await
}

/// Undoes fault markers for a cleared fault: labels, the taint if given, the family's open
/// ticket, and our cordon when no other family still holds the node.
pub async fn cleanup_node(
    bridge: &ApiBridge,
    node: &str,
    family: &str,
    labels: &[&str],
    taint: Option<&str>,
) -> Result<()> {
    let actions = bridge.actions();
    for label in labels {
        actions.remove_fault_label(node, label).await?;
    }
    if let Some(taint) = taint {
        actions.remove_fault_taint(node, taint).await?;
    }

    let key = TicketKey::new(node, family);
    if bridge.tickets.check_ticket_exists(&key).await? {
        bridge.tickets.add_conclusion(&key, "fault cleared").await?;
        bridge.tickets.close_ticket(&key).await?;
    }
    release_node(bridge, node).await?;
    Ok(())
}
