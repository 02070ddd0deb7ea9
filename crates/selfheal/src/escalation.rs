//! Escalation helpers.
//!
//! Destructive actions go through these wrappers, never straight to the primitives. Each
//! one applies the gates in order:
//!
//! 1. `aggressive` must be on, otherwise [`Error::NotAggressive`] with nothing touched
//! 2. the ticket's root cause must be younger than the remediation TTL (48h at level 1,
//!    96h above), otherwise the ticket goes to SRE
//! 3. restarts only: more than one successful reboot on the ticket goes to SRE
//!
//! Every step that passes the gates is recorded as a ticket workflow.

use crate::actions::{sleep_wait, AbortPredicate, ActionContext, RemedyAction};
use crate::bridge::ApiBridge;
use crate::error::{Error, Result};
use crate::observation::FaultObservation;
use crate::tickets::{DiagnosisRecord, TicketKey, TicketManager, WorkflowAction, WorkflowStatus};
use chrono::{Duration, Utc};
use std::future::Future;
use tracing::{info, instrument, warn};

/// Root-cause age after which automation gives up at level 1
pub const LEVEL_ONE_TTL_HOURS: i64 = 48;

/// Root-cause age after which automation gives up above level 1
pub const HIGH_LEVEL_TTL_HOURS: i64 = 96;

/// Successful reboots allowed before the fault is assumed to be hardware
pub const MAX_SUCCESSFUL_REBOOTS: usize = 1;

/// How an escalation helper finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// The remediation ran to completion
    Completed,
    /// A gate handed the ticket to SRE; carries the reason
    Dispatched(String),
}

impl EscalationOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, EscalationOutcome::Dispatched(_))
    }
}

/// Give-up deadline for the configured aggressiveness level. Level 0 is treated as level 1.
pub fn remediation_ttl(level: u8) -> Duration {
    if level > 1 {
        Duration::hours(HIGH_LEVEL_TTL_HOURS)
    } else {
        Duration::hours(LEVEL_ONE_TTL_HOURS)
    }
}

/// Runs `step` bracketed by a `Running` workflow and its terminal status.
///
/// A deferrable error (cancellation, abandoned wait) is recorded as `Canceled`,
/// anything else as `Failed` with the error message.
pub async fn record_step<T, F>(
    tickets: &dyn TicketManager,
    key: &TicketKey,
    action: WorkflowAction,
    step: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tickets
        .add_workflow(key, action, WorkflowStatus::Running, None)
        .await?;

    match step.await {
        Ok(value) => {
            tickets
                .update_workflow(key, action, WorkflowStatus::Succeeded, None)
                .await?;
            Ok(value)
        }
        Err(e) => {
            let status = if e.is_deferrable() {
                WorkflowStatus::Canceled
            } else {
                WorkflowStatus::Failed
            };
            let message = e.to_string();
            if let Err(update) = tickets
                .update_workflow(key, action, status, Some(&message))
                .await
            {
                warn!(ticket = %key, %action, error = %update, "Failed to record workflow outcome");
            }
            Err(e)
        }
    }
}

/// Records why and hands the ticket to SRE
pub async fn dispatch_to_sre(
    tickets: &dyn TicketManager,
    key: &TicketKey,
    why: impl Into<String>,
) -> Result<EscalationOutcome> {
    let why = why.into();
    tickets.add_why_sre(key, &why).await?;
    tickets.dispatch_ticket_to_sre(key).await?;
    Ok(EscalationOutcome::Dispatched(why))
}

fn require_aggressive(bridge: &ApiBridge) -> Result<()> {
    if bridge.aggressive() {
        Ok(())
    } else {
        Err(Error::NotAggressive)
    }
}

/// Returns the SRE reason when the root cause has outlived the TTL
async fn ttl_expired(bridge: &ApiBridge, key: &TicketKey) -> Result<Option<String>> {
    let root_cause = bridge.tickets.get_root_cause_description(key).await?;
    let Some(first_seen) = root_cause.first_seen() else {
        return Ok(None);
    };
    let ttl = remediation_ttl(bridge.aggressive_level());
    let age = Utc::now() - first_seen;
    if age > ttl {
        return Ok(Some(format!(
            "fault first seen {}h ago, beyond the {}h remediation window",
            age.num_hours(),
            ttl.num_hours()
        )));
    }
    Ok(None)
}

/// Reboots the node, then runs the post-reboot repair and lets it settle.
///
/// `abort_if` is polled on every tick of the reboot wait; when it fires the wait is
/// abandoned and the Reboot workflow is recorded as `Canceled`.
#[instrument(skip(bridge, ctx, abort_if), fields(ticket = %key))]
pub async fn restart_node(
    bridge: &ApiBridge,
    ctx: &ActionContext,
    key: &TicketKey,
    component: &str,
    abort_if: Option<AbortPredicate>,
) -> Result<EscalationOutcome> {
    require_aggressive(bridge)?;
    let tickets = bridge.tickets.as_ref();

    if let Some(why) = ttl_expired(bridge, key).await? {
        warn!(ticket = %key, "Restart window expired, dispatching to SRE");
        return dispatch_to_sre(tickets, key, why).await;
    }

    let reboots = tickets
        .get_action_count(key, WorkflowAction::Reboot)
        .await?;
    if reboots > MAX_SUCCESSFUL_REBOOTS {
        warn!(ticket = %key, reboots, "Node keeps failing after reboots, dispatching to SRE");
        return dispatch_to_sre(
            tickets,
            key,
            format!("{reboots} successful reboots did not clear the fault, suspect hardware"),
        )
        .await;
    }

    let node = key.node.as_str();
    let actions = bridge.actions();
    let reboot_ctx = match abort_if {
        Some(predicate) => ctx.with_abort(predicate),
        None => ctx.clone(),
    };

    record_step(
        tickets,
        key,
        WorkflowAction::Reboot,
        actions.graceful_restart(&reboot_ctx, node),
    )
    .await?;
    record_step(
        tickets,
        key,
        WorkflowAction::Repair,
        actions.repair(ctx, node, RemedyAction::PostReboot, component),
    )
    .await?;
    record_step(
        tickets,
        key,
        WorkflowAction::SleepWait,
        sleep_wait(ctx, bridge.config.timeouts.sleep_wait()),
    )
    .await?;

    info!(ticket = %key, "🔄 Restart sequence completed");
    Ok(EscalationOutcome::Completed)
}

/// Powers the node off and hands the ticket to SRE for the physical follow-up
#[instrument(skip(bridge, ctx), fields(ticket = %key))]
pub async fn shutdown_node(
    bridge: &ApiBridge,
    ctx: &ActionContext,
    key: &TicketKey,
    reason: &str,
) -> Result<EscalationOutcome> {
    require_aggressive(bridge)?;
    let tickets = bridge.tickets.as_ref();

    if let Some(why) = ttl_expired(bridge, key).await? {
        warn!(ticket = %key, "Shutdown window expired, dispatching to SRE");
        return dispatch_to_sre(tickets, key, why).await;
    }

    tickets
        .add_shutdown_description(key, &format!("shutdown requested: {reason}"))
        .await?;

    if let Err(e) = bridge.actions().graceful_shutdown(ctx, &key.node).await {
        tickets
            .update_shutdown_description(key, &format!("shutdown failed: {e}"))
            .await?;
        return Err(e);
    }

    tickets
        .update_shutdown_description(
            key,
            &format!("node powered off at {}", Utc::now().to_rfc3339()),
        )
        .await?;
    info!(ticket = %key, "⏻ Node powered off, handing over to SRE");
    dispatch_to_sre(tickets, key, format!("node powered off: {reason}")).await
}

/// Collects diagnostics for the ticket
#[instrument(skip(bridge, ctx, status), fields(ticket = %key))]
pub async fn diagnose_node(
    bridge: &ApiBridge,
    ctx: &ActionContext,
    key: &TicketKey,
    status: &FaultObservation,
) -> Result<Vec<DiagnosisRecord>> {
    require_aggressive(bridge)?;
    let records = bridge.actions().diagnose(ctx, &key.node, status).await?;
    if !records.is_empty() {
        bridge.tickets.add_diagnosis(key, &records).await?;
    }
    Ok(records)
}
