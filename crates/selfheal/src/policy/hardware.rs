//! Host hardware: disks, memory, CPU, baseboard and the node network.
//!
//! Tickets are keyed by subsystem (`disk`, `memory`, ...), so a disk fault and a PSU fault
//! on the same node are tracked separately.

use super::episode::{cleanup_node, Episode};
use super::{Policy, PolicyCore};
use crate::actions::{ActionContext, RemedyAction};
use crate::bridge::ApiBridge;
use crate::error::Result;
use crate::escalation::{restart_node, shutdown_node};
use crate::observation::{condition, FaultObservation, HardwareType};
use crate::tickets::WorkflowAction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const CONDITIONS: &[&str] = &[
    condition::DISK_FAILURE,
    condition::DISK_READ_ONLY,
    condition::MEMORY_UNCORRECTABLE,
    condition::CPU_MCE,
    condition::BASEBOARD_PSU,
    condition::BASEBOARD_FAN,
    condition::BASEBOARD_OVER_TEMPERATURE,
    condition::NETWORK_LINK_DOWN,
    condition::MEMORY_PRESSURE,
];

pub struct HardwarePolicy {
    core: PolicyCore,
}

impl Default for HardwarePolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn family(status: &FaultObservation) -> String {
    status.hardware_type.to_string()
}

impl HardwarePolicy {
    pub const fn new() -> Self {
        Self {
            core: PolicyCore::new("hardware"),
        }
    }

    async fn disk_failed(&self, bridge: &ApiBridge, node: &str) -> bool {
        match bridge.status.get_node_statuses(node, HardwareType::Disk).await {
            Ok(statuses) => statuses
                .iter()
                .any(|s| s.condition == condition::DISK_FAILURE),
            Err(e) => {
                warn!(node = %node, error = %e, "Disk status lookup failed");
                false
            }
        }
    }

    async fn remedy(
        &self,
        episode: &Episode<'_>,
        status: &FaultObservation,
        action: RemedyAction,
    ) -> Result<()> {
        let bridge = episode.bridge();
        if episode.successes(WorkflowAction::Remedy).await? >= bridge.config.thresholds.max_remedies {
            return episode
                .dispatch(format!("{} persists after {action}", status.condition))
                .await;
        }
        let component = family(status);
        let parameters = status.id.clone().unwrap_or_default();
        episode
            .attempt(
                WorkflowAction::Remedy,
                bridge.actions().remedy(
                    episode.ctx(),
                    episode.node(),
                    action,
                    &component,
                    &parameters,
                ),
            )
            .await?;
        Ok(())
    }

    async fn overheated(&self, episode: &Episode<'_>, status: &FaultObservation) -> Result<()> {
        let bridge = episode.bridge();
        let limit = bridge.config.thresholds.shutdown_temperature;
        if status.value >= limit && bridge.aggressive_level() > 1 {
            let reason = format!("baseboard at {}C, limit {limit}C", status.value);
            let result = shutdown_node(bridge, episode.ctx(), episode.key(), &reason).await;
            return episode.escalated(result).await;
        }
        episode
            .dispatch(format!("baseboard over temperature at {}C", status.value))
            .await
    }
}

#[async_trait]
impl Policy for HardwarePolicy {
    fn name(&self) -> &'static str {
        "hardware"
    }

    fn conditions(&self) -> &'static [&'static str] {
        CONDITIONS
    }

    fn create_instance(&self, bridge: Arc<ApiBridge>) -> Result<()> {
        self.core.install(bridge)
    }

    async fn evaluate(&self, node: &str, status: &FaultObservation) -> bool {
        let Ok(bridge) = self.core.bridge() else {
            return false;
        };
        if status.condition == condition::DISK_READ_ONLY && self.disk_failed(bridge, node).await {
            debug!(node = %node, "Read-only disk superseded by disk failure");
            return false;
        }
        true
    }

    #[instrument(skip(self, ctx, status), fields(condition = %status.condition))]
    async fn execute(
        &self,
        ctx: &ActionContext,
        node: &str,
        status: &FaultObservation,
    ) -> Result<()> {
        let bridge = self.core.bridge()?;
        let Some(episode) = Episode::open(bridge, ctx, &family(status), status).await? else {
            return Ok(());
        };

        match status.condition.as_str() {
            condition::DISK_READ_ONLY => {
                if episode.successes(WorkflowAction::Reboot).await? >= 1 {
                    return episode
                        .dispatch("filesystem read-only again after a reboot")
                        .await;
                }
                let component = family(status);
                let result = restart_node(bridge, ctx, episode.key(), &component, None).await;
                episode.escalated(result).await
            }
            condition::BASEBOARD_OVER_TEMPERATURE => self.overheated(&episode, status).await,
            condition::NETWORK_LINK_DOWN => {
                self.remedy(&episode, status, RemedyAction::RestartNetwork)
                    .await
            }
            condition::MEMORY_PRESSURE => self.remedy(&episode, status, RemedyAction::DropCache).await,
            _ => {
                let device = status.id.as_deref().unwrap_or("node");
                episode
                    .diagnose_and_dispatch(
                        status,
                        format!("{} on {device}, hardware replacement needed", status.condition),
                    )
                    .await
            }
        }
    }

    async fn cleanup(
        &self,
        _ctx: &ActionContext,
        node: &str,
        status: &FaultObservation,
    ) -> Result<()> {
        let bridge = self.core.bridge()?;
        cleanup_node(bridge, node, &family(status), &[], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{aggressive_config, harness, Harness};
    use crate::tickets::{TicketKey, TicketManager, TicketState};

    fn policy(h: &Harness) -> HardwarePolicy {
        let policy = HardwarePolicy::new();
        policy.create_instance(h.bridge.clone()).unwrap();
        policy
    }

    fn hot(value: i64) -> FaultObservation {
        FaultObservation::new("n1", HardwareType::Baseboard, condition::BASEBOARD_OVER_TEMPERATURE)
            .with_value(value)
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_disk_skipped_when_disk_failed() {
        let h = harness(aggressive_config());
        h.status.add_status(
            FaultObservation::new("n1", HardwareType::Disk, condition::DISK_FAILURE).with_id("nvme1n1"),
        );
        let ro = FaultObservation::new("n1", HardwareType::Disk, condition::DISK_READ_ONLY);
        assert!(!policy(&h).evaluate("n1", &ro).await);
        assert_eq!(h.cluster.mutations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overheating_needs_high_level_for_power_off() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        policy(&h)
            .execute(&ActionContext::default(), "n1", &hot(101))
            .await
            .unwrap();
        assert!(h.cluster.created_jobs().is_empty());
        let ticket = h
            .tickets
            .get_ticket(&TicketKey::new("n1", "baseboard"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.state, TicketState::DispatchedToSre);
    }

    #[tokio::test(start_paused = true)]
    async fn overheating_at_high_level_powers_off() {
        let mut config = aggressive_config();
        config.remediation.aggressive_level = 2;
        let h = harness(config);
        h.cluster.add_node("n1");
        policy(&h)
            .execute(&ActionContext::default(), "n1", &hot(101))
            .await
            .unwrap();
        assert_eq!(h.cluster.created_jobs(), vec!["shutdown-n1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_pressure_drops_caches_once() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let policy = policy(&h);
        let status = FaultObservation::new("n1", HardwareType::Memory, condition::MEMORY_PRESSURE);

        policy
            .execute(&ActionContext::default(), "n1", &status)
            .await
            .unwrap();
        policy
            .execute(&ActionContext::default(), "n1", &status)
            .await
            .unwrap();

        assert_eq!(h.cluster.created_jobs(), vec!["remedy-n1".to_string()]);
        let ticket = h
            .tickets
            .get_ticket(&TicketKey::new("n1", "memory"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.state, TicketState::DispatchedToSre);
    }

    #[tokio::test(start_paused = true)]
    async fn psu_failure_goes_straight_to_sre() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let status = FaultObservation::new("n1", HardwareType::Baseboard, condition::BASEBOARD_PSU)
            .with_id("PSU2");
        policy(&h)
            .execute(&ActionContext::default(), "n1", &status)
            .await
            .unwrap();
        let ticket = h
            .tickets
            .get_ticket(&TicketKey::new("n1", "baseboard"))
            .await
            .unwrap()
            .unwrap();
        assert!(ticket.why_sre[0].contains("PSU2"));
        assert!(h.cluster.created_jobs().is_empty());
    }
}
