//! GPU family: hangs, Xid errors, memory failures, thermal issues and the GPU-side
//! daemons (fabric manager, peer memory).

use super::episode::{cleanup_node, Episode};
use super::{Policy, PolicyCore};
use crate::actions::{labels, ActionContext, RemedyAction};
use crate::bridge::ApiBridge;
use crate::error::Result;
use crate::escalation::restart_node;
use crate::observation::{condition, FaultObservation, HardwareType};
use crate::tickets::WorkflowAction;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const FAMILY: &str = "gpu";

/// Xids caused by applications or drivers recovering on their own
const IGNORED_XIDS: &[i64] = &[13, 31, 43, 45, 68];

/// Xids a reboot is known to clear
const REBOOT_XIDS: &[i64] = &[48, 63, 64, 74, 79, 92, 94, 95, 119, 120];

/// Conditions that mean the board itself must be replaced
const SUPERSEDING: &[&str] = &[
    condition::GPU_ROW_REMAP_FAILURE,
    condition::GPU_SRAM_UNCORRECTABLE,
];

const CONDITIONS: &[&str] = &[
    condition::GPU_HUNG,
    condition::GPU_XID,
    condition::GPU_LOST,
    condition::GPU_ROW_REMAP_FAILURE,
    condition::GPU_SRAM_UNCORRECTABLE,
    condition::GPU_CHECK_FAILED,
    condition::GPU_HIGH_TEMPERATURE,
    condition::GPU_CLOCK_THROTTLE,
    condition::FABRIC_MANAGER_DOWN,
    condition::PEER_MEM_UNLOADED,
];

/// What the GPU policy does for an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuStrategy {
    /// Reboot through the escalation gates
    Reboot,
    /// Run a host-side remedy, reboot once remedies stop helping
    Remedy(RemedyAction),
    /// Taint, diagnose and hand over for board replacement
    Replace,
    /// Health check; resolve if it passes
    Throttle,
    /// Unclassified fault: diagnose and hand over
    Escalate,
}

impl GpuStrategy {
    /// `None` for observations the policy ignores
    pub fn for_status(status: &FaultObservation) -> Option<Self> {
        match status.condition.as_str() {
            condition::GPU_HUNG | condition::GPU_LOST => Some(GpuStrategy::Reboot),
            condition::GPU_XID if IGNORED_XIDS.contains(&status.value) => None,
            condition::GPU_XID if REBOOT_XIDS.contains(&status.value) => Some(GpuStrategy::Reboot),
            condition::GPU_XID => Some(GpuStrategy::Escalate),
            condition::GPU_ROW_REMAP_FAILURE
            | condition::GPU_SRAM_UNCORRECTABLE
            | condition::GPU_CHECK_FAILED => Some(GpuStrategy::Replace),
            condition::GPU_HIGH_TEMPERATURE | condition::GPU_CLOCK_THROTTLE => {
                Some(GpuStrategy::Throttle)
            }
            condition::FABRIC_MANAGER_DOWN => {
                Some(GpuStrategy::Remedy(RemedyAction::RestartFabricmanager))
            }
            condition::PEER_MEM_UNLOADED => Some(GpuStrategy::Remedy(RemedyAction::ConfigPeerMem)),
            _ => None,
        }
    }
}

pub struct GpuPolicy {
    core: PolicyCore,
}

impl Default for GpuPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuPolicy {
    pub const fn new() -> Self {
        Self {
            core: PolicyCore::new("gpu"),
        }
    }

    /// A pending board replacement makes softer GPU remediation pointless
    async fn superseded(&self, bridge: &ApiBridge, node: &str, status: &FaultObservation) -> bool {
        match bridge.status.get_node_statuses(node, HardwareType::Gpu).await {
            Ok(statuses) => statuses.iter().any(|s| {
                s.condition != status.condition && SUPERSEDING.contains(&s.condition.as_str())
            }),
            Err(e) => {
                warn!(node = %node, error = %e, "GPU status lookup failed, not superseding");
                false
            }
        }
    }

    async fn fully_allocated(&self, bridge: &ApiBridge, node: &str) -> bool {
        match bridge.status.get_node_gpu_statuses(node).await {
            Ok(gpus) => !gpus.is_empty() && gpus.iter().all(|g| g.allocated),
            Err(e) => {
                warn!(node = %node, error = %e, "GPU allocation lookup failed");
                false
            }
        }
    }

    async fn reboot(&self, episode: &Episode<'_>, status: &FaultObservation) -> Result<()> {
        let thresholds = &episode.bridge().config.thresholds;
        let reboots = episode.successes(WorkflowAction::Reboot).await?;
        if reboots >= thresholds.max_reboots {
            return episode
                .diagnose_and_dispatch(
                    status,
                    format!("{} persists after {reboots} successful reboots", status.condition),
                )
                .await;
        }
        if episode.is_frequent().await? {
            return episode
                .diagnose_and_dispatch(
                    status,
                    format!("{} keeps recurring on this node", status.condition),
                )
                .await;
        }
        let result = restart_node(
            episode.bridge(),
            episode.ctx(),
            episode.key(),
            FAMILY,
            None,
        )
        .await;
        episode.escalated(result).await
    }

    async fn remedy(
        &self,
        episode: &Episode<'_>,
        status: &FaultObservation,
        action: RemedyAction,
    ) -> Result<()> {
        let max_remedies = episode.bridge().config.thresholds.max_remedies;
        if episode.successes(WorkflowAction::Remedy).await? >= max_remedies {
            info!(ticket = %episode.key(), action = %action, "Remedy did not hold, rebooting");
            return self.reboot(episode, status).await;
        }
        let parameters = status.id.clone().unwrap_or_default();
        episode
            .attempt(
                WorkflowAction::Remedy,
                episode.bridge().actions().remedy(
                    episode.ctx(),
                    episode.node(),
                    action,
                    FAMILY,
                    &parameters,
                ),
            )
            .await?;
        Ok(())
    }

    async fn replace(&self, episode: &Episode<'_>, status: &FaultObservation) -> Result<()> {
        episode
            .bridge()
            .actions()
            .add_fault_taint(episode.node(), labels::GPU_UNHEALTHY_TAINT)
            .await?;
        let device = status.id.as_deref().unwrap_or("unknown");
        episode
            .diagnose_and_dispatch(
                status,
                format!("GPU {device} reports {}, board needs replacement", status.condition),
            )
            .await
    }

    async fn throttle(&self, episode: &Episode<'_>) -> Result<()> {
        let Some(report) = episode
            .attempt(
                WorkflowAction::HealthCheck,
                episode
                    .bridge()
                    .actions()
                    .health_check(episode.ctx(), episode.node()),
            )
            .await?
        else {
            return Ok(());
        };
        if report.is_healthy() {
            return episode
                .resolve("HealthCheckPassed", "GPU health check passed after throttling")
                .await;
        }
        episode
            .dispatch(format!(
                "health check failed with exit code {} ({} {})",
                report.exit_code, report.hardware_type, report.condition
            ))
            .await
    }
}

#[async_trait]
impl Policy for GpuPolicy {
    fn name(&self) -> &'static str {
        "gpu"
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
        let Some(strategy) = GpuStrategy::for_status(status) else {
            debug!(node = %node, condition = %status.condition, xid = status.value, "Ignoring GPU event");
            return false;
        };
        let soft = matches!(
            strategy,
            GpuStrategy::Reboot | GpuStrategy::Escalate | GpuStrategy::Throttle
        );
        if soft && self.superseded(bridge, node, status).await {
            debug!(node = %node, "GPU fault superseded by pending replacement");
            return false;
        }
        if strategy == GpuStrategy::Throttle && self.fully_allocated(bridge, node).await {
            debug!(node = %node, "All GPUs in use, not interrupting for throttling");
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
        let Some(strategy) = GpuStrategy::for_status(status) else {
            return Ok(());
        };
        let Some(episode) = Episode::open(bridge, ctx, FAMILY, status).await? else {
            return Ok(());
        };

        match strategy {
            GpuStrategy::Reboot => self.reboot(&episode, status).await,
            GpuStrategy::Remedy(action) => self.remedy(&episode, status, action).await,
            GpuStrategy::Replace => self.replace(&episode, status).await,
            GpuStrategy::Throttle => self.throttle(&episode).await,
            GpuStrategy::Escalate => {
                episode
                    .diagnose_and_dispatch(
                        status,
                        format!("unclassified Xid {} on GPU", status.value),
                    )
                    .await
            }
        }
    }

    async fn cleanup(
        &self,
        _ctx: &ActionContext,
        node: &str,
        _status: &FaultObservation,
    ) -> Result<()> {
        let bridge = self.core.bridge()?;
        cleanup_node(bridge, node, FAMILY, &[], Some(labels::GPU_UNHEALTHY_TAINT)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::status::{GpuStatus, MockStatusQuery};
    use crate::testing::{aggressive_config, harness, harness_with_status, FakeOutcome, Harness};
    use crate::tickets::{TicketKey, TicketManager, TicketState, WorkflowStatus};

    fn hung() -> FaultObservation {
        FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_HUNG)
    }

    fn policy(h: &Harness) -> GpuPolicy {
        let policy = GpuPolicy::new();
        policy.create_instance(h.bridge.clone()).unwrap();
        policy
    }

    fn key() -> TicketKey {
        TicketKey::new("n1", FAMILY)
    }

    #[test]
    fn strategy_table() {
        let xid = |v| FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_XID).with_value(v);
        assert_eq!(GpuStrategy::for_status(&xid(79)), Some(GpuStrategy::Reboot));
        assert_eq!(GpuStrategy::for_status(&xid(13)), None);
        assert_eq!(GpuStrategy::for_status(&xid(61)), Some(GpuStrategy::Escalate));
        assert_eq!(
            GpuStrategy::for_status(&FaultObservation::new(
                "n1",
                HardwareType::Gpu,
                condition::FABRIC_MANAGER_DOWN
            )),
            Some(GpuStrategy::Remedy(RemedyAction::RestartFabricmanager))
        );
        assert_eq!(GpuStrategy::for_status(&hung()), Some(GpuStrategy::Reboot));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_gpu_without_aggressive_goes_to_sre() {
        let h = harness(EngineConfig::default());
        h.cluster.add_node("n1");
        let policy = policy(&h);

        assert!(policy.evaluate("n1", &hung()).await);
        policy
            .execute(&ActionContext::default(), "n1", &hung())
            .await
            .unwrap();

        assert_eq!(h.cluster.node_patches(), 1);
        assert!(h.cluster.created_jobs().is_empty());
        let ticket = h.tickets.get_ticket(&key()).await.unwrap().unwrap();
        assert_eq!(ticket.state, TicketState::DispatchedToSre);
        assert!(ticket.why_sre[0].contains("aggressive remediation disabled"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_gpu_reboots_then_repairs() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let policy = policy(&h);

        policy
            .execute(&ActionContext::default(), "n1", &hung())
            .await
            .unwrap();

        assert_eq!(
            h.cluster.created_jobs(),
            vec!["reboot-n1".to_string(), "repair-n1".to_string()]
        );
        let ticket = h.tickets.get_ticket(&key()).await.unwrap().unwrap();
        assert_eq!(ticket.state, TicketState::Adopted);
        assert!(ticket
            .workflows
            .iter()
            .all(|w| w.status == WorkflowStatus::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn third_reboot_is_refused() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let policy = policy(&h);
        h.tickets.create_ticket(&key(), "GPU hung").await.unwrap();
        for _ in 0..2 {
            h.tickets
                .add_workflow(&key(), WorkflowAction::Reboot, WorkflowStatus::Succeeded, None)
                .await
                .unwrap();
        }

        policy
            .execute(&ActionContext::default(), "n1", &hung())
            .await
            .unwrap();

        assert!(h.cluster.created_jobs().is_empty());
        assert_eq!(h.cluster.created_pods(), vec!["diagnose-n1".to_string()]);
        let ticket = h.tickets.get_ticket(&key()).await.unwrap().unwrap();
        assert_eq!(ticket.state, TicketState::DispatchedToSre);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reboot_goes_to_sre() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        h.cluster.set_outcome("reboot-", FakeOutcome::Failed);
        let policy = policy(&h);

        policy
            .execute(&ActionContext::default(), "n1", &hung())
            .await
            .unwrap();
        let ticket = h.tickets.get_ticket(&key()).await.unwrap().unwrap();
        assert_eq!(ticket.state, TicketState::DispatchedToSre);
        assert_eq!(ticket.workflows[0].status, WorkflowStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn ignored_xid_never_mutates() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let policy = policy(&h);
        let status = FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_XID).with_value(13);

        assert!(!policy.evaluate("n1", &status).await);
        assert_eq!(h.cluster.mutations(), 0);
        assert!(!h.tickets.check_ticket_exists(&key()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_supersedes_reboot() {
        let h = harness(aggressive_config());
        h.status.add_status(
            FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_ROW_REMAP_FAILURE)
                .with_id("4"),
        );
        let policy = policy(&h);
        assert!(!policy.evaluate("n1", &hung()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_gpus_skip_throttle_check() {
        let mut mock = MockStatusQuery::new();
        mock.expect_get_node_statuses()
            .returning(|_, _| Ok(Vec::new()));
        mock.expect_get_node_gpu_statuses()
            .times(1)
            .returning(|_| {
                Ok((0..8)
                    .map(|i| GpuStatus {
                        index: i,
                        uuid: format!("GPU-{i}"),
                        pci_bdf: None,
                        allocated: true,
                        healthy: true,
                    })
                    .collect())
            });
        let h = harness_with_status(
            aggressive_config(),
            Default::default(),
            Arc::new(mock),
        );
        let policy = policy(&h);
        let status =
            FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_CLOCK_THROTTLE).with_value(600);
        assert!(!policy.evaluate("n1", &status).await);
    }

    #[tokio::test(start_paused = true)]
    async fn passing_health_check_resolves_throttle() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let policy = policy(&h);
        let status =
            FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_HIGH_TEMPERATURE).with_value(91);

        policy
            .execute(&ActionContext::default(), "n1", &status)
            .await
            .unwrap();
        assert_eq!(h.cluster.created_pods(), vec!["healthcheck-n1".to_string()]);
        assert!(!h.tickets.check_ticket_exists(&key()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn row_remap_taints_and_cleanup_removes_it() {
        let h = harness(aggressive_config());
        h.cluster.add_node("n1");
        let policy = policy(&h);
        let status = FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_ROW_REMAP_FAILURE)
            .with_id("4");

        policy
            .execute(&ActionContext::default(), "n1", &status)
            .await
            .unwrap();
        let node = h.bridge.cluster.get_node("n1").await.unwrap();
        assert!(crate::cluster::has_taint(&node, labels::GPU_UNHEALTHY_TAINT));
        let ticket = h.tickets.get_ticket(&key()).await.unwrap().unwrap();
        assert!(ticket.why_sre[0].contains("GPU 4"));

        policy
            .cleanup(&ActionContext::default(), "n1", &status)
            .await
            .unwrap();
        let node = h.bridge.cluster.get_node("n1").await.unwrap();
        assert!(!crate::cluster::has_taint(&node, labels::GPU_UNHEALTHY_TAINT));
        assert!(!crate::cluster::is_unschedulable(&node));
        assert!(!h.tickets.check_ticket_exists(&key()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn uninitialized_policy_refuses() {
        let policy = GpuPolicy::new();
        assert!(!policy.evaluate("n1", &hung()).await);
        let err = policy
            .execute(&ActionContext::default(), "n1", &hung())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::NotInitialized { .. }));
    }
}
