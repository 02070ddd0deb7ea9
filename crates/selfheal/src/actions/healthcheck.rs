//! Health check pod. The container's exit code names the failing subsystem.

use super::naming::ActionNaming;
use super::poll::ActionContext;
use super::NodeActions;
use crate::error::{Error, Result};
use crate::observation::{condition, HardwareType};
use crate::template::TemplateKind;
use tracing::{info, instrument, warn};

/// Outcome of a health check run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub exit_code: i32,
    pub hardware_type: HardwareType,
    pub condition: &'static str,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.hardware_type == HardwareType::None
    }
}

/// Maps a health check exit code to the subsystem and condition it reports. Total:
/// unlisted codes are `(Unknown, Null)`.
pub fn exit_code_to_hardware(code: i32) -> (HardwareType, &'static str) {
    match code {
        0 => (HardwareType::None, condition::NULL),
        1 => (HardwareType::Ib, condition::NULL),
        2 => (HardwareType::Gpu, condition::NULL),
        21 => (HardwareType::Gpu, condition::GPU_ROW_REMAP_FAILURE),
        22 => (HardwareType::Gpu, condition::GPU_SRAM_UNCORRECTABLE),
        23 => (HardwareType::Gpu, condition::GPU_CHECK_FAILED),
        3 => (HardwareType::Gpfs, condition::NULL),
        4 => (HardwareType::Cpu, condition::NULL),
        5 => (HardwareType::Memory, condition::NULL),
        6 => (HardwareType::Disk, condition::NULL),
        7 => (HardwareType::Network, condition::NULL),
        _ => (HardwareType::Unknown, condition::NULL),
    }
}

impl NodeActions<'_> {
    /// Runs a `healthcheck-<node>` pod and decodes its exit code
    #[instrument(skip(self, ctx))]
    pub async fn health_check(&self, ctx: &ActionContext, node: &str) -> Result<HealthReport> {
        let scoped = ctx.with_timeout(self.bridge.config.timeouts.health_check());
        let name = ActionNaming::name("healthcheck", node);
        let mut params = self.bridge.base_params(node);
        params.insert("pod_name".to_string(), name.clone());

        let outcome = self
            .run_pod(&scoped, TemplateKind::HealthCheckPod, &name, &params)
            .await?;
        let Some(exit_code) = outcome.exit_code() else {
            warn!(pod = %name, "Health check pod finished without an exit code");
            return Err(Error::JobFailed {
                kind: "Pod".to_string(),
                name,
            });
        };

        let (hardware_type, condition) = exit_code_to_hardware(exit_code);
        info!(node = %node, exit_code, hardware = %hardware_type, condition, "🩺 Health check finished");
        Ok(HealthReport {
            exit_code,
            hardware_type,
            condition,
        })
    }
}
