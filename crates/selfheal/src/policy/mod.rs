//! Remediation policies.
//!
//! A policy owns one condition family and is registered under every condition of that
//! family. Dispatch drives a policy through three phases per episode:
//!
//! - [`Policy::evaluate`]: read-only gate, `false` discards the observation
//! - [`Policy::execute`]: cordon, ticket, escalation checks, at most one primitive
//! - [`Policy::cleanup`]: the fault cleared; undo fault-only node markers and close the ticket
//!
//! Branches within a family are modelled as a strategy enum picked from the observation,
//! so every branch can be exercised on its own.

mod component;
mod episode;
mod gpfs;
mod gpu;
mod hardware;
mod ib;

pub use component::ComponentPolicy;
pub use episode::{cleanup_node, Episode};
pub use gpfs::GpfsPolicy;
pub use gpu::{GpuPolicy, GpuStrategy};
pub use hardware::HardwarePolicy;
pub use ib::IbPolicy;

use crate::actions::ActionContext;
use crate::bridge::ApiBridge;
use crate::error::{Error, Result};
use crate::observation::FaultObservation;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};

/// Contract every remediation policy implements
#[async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Conditions the policy handles
    fn conditions(&self) -> &'static [&'static str];

    /// Hands the policy its bridge. Called once, before any other phase.
    fn create_instance(&self, bridge: Arc<ApiBridge>) -> Result<()>;

    /// Cheap precondition. Must not mutate anything.
    async fn evaluate(&self, node: &str, status: &FaultObservation) -> bool;

    async fn execute(
        &self,
        ctx: &ActionContext,
        node: &str,
        status: &FaultObservation,
    ) -> Result<()>;

    /// Safe no-op when nothing was ever set
    async fn cleanup(
        &self,
        ctx: &ActionContext,
        node: &str,
        status: &FaultObservation,
    ) -> Result<()>;
}

/// Bridge slot shared by the policy implementations
#[derive(Debug)]
pub struct PolicyCore {
    name: &'static str,
    bridge: OnceLock<Arc<ApiBridge>>,
}

impl PolicyCore {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            bridge: OnceLock::new(),
        }
    }

    pub fn install(&self, bridge: Arc<ApiBridge>) -> Result<()> {
        self.bridge
            .set(bridge)
            .map_err(|_| Error::AlreadyInitialized {
                policy: self.name.to_string(),
            })
    }

    pub fn bridge(&self) -> Result<&ApiBridge> {
        self.bridge
            .get()
            .map(Arc::as_ref)
            .ok_or_else(|| Error::NotInitialized {
                policy: self.name.to_string(),
            })
    }

    pub fn is_initialized(&self) -> bool {
        self.bridge.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::testing::harness;

    #[test]
    fn core_installs_once() {
        let h = harness(EngineConfig::default());
        let core = PolicyCore::new("gpu");
        assert!(matches!(
            core.bridge(),
            Err(Error::NotInitialized { .. })
        ));

        core.install(h.bridge.clone()).unwrap();
        assert!(core.is_initialized());
        let err = core.install(h.bridge.clone()).unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized { policy } if policy == "gpu"));
    }
}
