//! Action primitives.
//!
//! Every primitive that needs to run something on or against a node does it through an
//! ephemeral Job or Pod with a deterministic name (`<action>-<node>`). The shared algorithm:
//!
//! 1. pre-empt: delete any previous instance (foreground) and wait until it is gone
//! 2. render the template, decode it, stamp namespace and owner reference
//! 3. create; a create error is returned as is
//! 4. poll with [`await_terminal`] until the object reaches a terminal phase
//!
//! Primitives block the calling task until the remote work finishes. Callers run them on a
//! per-node worker, never on a shared loop.

mod cordon;
mod diagnose;
mod drain;
mod ephemeral;
mod healthcheck;
mod naming;
mod poll;
mod power;
mod remedy;

pub use diagnose::parse_diagnosis;
pub use ephemeral::PodOutcome;
pub use healthcheck::{exit_code_to_hardware, HealthReport};
pub use naming::ActionNaming;
pub use poll::{
    await_absent, await_terminal, job_phase, pod_phase, sleep_wait, AbortPredicate,
    ActionContext, Phase, ABSENCE_INTERVAL, MAX_POLL_ERRORS, POLL_INTERVAL,
};
pub use remedy::RemedyAction;

use crate::bridge::ApiBridge;
use crate::cluster::ClusterClient;

/// Labels put on nodes by fault families
pub mod labels {
    pub const IB_UNAVAILABLE: &str = "selfheal.5dlabs.com/ib-unavailable";
    pub const GPFS_UNAVAILABLE: &str = "selfheal.5dlabs.com/gpfs-unavailable";
    /// NoSchedule taint for nodes with a GPU awaiting replacement
    pub const GPU_UNHEALTHY_TAINT: &str = "selfheal.5dlabs.com/gpu-unhealthy";
}

/// Primitive operations against one bridge
#[derive(Clone, Copy)]
pub struct NodeActions<'a> {
    bridge: &'a ApiBridge,
}

impl<'a> NodeActions<'a> {
    pub fn new(bridge: &'a ApiBridge) -> Self {
        Self { bridge }
    }

    fn cluster(&self) -> &'a dyn ClusterClient {
        self.bridge.cluster.as_ref()
    }

    fn namespace(&self) -> &'a str {
        self.bridge.namespace()
    }
}
