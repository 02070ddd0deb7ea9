/*
 * 5D Labs Agent Platform - Self-Heal Remediation Engine
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Self-healing remediation engine
//!
//! Turns fault observations on GPU cluster nodes into remediation: cordon, ticket, one
//! remote action through an ephemeral Job or Pod, and escalation to SRE when automation
//! runs out of options.

pub mod actions;
pub mod bridge;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod observation;
pub mod policy;
pub mod registry;
pub mod status;
pub mod template;
pub mod tickets;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use bridge::ApiBridge;
pub use config::EngineConfig;
pub use dispatch::{DispatchOutcome, Dispatcher, Signal};
pub use error::{Error, Result};
pub use observation::{FaultObservation, HardwareType};
pub use policy::Policy;
pub use registry::Registry;
