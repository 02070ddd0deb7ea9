//! Condition Registry
//!
//! Maps a fault condition to the policy handling it. Built once at startup and shared by
//! reference; several conditions usually point at the same policy instance.

use crate::bridge::ApiBridge;
use crate::error::{Error, Result};
use crate::policy::{ComponentPolicy, GpfsPolicy, GpuPolicy, HardwarePolicy, IbPolicy, Policy};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
pub struct Registry {
    policies: HashMap<String, Arc<dyn Policy>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("conditions", &self.conditions())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in policy
    pub fn with_default_policies() -> Result<Self> {
        let mut registry = Self::new();
        registry.register_policy(Arc::new(GpuPolicy::new()))?;
        registry.register_policy(Arc::new(IbPolicy::new()))?;
        registry.register_policy(Arc::new(GpfsPolicy::new()))?;
        registry.register_policy(Arc::new(HardwarePolicy::new()))?;
        registry.register_policy(Arc::new(ComponentPolicy::new()))?;
        Ok(registry)
    }

    /// Registers `policy` for `condition`. A duplicate keeps the first registration.
    pub fn register(&mut self, condition: &str, policy: Arc<dyn Policy>) -> Result<()> {
        if self.policies.contains_key(condition) {
            return Err(Error::AlreadyRegistered {
                condition: condition.to_string(),
            });
        }
        debug!(condition, policy = policy.name(), "Registered policy");
        self.policies.insert(condition.to_string(), policy);
        Ok(())
    }

    /// Registers `policy` under every condition it declares
    pub fn register_policy(&mut self, policy: Arc<dyn Policy>) -> Result<()> {
        for condition in policy.conditions() {
            self.register(condition, policy.clone())?;
        }
        Ok(())
    }

    pub fn get(&self, condition: &str) -> Result<Arc<dyn Policy>> {
        self.policies
            .get(condition)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("policy for condition {condition}")))
    }

    /// Calls `create_instance` once per distinct policy
    pub fn initialize(&self, bridge: Arc<ApiBridge>) -> Result<()> {
        let mut seen = HashSet::new();
        for policy in self.policies.values() {
            if seen.insert(Arc::as_ptr(policy).cast::<()>()) {
                policy.create_instance(bridge.clone())?;
            }
        }
        info!(
            policies = seen.len(),
            conditions = self.policies.len(),
            "✅ Policies initialized"
        );
        Ok(())
    }

    /// Registered conditions, sorted
    pub fn conditions(&self) -> Vec<&str> {
        let mut conditions: Vec<&str> = self.policies.keys().map(String::as_str).collect();
        conditions.sort_unstable();
        conditions
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
