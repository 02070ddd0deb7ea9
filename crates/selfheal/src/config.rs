//! Engine Configuration
//!
//! Loaded from a mounted YAML file (`/config/config.yaml` in the Helm chart) with a few
//! environment overrides for the aggressiveness gates, so operators can flip them per
//! deployment without editing the ConfigMap.

use crate::error::{Error, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Main engine configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Namespace where remediation Jobs and Pods are spawned
    pub namespace: String,

    /// Region label passed to job templates
    #[serde(default)]
    pub region: String,

    /// Cluster name passed to job templates
    #[serde(default)]
    pub cluster: String,

    /// Aggressiveness gates
    #[serde(default)]
    pub remediation: RemediationConfig,

    /// Remediation container image
    pub image: ImageConfig,

    /// Directory holding the job/pod templates; embedded templates are used when unset
    #[serde(default)]
    pub template_dir: Option<PathBuf>,

    /// Owner of every spawned Job/Pod (usually the engine's own Deployment)
    #[serde(default)]
    pub owner: Option<OwnerConfig>,

    /// Node status service
    #[serde(default)]
    pub status: StatusConfig,

    /// Ticket storage
    #[serde(default)]
    pub tickets: TicketConfig,

    /// Timeouts for the action primitives
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Drain behaviour
    #[serde(default)]
    pub drain: DrainConfig,

    /// Per-family thresholds
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Namespaces whose pods never block a reboot and are always drained
    #[serde(default = "default_protected_namespaces")]
    pub protected_namespaces: Vec<String>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Aggressiveness configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationConfig {
    /// false = detect and ticket only
    #[serde(default)]
    pub aggressive: bool,

    /// 1 = give up after 48h, >1 = give up after 96h and allow power-off
    #[serde(default = "default_aggressive_level")]
    pub aggressive_level: u8,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            aggressive: false,
            aggressive_level: default_aggressive_level(),
        }
    }
}

fn default_aggressive_level() -> u8 {
    1
}

/// Image configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Registry host (e.g., "ghcr.io")
    pub registry: String,

    /// Repository within the registry (e.g., "5dlabs/node-remedy")
    pub repository: String,

    /// Image tag
    pub tag: String,
}

impl ImageConfig {
    /// Returns `true` when all parts are populated.
    pub fn is_configured(&self) -> bool {
        !self.registry.trim().is_empty()
            && !self.repository.trim().is_empty()
            && !self.tag.trim().is_empty()
    }
}

/// Owner reference configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerConfig {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerConfig {
    pub fn to_owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(false),
            block_owner_deletion: Some(true),
        }
    }
}

/// Node status service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub endpoint: String,
    #[serde(default = "default_status_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://node-status.selfheal.svc:8080".to_string(),
            request_timeout_seconds: default_status_timeout(),
        }
    }
}

fn default_status_timeout() -> u64 {
    10
}

/// Ticket storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketBackend {
    ConfigMap,
    Memory,
}

/// Ticket configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketConfig {
    pub backend: TicketBackend,

    /// Namespace for ticket ConfigMaps (defaults to the engine namespace)
    #[serde(default)]
    pub namespace: Option<String>,

    /// Closed tickets kept per node for frequency checks
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            backend: TicketBackend::ConfigMap,
            namespace: None,
            history_depth: default_history_depth(),
        }
    }
}

fn default_history_depth() -> usize {
    20
}

/// Primitive timeouts, all in seconds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub restart_seconds: u64,
    pub shutdown_seconds: u64,
    pub shutdown_pre_wait_seconds: u64,
    pub repair_seconds: u64,
    pub remedy_seconds: u64,
    pub diagnose_seconds: u64,
    pub health_check_seconds: u64,
    pub pod_ready_seconds: u64,
    pub sleep_wait_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            restart_seconds: 30 * 60,
            shutdown_seconds: 30 * 60,
            shutdown_pre_wait_seconds: 4 * 24 * 3600,
            repair_seconds: 60 * 60,
            remedy_seconds: 30 * 60,
            diagnose_seconds: 20 * 60,
            health_check_seconds: 20 * 60,
            pod_ready_seconds: 10 * 60,
            sleep_wait_seconds: 30 * 60,
        }
    }
}

impl TimeoutConfig {
    pub fn restart(&self) -> Duration {
        Duration::from_secs(self.restart_seconds)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_seconds)
    }

    pub fn shutdown_pre_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_pre_wait_seconds)
    }

    pub fn repair(&self) -> Duration {
        Duration::from_secs(self.repair_seconds)
    }

    pub fn remedy(&self) -> Duration {
        Duration::from_secs(self.remedy_seconds)
    }

    pub fn diagnose(&self) -> Duration {
        Duration::from_secs(self.diagnose_seconds)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_seconds)
    }

    pub fn pod_ready(&self) -> Duration {
        Duration::from_secs(self.pod_ready_seconds)
    }

    pub fn sleep_wait(&self) -> Duration {
        Duration::from_secs(self.sleep_wait_seconds)
    }
}

/// Drain configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainConfig {
    pub force: bool,
    pub ignore_daemonsets: bool,
    pub grace_period_seconds: i64,
    pub timeout_seconds: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            force: true,
            ignore_daemonsets: true,
            grace_period_seconds: 10,
            timeout_seconds: 120,
        }
    }
}

/// Thresholds used by the policy table
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThresholdConfig {
    /// Successful reboots after which GPU faults go to SRE
    pub max_reboots: usize,
    /// Successful remedies after which a remedy is not retried
    pub max_remedies: usize,
    /// Successful pod restarts after which a component goes to SRE
    pub max_pod_restarts: usize,
    /// "N of the last M tickets" frequency test
    pub frequency_last_n: usize,
    pub frequency_threshold: usize,
    /// Nodes showing the same IB fault at once before we suspect the fabric
    pub ib_storm_nodes: usize,
    /// Degrees Celsius above which a baseboard is powered off
    pub shutdown_temperature: i64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_reboots: 2,
            max_remedies: 1,
            max_pod_restarts: 2,
            frequency_last_n: 5,
            frequency_threshold: 3,
            ib_storm_nodes: 5,
            shutdown_temperature: 95,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_protected_namespaces() -> Vec<String> {
    vec!["kube-system".to_string(), "selfheal".to_string()]
}

impl EngineConfig {
    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("failed to read {path}: {e}")))?;
        let mut config: EngineConfig = serde_yaml::from_str(&content)?;
        config.apply_env_overrides();
        debug!(path, "Loaded engine configuration");
        Ok(config)
    }

    /// Apply `SELFHEAL_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("SELFHEAL_AGGRESSIVE") {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.remediation.aggressive = true,
                "0" | "false" | "no" => self.remediation.aggressive = false,
                other => warn!("Ignoring invalid SELFHEAL_AGGRESSIVE value '{}'", other),
            }
        }
        if let Ok(value) = std::env::var("SELFHEAL_AGGRESSIVE_LEVEL") {
            match value.parse::<u8>() {
                Ok(level) => self.remediation.aggressive_level = level,
                Err(_) => warn!("Ignoring invalid SELFHEAL_AGGRESSIVE_LEVEL value '{}'", value),
            }
        }
        if let Ok(namespace) = std::env::var("SELFHEAL_NAMESPACE") {
            if !namespace.trim().is_empty() {
                self.namespace = namespace;
            }
        }
    }

    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::ConfigError("namespace must not be empty".to_string()));
        }
        if !self.image.is_configured() {
            return Err(Error::ConfigError(
                "image.registry, image.repository and image.tag are required".to_string(),
            ));
        }
        if self.thresholds.frequency_threshold > self.thresholds.frequency_last_n {
            return Err(Error::ConfigError(format!(
                "frequencyThreshold ({}) cannot exceed frequencyLastN ({})",
                self.thresholds.frequency_threshold, self.thresholds.frequency_last_n
            )));
        }
        if self.drain.timeout_seconds == 0 {
            return Err(Error::ConfigError(
                "drain.timeoutSeconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Namespace holding ticket ConfigMaps
    pub fn ticket_namespace(&self) -> &str {
        self.tickets.namespace.as_deref().unwrap_or(&self.namespace)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "selfheal".to_string(),
            region: String::new(),
            cluster: String::new(),
            remediation: RemediationConfig::default(),
            image: ImageConfig {
                registry: "ghcr.io".to_string(),
                repository: "5dlabs/node-remedy".to_string(),
                tag: "latest".to_string(),
            },
            template_dir: None,
            owner: None,
            status: StatusConfig::default(),
            tickets: TicketConfig::default(),
            timeouts: TimeoutConfig::default(),
            drain: DrainConfig::default(),
            thresholds: ThresholdConfig::default(),
            protected_namespaces: default_protected_namespaces(),
            logging: LoggingConfig::default(),
        }
    }
}
