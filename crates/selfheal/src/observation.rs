//! Fault observations produced by the node-status classifier.
//!
//! An observation is immutable once produced. The engine keys everything off
//! [`FaultObservation::condition`]; `value` carries a condition-specific number
//! (Xid code, error count, degrees Celsius, clock MHz).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Subsystem a fault belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareType {
    None,
    Gpu,
    Ib,
    Gpfs,
    Cpu,
    Memory,
    Disk,
    Network,
    Baseboard,
    Kubelet,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Gpu => "gpu",
            Self::Ib => "ib",
            Self::Gpfs => "gpfs",
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Baseboard => "baseboard",
            Self::Kubelet => "kubelet",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single observed fault on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultObservation {
    pub node_name: String,
    #[serde(rename = "type")]
    pub hardware_type: HardwareType,
    pub condition: String,
    /// Device or sensor id (GPU index, HCA port, disk name)
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub pci_bdf: Option<String>,
    #[serde(default)]
    pub msg: String,
}

impl FaultObservation {
    pub fn new(
        node_name: impl Into<String>,
        hardware_type: HardwareType,
        condition: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            hardware_type,
            condition: condition.into(),
            id: None,
            value: 0,
            pci_bdf: None,
            msg: String::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    /// Short human-readable title used for tickets.
    pub fn title(&self) -> String {
        let mut title = format!("[{}] {} on {}", self.hardware_type, self.condition, self.node_name);
        if let Some(id) = &self.id {
            title.push_str(&format!(" ({id})"));
        }
        if self.value != 0 {
            title.push_str(&format!(" value={}", self.value));
        }
        title
    }
}

/// Fault condition identifiers.
pub mod condition {
    /// Placeholder when no specific condition applies.
    pub const NULL: &str = "Null";

    // GPU
    pub const GPU_HUNG: &str = "Hung";
    pub const GPU_XID: &str = "XidError";
    pub const GPU_LOST: &str = "GpuLost";
    pub const GPU_ROW_REMAP_FAILURE: &str = "RowRemapFailure";
    pub const GPU_SRAM_UNCORRECTABLE: &str = "SramUncorrectable";
    pub const GPU_CHECK_FAILED: &str = "GpuCheckFailed";
    pub const GPU_HIGH_TEMPERATURE: &str = "GpuHighTemperature";
    pub const GPU_CLOCK_THROTTLE: &str = "GpuClockThrottle";
    pub const FABRIC_MANAGER_DOWN: &str = "FabricManagerDown";
    pub const PEER_MEM_UNLOADED: &str = "PeerMemUnloaded";

    // InfiniBand
    pub const IB_LINK_DOWN: &str = "IBLinkDown";
    pub const IB_PORT_FLAPPING: &str = "IBPortFlapping";
    pub const IB_DEGRADED: &str = "IBDegraded";

    // GPFS
    pub const GPFS_MOUNT_LOST: &str = "GpfsMountLost";
    pub const GPFS_DOWN: &str = "GpfsDown";

    // Host hardware
    pub const DISK_FAILURE: &str = "DiskFailure";
    pub const DISK_READ_ONLY: &str = "DiskReadOnly";
    pub const MEMORY_UNCORRECTABLE: &str = "MemoryUncorrectable";
    pub const CPU_MCE: &str = "CpuMce";
    pub const BASEBOARD_PSU: &str = "BaseboardPsuFailure";
    pub const BASEBOARD_FAN: &str = "BaseboardFanFailure";
    pub const BASEBOARD_OVER_TEMPERATURE: &str = "BaseboardOverTemperature";
    pub const NETWORK_LINK_DOWN: &str = "NetworkLinkDown";
    pub const MEMORY_PRESSURE: &str = "MemoryPressure";

    // Node components
    pub const KUBELET_UNHEALTHY: &str = "KubeletUnhealthy";
    pub const PLEG_UNHEALTHY: &str = "PLEGUnhealthy";
    pub const DEVICE_PLUGIN_UNHEALTHY: &str = "DevicePluginUnhealthy";
    pub const RDMA_PLUGIN_UNHEALTHY: &str = "RdmaPluginUnhealthy";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_classifier_payload() {
        let json = r#"{
            "nodeName": "gpu-a-017",
            "type": "gpu",
            "condition": "XidError",
            "id": "3",
            "value": 79,
            "pciBdf": "0000:3b:00.0",
            "msg": "GPU has fallen off the bus"
        }"#;
        let obs: FaultObservation = serde_json::from_str(json).unwrap();
        assert_eq!(obs.hardware_type, HardwareType::Gpu);
        assert_eq!(obs.value, 79);
        assert_eq!(obs.pci_bdf.as_deref(), Some("0000:3b:00.0"));
    }

    #[test]
    fn unknown_subsystem_maps_to_unknown() {
        let obs: FaultObservation =
            serde_json::from_str(r#"{"nodeName":"n1","type":"psu","condition":"X"}"#).unwrap();
        assert_eq!(obs.hardware_type, HardwareType::Unknown);
        assert!(obs.msg.is_empty());
    }

    #[test]
    fn title_includes_device_and_value() {
        let obs = FaultObservation::new("n1", HardwareType::Gpu, condition::GPU_XID)
            .with_id("2")
            .with_value(48);
        assert_eq!(obs.title(), "[gpu] XidError on n1 (2) value=48");
    }
}
