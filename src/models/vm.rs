//! VM model

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// State of a VM as reported by Hyper-V
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Off,
    Running,
    Saved,
    Paused,
    Starting,
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Off => write!(f, "Off"),
            VmState::Running => write!(f, "Running"),
            VmState::Saved => write!(f, "Saved"),
            VmState::Paused => write!(f, "Paused"),
            VmState::Starting => write!(f, "Starting"),
            VmState::Unknown => write!(f, "Unknown"),
        }
    }
}

impl VmState {
    /// Map the numeric `VMState` enum emitted by `Get-VM | ConvertTo-Json`
    pub fn from_hyperv_state(state: i32) -> Self {
        match state {
            2 => VmState::Running,
            3 => VmState::Off,
            6 => VmState::Saved,
            9 => VmState::Paused,
            10 => VmState::Starting,
            _ => VmState::Unknown,
        }
    }
}

/// A provisioned VM as observed on the host after creation.
/// Not persisted; Hyper-V is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    pub tenant: String,
    pub hardware_serial: String,
    pub state: VmState,
}

/// Hardware definition for a new VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub vhdx_path: PathBuf,
    pub switch_name: String,
    pub vlan_id: Option<u16>,
    pub cpu_count: u32,
    pub memory_bytes: u64,
}

impl VmSpec {
    pub fn new(name: impl Into<String>, vhdx_path: impl Into<PathBuf>, switch_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vhdx_path: vhdx_path.into(),
            switch_name: switch_name.into(),
            vlan_id: None,
            cpu_count: 2,
            memory_bytes: super::DEFAULT_MEMORY_BYTES,
        }
    }

    pub fn vlan(mut self, vlan_id: Option<u16>) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    pub fn cpu_count(mut self, count: u32) -> Self {
        self.cpu_count = count;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }
}

/// Text written to the VM's notes so operators can match it to a device record
pub fn metadata_note(serial: &str, tenant: &str) -> String {
    format!("Serial# {} | Tenant: {}", serial, tenant)
}
