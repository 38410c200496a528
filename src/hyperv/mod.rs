//! Hyper-V host operations

mod commands;
mod mount;
pub(crate) mod shell;

pub use commands::{HyperV, HyperVInfo};
pub use mount::MountedDisk;
pub use shell::PowerShell;

use crate::models::{VmSpec, VmState};
use crate::Result;
use base64::Engine;
use std::path::{Path, PathBuf};

/// Name of the local guardian that owns every VM key protector
pub const GUARDIAN_NAME: &str = "UntrustedGuardian";

/// Host guardian used to create key protectors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guardian {
    pub name: String,
}

/// Serialized key protector for a VM's virtual TPM
#[derive(Clone, PartialEq, Eq)]
pub struct KeyProtector(pub Vec<u8>);

impl KeyProtector {
    pub fn from_base64(encoded: &str) -> Result<Self> {
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map(Self)
            .map_err(|e| crate::Error::Parse(format!("invalid key protector: {}", e)))
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }
}

impl std::fmt::Debug for KeyProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyProtector({} bytes)", self.0.len())
    }
}

/// Everything the provisioner needs from the virtualization host
#[cfg_attr(test, mockall::automock)]
pub trait Hypervisor {
    /// Names of every VM registered on the host
    fn list_vm_names(&self) -> Result<Vec<String>>;

    fn vm_exists(&self, name: &str) -> Result<bool>;

    /// Full copy of a disk file
    fn clone_disk(&self, source: &Path, destination: &Path) -> Result<()>;

    /// Attach a disk file to the host; returns the root of its OS volume
    fn mount_disk(&self, disk: &Path) -> Result<PathBuf>;

    fn dismount_disk(&self, disk: &Path) -> Result<()>;

    /// Create a generation 2 VM from `spec`, powered off
    fn create_vm(&self, spec: &VmSpec) -> Result<()>;

    /// Find the named guardian, creating it if the host has none
    fn ensure_guardian(&self, name: &str) -> Result<Guardian>;

    fn new_key_protector(&self, guardian: &Guardian) -> Result<KeyProtector>;

    fn set_key_protector(&self, vm: &str, protector: &KeyProtector) -> Result<()>;

    fn enable_tpm(&self, vm: &str) -> Result<()>;

    fn start_vm(&self, vm: &str) -> Result<()>;

    fn vm_state(&self, vm: &str) -> Result<VmState>;

    /// BIOS serial number the host assigned to the VM
    fn bios_serial(&self, vm: &str) -> Result<String>;

    fn set_notes(&self, vm: &str, notes: &str) -> Result<()>;
}
