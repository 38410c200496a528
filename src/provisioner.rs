//! Single-VM provisioning pipeline

use crate::error::ProvisionStep;
use crate::hyperv::{Guardian, Hypervisor, MountedDisk, GUARDIAN_NAME};
use crate::models::{
    guest_provisioning_dir, metadata_note, VmRecord, VmSpec, VmState, GUEST_CONFIG_FILE,
};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything needed to bring one VM up
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    pub name: &'a str,
    pub tenant: &'a str,
    pub reference_image: &'a Path,
    /// Directory the VM's disk is written to
    pub workspace: &'a Path,
    pub switch_name: &'a str,
    pub vlan_id: Option<u16>,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub enrollment_config: Option<&'a Path>,
}

impl ProvisionRequest<'_> {
    pub fn disk_path(&self) -> PathBuf {
        self.workspace.join(format!("{}.vhdx", self.name))
    }
}

pub struct DeviceProvisioner {
    hypervisor: Arc<dyn Hypervisor>,
    guardian: Mutex<Option<Guardian>>,
}

impl DeviceProvisioner {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            hypervisor,
            guardian: Mutex::new(None),
        }
    }

    /// Clone, inject, create, secure, start and tag one VM.
    ///
    /// Steps run strictly in order and the first failure ends the VM. Work
    /// already done is left in place; a mounted disk is always dismounted.
    pub fn provision(&self, req: &ProvisionRequest<'_>) -> Result<VmRecord> {
        let name = req.name;
        let span = tracing::info_span!("provision", vm = %name);
        let _enter = span.enter();

        let exists = self
            .hypervisor
            .vm_exists(name)
            .map_err(|e| Error::provisioning(name, ProvisionStep::CheckName, e))?;
        if exists {
            return Err(Error::ResourceConflict(name.to_string()));
        }

        let disk = req.disk_path();
        self.step(name, ProvisionStep::CloneDisk, || {
            tracing::info!(source = %req.reference_image.display(), "Cloning reference disk");
            self.hypervisor.clone_disk(req.reference_image, &disk)
        })?;

        if let Some(config) = req.enrollment_config {
            self.step(name, ProvisionStep::InjectEnrollment, || {
                self.inject_enrollment(&disk, config)
            })?;
        }

        let spec = VmSpec::new(name, &disk, req.switch_name)
            .vlan(req.vlan_id)
            .cpu_count(req.cpu_count)
            .memory_bytes(req.memory_bytes);
        self.step(name, ProvisionStep::CreateVm, || self.hypervisor.create_vm(&spec))?;

        self.step(name, ProvisionStep::SecureTpm, || self.secure(name))?;

        self.step(name, ProvisionStep::Start, || self.hypervisor.start_vm(name))?;

        let serial = self.step(name, ProvisionStep::TagMetadata, || {
            let serial = self.hypervisor.bios_serial(name)?;
            self.hypervisor
                .set_notes(name, &metadata_note(&serial, req.tenant))?;
            Ok(serial)
        })?;

        let state = self.hypervisor.vm_state(name).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Cannot read VM state");
            VmState::Unknown
        });

        tracing::info!(serial = %serial, %state, "VM provisioned");
        Ok(VmRecord {
            name: name.to_string(),
            tenant: req.tenant.to_string(),
            hardware_serial: serial,
            state,
        })
    }

    fn step<T>(&self, vm: &str, step: ProvisionStep, f: impl FnOnce() -> Result<T>) -> Result<T> {
        tracing::debug!(%step, "Starting step");
        f().map_err(|e| {
            tracing::error!(%step, error = %e, "Step failed");
            Error::provisioning(vm, step, e)
        })
    }

    /// Copy the enrollment config into the guest volume; the mount guard dismounts on return
    fn inject_enrollment(&self, disk: &Path, config: &Path) -> Result<()> {
        let mount = MountedDisk::mount(self.hypervisor.as_ref(), disk)?;
        let dir = guest_provisioning_dir(mount.root());
        std::fs::create_dir_all(&dir)?;
        std::fs::copy(config, dir.join(GUEST_CONFIG_FILE))?;
        tracing::info!(target_dir = %dir.display(), "Injected enrollment config");
        Ok(())
    }

    fn secure(&self, vm: &str) -> Result<()> {
        let guardian = self.guardian()?;
        let protector = self.hypervisor.new_key_protector(&guardian)?;
        self.hypervisor.set_key_protector(vm, &protector)?;
        self.hypervisor.enable_tpm(vm)
    }

    /// The host guardian, looked up once per process
    fn guardian(&self) -> Result<Guardian> {
        let mut cached = self.guardian.lock();
        if let Some(guardian) = cached.as_ref() {
            return Ok(guardian.clone());
        }
        let guardian = self.hypervisor.ensure_guardian(GUARDIAN_NAME)?;
        *cached = Some(guardian.clone());
        Ok(guardian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperv::{KeyProtector, MockHypervisor};
    use mockall::Sequence;
    use tempfile::TempDir;

    fn request<'a>(workspace: &'a Path, config: Option<&'a Path>) -> ProvisionRequest<'a> {
        ProvisionRequest {
            name: "contoso_1",
            tenant: "contoso",
            reference_image: Path::new("/images/win11.vhdx"),
            workspace,
            switch_name: "External",
            vlan_id: Some(30),
            cpu_count: 4,
            memory_bytes: 8 * crate::models::GIB,
            enrollment_config: config,
        }
    }

    fn expect_guardian(hv: &mut MockHypervisor) {
        hv.expect_ensure_guardian().times(1).returning(|name| {
            Ok(Guardian {
                name: name.to_string(),
            })
        });
    }

    /// Successful responses for the steps after the disk clone
    fn expect_vm_setup(hv: &mut MockHypervisor) {
        hv.expect_create_vm().returning(|_| Ok(()));
        hv.expect_new_key_protector()
            .returning(|_| Ok(KeyProtector(vec![7; 16])));
        hv.expect_set_key_protector().returning(|_, _| Ok(()));
        hv.expect_enable_tpm().returning(|_| Ok(()));
        hv.expect_start_vm().returning(|_| Ok(()));
        hv.expect_bios_serial()
            .returning(|_| Ok("1234-5678-9012".into()));
        hv.expect_set_notes().returning(|_, _| Ok(()));
    }

    #[test]
    fn test_steps_run_in_order() {
        let temp = TempDir::new().unwrap();
        let guest_root = TempDir::new().unwrap();
        let config = temp.path().join("EnrollmentConfig.json");
        std::fs::write(&config, "{\"Version\":2049}").unwrap();

        let mut seq = Sequence::new();
        let mut hv = MockHypervisor::new();
        hv.expect_vm_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        let disk = temp.path().join("contoso_1.vhdx");
        hv.expect_clone_disk()
            .withf(move |_, dst| dst == disk.as_path())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let root = guest_root.path().to_path_buf();
        hv.expect_mount_disk()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(root.clone()));
        hv.expect_dismount_disk()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        hv.expect_create_vm()
            .withf(|spec| {
                spec.name == "contoso_1"
                    && spec.cpu_count == 4
                    && spec.vlan_id == Some(30)
                    && spec.switch_name == "External"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        hv.expect_ensure_guardian()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| {
                Ok(Guardian {
                    name: name.to_string(),
                })
            });
        hv.expect_new_key_protector()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(KeyProtector(vec![1, 2, 3])));
        hv.expect_set_key_protector()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        hv.expect_enable_tpm()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        hv.expect_start_vm()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        hv.expect_bios_serial()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("1234-5678-9012".into()));
        hv.expect_set_notes()
            .withf(|vm, notes| vm == "contoso_1" && notes == "Serial# 1234-5678-9012 | Tenant: contoso")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        hv.expect_vm_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(VmState::Running));

        let provisioner = DeviceProvisioner::new(Arc::new(hv));
        let record = provisioner
            .provision(&request(temp.path(), Some(config.as_path())))
            .unwrap();

        assert_eq!(record.name, "contoso_1");
        assert_eq!(record.tenant, "contoso");
        assert_eq!(record.hardware_serial, "1234-5678-9012");
        assert_eq!(record.state, VmState::Running);

        let injected = guest_provisioning_dir(guest_root.path()).join(GUEST_CONFIG_FILE);
        assert_eq!(
            std::fs::read_to_string(injected).unwrap(),
            "{\"Version\":2049}"
        );
    }

    #[test]
    fn test_existing_vm_is_conflict_without_side_effects() {
        let temp = TempDir::new().unwrap();
        let mut hv = MockHypervisor::new();
        hv.expect_vm_exists().returning(|_| Ok(true));
        hv.expect_clone_disk().never();
        hv.expect_create_vm().never();

        let provisioner = DeviceProvisioner::new(Arc::new(hv));
        let err = provisioner.provision(&request(temp.path(), None)).unwrap_err();
        assert!(matches!(err, Error::ResourceConflict(ref n) if n == "contoso_1"));
    }

    #[test]
    fn test_skip_enrollment_never_mounts() {
        let temp = TempDir::new().unwrap();
        let mut hv = MockHypervisor::new();
        hv.expect_vm_exists().returning(|_| Ok(false));
        hv.expect_clone_disk().returning(|_, _| Ok(()));
        hv.expect_mount_disk().never();
        hv.expect_dismount_disk().never();
        expect_guardian(&mut hv);
        expect_vm_setup(&mut hv);
        hv.expect_vm_state().returning(|_| Ok(VmState::Running));

        let provisioner = DeviceProvisioner::new(Arc::new(hv));
        assert!(provisioner.provision(&request(temp.path(), None)).is_ok());
    }

    #[test]
    fn test_failed_injection_still_dismounts() {
        let temp = TempDir::new().unwrap();
        let guest_root = TempDir::new().unwrap();
        // a file where the Windows directory should be makes the copy fail
        std::fs::write(guest_root.path().join("Windows"), "not a directory").unwrap();
        let config = temp.path().join("EnrollmentConfig.json");
        std::fs::write(&config, "{}").unwrap();

        let mut hv = MockHypervisor::new();
        hv.expect_vm_exists().returning(|_| Ok(false));
        hv.expect_clone_disk().returning(|_, _| Ok(()));
        let root = guest_root.path().to_path_buf();
        hv.expect_mount_disk()
            .times(1)
            .returning(move |_| Ok(root.clone()));
        hv.expect_dismount_disk().times(1).returning(|_| Ok(()));
        hv.expect_create_vm().never();
        hv.expect_start_vm().never();

        let provisioner = DeviceProvisioner::new(Arc::new(hv));
        let err = provisioner
            .provision(&request(temp.path(), Some(config.as_path())))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Provisioning {
                step: ProvisionStep::InjectEnrollment,
                ..
            }
        ));
        assert!(!MountedDisk::is_mounted(&temp.path().join("contoso_1.vhdx")));
    }

    #[test]
    fn test_clone_failure_stops_pipeline() {
        let temp = TempDir::new().unwrap();
        let mut hv = MockHypervisor::new();
        hv.expect_vm_exists().returning(|_| Ok(false));
        hv.expect_clone_disk()
            .returning(|_, _| Err(Error::PowerShell("disk full".into())));
        hv.expect_create_vm().never();

        let provisioner = DeviceProvisioner::new(Arc::new(hv));
        let err = provisioner.provision(&request(temp.path(), None)).unwrap_err();
        match err {
            Error::Provisioning { vm, step, source } => {
                assert_eq!(vm, "contoso_1");
                assert_eq!(step, ProvisionStep::CloneDisk);
                assert!(source.to_string().contains("disk full"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_guardian_looked_up_once() {
        let temp = TempDir::new().unwrap();
        let mut hv = MockHypervisor::new();
        hv.expect_vm_exists().returning(|_| Ok(false));
        hv.expect_clone_disk().returning(|_, _| Ok(()));
        expect_guardian(&mut hv);
        expect_vm_setup(&mut hv);
        hv.expect_vm_state().returning(|_| Ok(VmState::Running));

        let provisioner = DeviceProvisioner::new(Arc::new(hv));
        for name in ["contoso_1", "contoso_2"] {
            let req = ProvisionRequest {
                name,
                ..request(temp.path(), None)
            };
            provisioner.provision(&req).unwrap();
        }
    }

    #[test]
    fn test_state_read_failure_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let mut hv = MockHypervisor::new();
        hv.expect_vm_exists().returning(|_| Ok(false));
        hv.expect_clone_disk().returning(|_, _| Ok(()));
        expect_guardian(&mut hv);
        expect_vm_setup(&mut hv);
        hv.expect_vm_state()
            .returning(|_| Err(Error::PowerShell("Get-VM failed".into())));

        let provisioner = DeviceProvisioner::new(Arc::new(hv));
        let record = provisioner.provision(&request(temp.path(), None)).unwrap();
        assert_eq!(record.state, VmState::Unknown);
    }
}
