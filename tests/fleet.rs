//! Fleet runs against an in-memory host
//! Live-host checks run with: cargo test --test fleet -- --ignored (requires Hyper-V)

use hv_fleet::graph::{Organization, OobeSettings, RemoteProfile};
use hv_fleet::hyperv::{Guardian, KeyProtector};
use hv_fleet::models::{guest_provisioning_dir, VmSpec, VmState, GUEST_CONFIG_FILE};
use hv_fleet::{
    AutoSelect, DirectoryApi, Error, FleetCatalog, FleetOrchestrator, Hypervisor, ImageBuilder,
    PolicyFetcher, ReferenceImageBuilder, Result, Timeouts, VmOutcome, VmRequest,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Hyper-V stand-in that keeps VMs in memory and mounts disks onto a directory
struct FakeHost {
    vms: Mutex<Vec<String>>,
    notes: Mutex<HashMap<String, String>>,
    mounted: Mutex<Vec<PathBuf>>,
    guest_root: PathBuf,
    fail_start: Option<&'static str>,
    guardian_lookups: AtomicUsize,
}

impl FakeHost {
    fn new(existing: &[&str], guest_root: &Path) -> Self {
        Self {
            vms: Mutex::new(existing.iter().map(|s| s.to_string()).collect()),
            notes: Mutex::new(HashMap::new()),
            mounted: Mutex::new(Vec::new()),
            guest_root: guest_root.to_path_buf(),
            fail_start: None,
            guardian_lookups: AtomicUsize::new(0),
        }
    }

    fn failing_start(mut self, vm: &'static str) -> Self {
        self.fail_start = Some(vm);
        self
    }
}

impl Hypervisor for FakeHost {
    fn list_vm_names(&self) -> Result<Vec<String>> {
        Ok(self.vms.lock().clone())
    }

    fn vm_exists(&self, name: &str) -> Result<bool> {
        Ok(self.vms.lock().iter().any(|v| v.eq_ignore_ascii_case(name)))
    }

    fn clone_disk(&self, source: &Path, destination: &Path) -> Result<()> {
        std::fs::copy(source, destination)?;
        Ok(())
    }

    fn mount_disk(&self, disk: &Path) -> Result<PathBuf> {
        self.mounted.lock().push(disk.to_path_buf());
        Ok(self.guest_root.clone())
    }

    fn dismount_disk(&self, disk: &Path) -> Result<()> {
        self.mounted.lock().retain(|d| d != disk);
        Ok(())
    }

    fn create_vm(&self, spec: &VmSpec) -> Result<()> {
        if !spec.vhdx_path.exists() {
            return Err(Error::PowerShell(format!("{} not found", spec.vhdx_path.display())));
        }
        self.vms.lock().push(spec.name.clone());
        Ok(())
    }

    fn ensure_guardian(&self, name: &str) -> Result<Guardian> {
        self.guardian_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(Guardian {
            name: name.to_string(),
        })
    }

    fn new_key_protector(&self, _guardian: &Guardian) -> Result<KeyProtector> {
        Ok(KeyProtector(vec![0xAB; 32]))
    }

    fn set_key_protector(&self, _vm: &str, _protector: &KeyProtector) -> Result<()> {
        Ok(())
    }

    fn enable_tpm(&self, _vm: &str) -> Result<()> {
        Ok(())
    }

    fn start_vm(&self, vm: &str) -> Result<()> {
        if self.fail_start == Some(vm) {
            return Err(Error::PowerShell("Start-VM: insufficient memory".into()));
        }
        Ok(())
    }

    fn vm_state(&self, _vm: &str) -> Result<VmState> {
        Ok(VmState::Running)
    }

    fn bios_serial(&self, vm: &str) -> Result<String> {
        Ok(format!("0000-{}", vm.len()))
    }

    fn set_notes(&self, vm: &str, notes: &str) -> Result<()> {
        self.notes.lock().insert(vm.to_string(), notes.to_string());
        Ok(())
    }
}

/// Writes a placeholder disk where the real builder would produce one
struct FakeImageBuilder {
    builds: Arc<AtomicUsize>,
}

impl ImageBuilder for FakeImageBuilder {
    fn build_image(&self, _install_media: &Path, destination: &Path) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        std::fs::write(destination, b"reference disk")?;
        Ok(())
    }
}

struct FakeDirectory {
    profiles: Vec<RemoteProfile>,
    listings: Arc<AtomicUsize>,
}

impl DirectoryApi for FakeDirectory {
    fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    fn list_profiles(&self) -> Result<Vec<RemoteProfile>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(self.profiles.clone())
    }

    fn organization(&self) -> Result<Organization> {
        Ok(Organization {
            id: "2f6c1b0e-tenant".into(),
            display_name: Some("Contoso".into()),
        })
    }

    fn default_domain(&self) -> Result<String> {
        Ok("contoso.onmicrosoft.com".into())
    }
}

struct Env {
    temp: TempDir,
    guest: TempDir,
    catalog: FleetCatalog,
    builds: Arc<AtomicUsize>,
    listings: Arc<AtomicUsize>,
}

impl Env {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let media = temp.path().join("media").join("win11.iso");
        std::fs::create_dir_all(media.parent().unwrap()).unwrap();
        std::fs::write(&media, b"iso").unwrap();

        let catalog = FleetCatalog::new(temp.path().join("vms"), "External")
            .with_image("win11-23h2", &media, temp.path().join("ref").join("win11.vhdx"))
            .with_tenant("contoso", "admin@contoso.com", "win11-23h2");

        Self {
            temp,
            guest: TempDir::new().unwrap(),
            catalog,
            builds: Arc::new(AtomicUsize::new(0)),
            listings: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn orchestrator(&self, host: Arc<FakeHost>, profiles: Vec<RemoteProfile>) -> FleetOrchestrator {
        let images = ReferenceImageBuilder::new(Box::new(FakeImageBuilder {
            builds: self.builds.clone(),
        }));
        let policy = PolicyFetcher::new(
            Box::new(FakeDirectory {
                profiles,
                listings: self.listings.clone(),
            }),
            Box::new(AutoSelect),
        );
        FleetOrchestrator::new(self.catalog.clone(), host, images, policy)
    }

    fn workspace(&self) -> PathBuf {
        self.catalog.workspace_dir("contoso")
    }
}

fn standard_profile() -> RemoteProfile {
    RemoteProfile {
        id: "b3f1c2d4-profile".into(),
        display_name: "Standard users".into(),
        oobe: OobeSettings {
            user_type: Some("standard".into()),
            privacy_settings_hidden: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn names(outcomes: &[(String, VmOutcome)]) -> Vec<&str> {
    outcomes.iter().map(|(n, _)| n.as_str()).collect()
}

#[test]
fn test_three_vms_end_to_end() {
    let env = Env::new();
    let host = Arc::new(FakeHost::new(&["contoso_1", "other_4"], env.guest.path()));
    let orchestrator = env.orchestrator(host.clone(), vec![standard_profile()]);

    let request = VmRequest::builder("contoso").count(3).build_validated().unwrap();
    let report = orchestrator.run(&request).unwrap();

    assert!(report.is_success());
    assert_eq!(names(&report.results), ["contoso_2", "contoso_3", "contoso_4"]);
    assert_eq!(env.builds.load(Ordering::SeqCst), 1);
    assert_eq!(env.listings.load(Ordering::SeqCst), 1);
    assert_eq!(host.guardian_lookups.load(Ordering::SeqCst), 1);
    assert!(host.mounted.lock().is_empty());

    for name in ["contoso_2", "contoso_3", "contoso_4"] {
        assert!(env.workspace().join(format!("{}.vhdx", name)).exists());
    }
    assert_eq!(
        host.notes.lock().get("contoso_3").map(String::as_str),
        Some("Serial# 0000-9 | Tenant: contoso")
    );

    let injected = guest_provisioning_dir(env.guest.path()).join(GUEST_CONFIG_FILE);
    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(injected).unwrap()).unwrap();
    // cortana + patch download + standard user + privacy
    assert_eq!(config["CloudAssignedOobeConfig"], 270);
    assert_eq!(config["CloudAssignedTenantDomain"], "contoso.onmicrosoft.com");
    assert_eq!(config["ZtdCorrelationId"], "b3f1c2d4-profile");
}

#[test]
fn test_second_run_reuses_cached_inputs() {
    let env = Env::new();
    let host = Arc::new(FakeHost::new(&[], env.guest.path()));

    let first = env
        .orchestrator(host.clone(), vec![standard_profile()])
        .run(&VmRequest::builder("contoso").count(2).build())
        .unwrap();
    assert_eq!(names(&first.results), ["contoso_1", "contoso_2"]);

    let second = env
        .orchestrator(host.clone(), vec![standard_profile()])
        .run(&VmRequest::builder("CONTOSO").count(1).build())
        .unwrap();
    assert_eq!(names(&second.results), ["contoso_3"]);

    assert_eq!(env.builds.load(Ordering::SeqCst), 1);
    assert_eq!(env.listings.load(Ordering::SeqCst), 1);
}

#[test]
fn test_mixed_case_host_names_are_not_reused() {
    let env = Env::new();
    let host = Arc::new(FakeHost::new(&["Contoso_1", "CONTOSO_2"], env.guest.path()));

    let report = env
        .orchestrator(host.clone(), vec![])
        .run(&VmRequest::builder("contoso").count(1).skip_enrollment(true).build())
        .unwrap();

    assert!(report.is_success());
    assert_eq!(names(&report.results), ["contoso_3"]);
}

#[test]
fn test_fail_fast_stops_after_first_failure() {
    let env = Env::new();
    let host = Arc::new(FakeHost::new(&[], env.guest.path()).failing_start("contoso_2"));
    let orchestrator = env.orchestrator(host.clone(), vec![]);

    let request = VmRequest::builder("contoso")
        .count(3)
        .fail_fast(true)
        .build_validated()
        .unwrap();
    let report = orchestrator.run(&request).unwrap();

    assert!(!report.is_success());
    assert!(matches!(report.results[0].1, VmOutcome::Provisioned(_)));
    match &report.results[1].1 {
        VmOutcome::Failed(Error::Provisioning { vm, step, .. }) => {
            assert_eq!(vm, "contoso_2");
            assert_eq!(step.to_string(), "start VM");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(matches!(report.results[2].1, VmOutcome::Skipped));
    // contoso_3 was never created
    assert!(!host.vms.lock().iter().any(|v| v == "contoso_3"));
}

#[test]
fn test_dry_run_leaves_host_untouched() {
    let env = Env::new();
    let host = Arc::new(FakeHost::new(&["contoso_5"], env.guest.path()));
    let orchestrator = env.orchestrator(host.clone(), vec![standard_profile()]);

    let report = orchestrator
        .run(&VmRequest::builder("contoso").count(2).dry_run(true).build())
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(names(&report.results), ["contoso_6", "contoso_7"]);
    assert_eq!(report.image_status.to_string(), "build from install media");
    assert_eq!(env.builds.load(Ordering::SeqCst), 0);
    assert_eq!(env.listings.load(Ordering::SeqCst), 0);
    assert_eq!(host.vms.lock().len(), 1);
    assert!(!env.workspace().exists());
    assert!(!env.temp.path().join("ref").join("win11.vhdx").exists());
}

#[test]
fn test_invalid_request_rejected_before_host_calls() {
    let env = Env::new();
    let host = Arc::new(FakeHost::new(&[], env.guest.path()));
    let orchestrator = env.orchestrator(host.clone(), vec![]);

    let err = orchestrator
        .run(&VmRequest::builder("contoso").count(0).build())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert_eq!(env.builds.load(Ordering::SeqCst), 0);
}

#[test]
#[ignore] // Run manually on a Hyper-V host: cargo test --test fleet -- --ignored
fn test_live_host_lists_vms() {
    let hyperv = hv_fleet::HyperV::new(Timeouts::default()).unwrap();
    assert!(hyperv.is_available().unwrap());
    let names = hyperv.list_vm_names().unwrap();
    println!("{} VMs on host", names.len());
}
