//! Orchestrator for provisioning a fleet of VMs for one tenant

use crate::config::{FleetCatalog, TenantConfig};
use crate::hyperv::Hypervisor;
use crate::image::{ImageStatus, ReferenceImageBuilder};
use crate::models::{FailurePolicy, VmRecord, VmRequest};
use crate::naming::NameAllocator;
use crate::policy::PolicyFetcher;
use crate::provisioner::{DeviceProvisioner, ProvisionRequest};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Result for one allocated VM name
#[derive(Debug)]
pub enum VmOutcome {
    Provisioned(VmRecord),
    Failed(Error),
    /// Not attempted because an earlier VM failed under fail-fast
    Skipped,
    /// Dry run: would be provisioned
    Planned,
}

impl VmOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, VmOutcome::Failed(_) | VmOutcome::Skipped)
    }
}

/// What happened to the enrollment payload for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentStatus {
    /// The request asked to skip enrollment
    NotRequested,
    /// Config injected into every VM
    Ready(PathBuf),
    /// No profile available; VMs were provisioned without a payload
    Unavailable(String),
    /// Dry run: the cached config would be reused
    WouldReuse(PathBuf),
    /// Dry run: the directory would be queried
    WouldFetch,
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollmentStatus::NotRequested => write!(f, "skipped by request"),
            EnrollmentStatus::Ready(path) => write!(f, "{}", path.display()),
            EnrollmentStatus::Unavailable(reason) => write!(f, "none ({})", reason),
            EnrollmentStatus::WouldReuse(path) => write!(f, "reuse {}", path.display()),
            EnrollmentStatus::WouldFetch => write!(f, "fetch from directory"),
        }
    }
}

#[derive(Debug)]
pub struct FleetReport {
    pub run_id: Uuid,
    pub tenant: String,
    pub image: String,
    pub image_status: ImageStatus,
    pub workspace: PathBuf,
    pub enrollment: EnrollmentStatus,
    pub dry_run: bool,
    /// One entry per allocated name, in provisioning order
    pub results: Vec<(String, VmOutcome)>,
}

impl FleetReport {
    pub fn provisioned(&self) -> impl Iterator<Item = &VmRecord> {
        self.results.iter().filter_map(|(_, outcome)| match outcome {
            VmOutcome::Provisioned(record) => Some(record),
            _ => None,
        })
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, outcome)| outcome.is_failure())
            .count()
    }

    /// True when every allocated VM came up (or would, for a dry run)
    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Runs fleet requests against one host and catalog
pub struct FleetOrchestrator {
    catalog: FleetCatalog,
    hypervisor: Arc<dyn Hypervisor>,
    images: ReferenceImageBuilder,
    policy: PolicyFetcher,
    provisioner: DeviceProvisioner,
}

impl FleetOrchestrator {
    pub fn new(
        catalog: FleetCatalog,
        hypervisor: Arc<dyn Hypervisor>,
        images: ReferenceImageBuilder,
        policy: PolicyFetcher,
    ) -> Self {
        let provisioner = DeviceProvisioner::new(hypervisor.clone());
        Self {
            catalog,
            hypervisor,
            images,
            policy,
            provisioner,
        }
    }

    /// Provision `request.count` VMs for a tenant.
    ///
    /// Errors returned here are fatal to the whole run and happen before any
    /// VM is touched. Per-VM failures are recorded in the report instead.
    pub fn run(&self, request: &VmRequest) -> Result<FleetReport> {
        request.validate()?;
        let tenant = self.catalog.tenant(&request.tenant_name)?;
        let image = self
            .catalog
            .resolve_image(tenant, request.image_override.as_deref())?;
        let workspace = self.catalog.workspace_dir(&tenant.tenant_name);

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("fleet_run", %run_id, tenant = %tenant.tenant_name);
        let _enter = span.enter();

        let image_status = self.images.status(image)?;
        let mut report = FleetReport {
            run_id,
            tenant: tenant.tenant_name.clone(),
            image: image.image_name.clone(),
            image_status,
            workspace: workspace.clone(),
            enrollment: EnrollmentStatus::NotRequested,
            dry_run: request.dry_run,
            results: Vec::new(),
        };

        if request.dry_run {
            self.plan(request, tenant, &mut report)?;
            return Ok(report);
        }

        tracing::info!(
            image = %image.image_name,
            count = request.count,
            policy = ?request.failure_policy,
            "Starting fleet run"
        );

        let reference = self.images.ensure_image(image)?;
        std::fs::create_dir_all(&workspace).map_err(|e| {
            Error::Configuration(format!(
                "cannot create workspace {}: {}",
                workspace.display(),
                e
            ))
        })?;

        let enrollment_config = if request.skip_enrollment {
            None
        } else {
            match self.policy.fetch_or_create(&workspace) {
                Ok(path) => {
                    report.enrollment = EnrollmentStatus::Ready(path.clone());
                    Some(path)
                }
                Err(e) if e.skips_enrollment() => {
                    tracing::warn!(reason = %e, "Provisioning without enrollment config");
                    report.enrollment = EnrollmentStatus::Unavailable(e.to_string());
                    None
                }
                Err(e) => return Err(e),
            }
        };

        let names = self.allocate(tenant, request.count)?;
        self.provision_all(
            request,
            tenant,
            &reference,
            &workspace,
            enrollment_config.as_deref(),
            names,
            &mut report,
        );

        tracing::info!(
            provisioned = report.provisioned().count(),
            failed = report.failed_count(),
            "Fleet run finished"
        );
        Ok(report)
    }

    fn plan(
        &self,
        request: &VmRequest,
        tenant: &TenantConfig,
        report: &mut FleetReport,
    ) -> Result<()> {
        report.enrollment = if request.skip_enrollment {
            EnrollmentStatus::NotRequested
        } else {
            let cached = PolicyFetcher::config_path(&report.workspace);
            if cached.exists() {
                EnrollmentStatus::WouldReuse(cached)
            } else {
                EnrollmentStatus::WouldFetch
            }
        };

        report.results = self
            .allocate(tenant, request.count)?
            .into_iter()
            .map(|name| (name, VmOutcome::Planned))
            .collect();

        tracing::info!(
            image = %report.image,
            image_status = %report.image_status,
            enrollment = %report.enrollment,
            count = report.results.len(),
            "Dry run; nothing was changed"
        );
        Ok(())
    }

    fn allocate(&self, tenant: &TenantConfig, count: u32) -> Result<Vec<String>> {
        let host_names = self.hypervisor.list_vm_names()?;
        let existing = host_names
            .iter()
            .filter(|n| NameAllocator::is_tenant_vm(&tenant.tenant_name, n));
        let names = NameAllocator::allocate(&tenant.tenant_name, count, existing);
        tracing::debug!(?names, "Allocated VM names");
        Ok(names)
    }

    #[allow(clippy::too_many_arguments)]
    fn provision_all(
        &self,
        request: &VmRequest,
        tenant: &TenantConfig,
        reference: &Path,
        workspace: &Path,
        enrollment_config: Option<&Path>,
        names: Vec<String>,
        report: &mut FleetReport,
    ) {
        let mut stopped = false;
        for name in names {
            if stopped {
                tracing::warn!(vm = %name, "Skipped after earlier failure");
                report.results.push((name, VmOutcome::Skipped));
                continue;
            }

            let req = ProvisionRequest {
                name: &name,
                tenant: &tenant.tenant_name,
                reference_image: reference,
                workspace,
                switch_name: &self.catalog.switch_name,
                vlan_id: self.catalog.vlan_id,
                cpu_count: request.cpu_count,
                memory_bytes: request.memory_bytes,
                enrollment_config,
            };
            let outcome = match self.provisioner.provision(&req) {
                Ok(record) => VmOutcome::Provisioned(record),
                Err(e) => {
                    tracing::error!(vm = %name, error = %e, "VM failed");
                    stopped = request.failure_policy == FailurePolicy::FailFast;
                    VmOutcome::Failed(e)
                }
            };
            report.results.push((name, outcome));
        }
    }
}
