//! Fleet run request with builder pattern

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIN_MEMORY_BYTES: u64 = 2 * GIB;
pub const MAX_MEMORY_BYTES: u64 = 20 * GIB;
pub const DEFAULT_MEMORY_BYTES: u64 = 4 * GIB;
pub const MAX_VM_COUNT: u32 = 999;
pub const MAX_CPU_COUNT: u32 = 999;

/// What a fleet run does after one VM fails to provision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Record the failure and keep provisioning the remaining names
    #[default]
    Isolate,
    /// Stop at the first failure; remaining names are not attempted
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRequest {
    pub tenant_name: String,
    /// Catalog image to use instead of the tenant's default
    pub image_override: Option<String>,
    pub count: u32,
    pub cpu_count: u32,
    pub memory_bytes: u64,
    pub skip_enrollment: bool,
    pub failure_policy: FailurePolicy,
    pub dry_run: bool,
}

impl Default for VmRequest {
    fn default() -> Self {
        Self {
            tenant_name: String::new(),
            image_override: None,
            count: 1,
            cpu_count: 2,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            skip_enrollment: false,
            failure_policy: FailurePolicy::default(),
            dry_run: false,
        }
    }
}

impl VmRequest {
    pub fn builder(tenant_name: impl Into<String>) -> VmRequestBuilder {
        VmRequestBuilder {
            request: VmRequest {
                tenant_name: tenant_name.into(),
                ..Default::default()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_name.trim().is_empty() {
            return Err(Error::InvalidRequest("tenant name cannot be empty".into()));
        }
        if !(1..=MAX_VM_COUNT).contains(&self.count) {
            return Err(Error::InvalidRequest(format!(
                "VM count must be between 1 and {}, got {}",
                MAX_VM_COUNT, self.count
            )));
        }
        if !(1..=MAX_CPU_COUNT).contains(&self.cpu_count) {
            return Err(Error::InvalidRequest(format!(
                "CPU count must be between 1 and {}, got {}",
                MAX_CPU_COUNT, self.cpu_count
            )));
        }
        if !(MIN_MEMORY_BYTES..=MAX_MEMORY_BYTES).contains(&self.memory_bytes) {
            return Err(Error::InvalidRequest(format!(
                "memory must be between 2GB and 20GB, got {} bytes",
                self.memory_bytes
            )));
        }
        Ok(())
    }
}

pub struct VmRequestBuilder {
    request: VmRequest,
}

impl VmRequestBuilder {
    pub fn image(mut self, image_name: impl Into<String>) -> Self {
        self.request.image_override = Some(image_name.into());
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.request.count = count;
        self
    }

    pub fn cpu_count(mut self, count: u32) -> Self {
        self.request.cpu_count = count;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.request.memory_bytes = bytes;
        self
    }

    pub fn memory_gb(self, gb: u64) -> Self {
        self.memory_bytes(gb.saturating_mul(GIB))
    }

    pub fn skip_enrollment(mut self, skip: bool) -> Self {
        self.request.skip_enrollment = skip;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.request.failure_policy = policy;
        self
    }

    pub fn fail_fast(self, fail_fast: bool) -> Self {
        self.failure_policy(if fail_fast {
            FailurePolicy::FailFast
        } else {
            FailurePolicy::Isolate
        })
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.request.dry_run = dry_run;
        self
    }

    pub fn build(self) -> VmRequest {
        self.request
    }

    pub fn build_validated(self) -> Result<VmRequest> {
        let request = self.build();
        request.validate()?;
        Ok(request)
    }
}
