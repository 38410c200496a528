//! Tenant and image catalog
//!
//! The catalog is a single JSON document loaded once at process start and
//! handed to the [`FleetOrchestrator`](crate::FleetOrchestrator) as an
//! immutable value.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default catalog location used by the CLI
pub const DEFAULT_CATALOG_PATH: &str = r"C:\HyperVFleet\fleet.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub tenant_name: String,
    pub admin_identity: String,
    pub image_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageCatalogEntry {
    pub image_name: String,
    pub install_media_path: PathBuf,
    pub reference_image_path: PathBuf,
}

/// Per-call limits for hypervisor work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    pub command_secs: u64,
    pub disk_copy_secs: u64,
    pub image_build_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_secs: 5 * 60,
            disk_copy_secs: 60 * 60,
            image_build_secs: 4 * 60 * 60,
        }
    }
}

impl Timeouts {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn disk_copy(&self) -> Duration {
        Duration::from_secs(self.disk_copy_secs)
    }

    pub fn image_build(&self) -> Duration {
        Duration::from_secs(self.image_build_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetCatalog {
    /// Root directory; each tenant gets a workspace below it
    pub vm_path: PathBuf,
    #[serde(rename = "vSwitchName")]
    pub switch_name: String,
    #[serde(rename = "vLanId", default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_builder_script: Option<PathBuf>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub tenant_config: Vec<TenantConfig>,
    #[serde(default)]
    pub images: Vec<ImageCatalogEntry>,
}

impl FleetCatalog {
    pub fn new(vm_path: impl Into<PathBuf>, switch_name: impl Into<String>) -> Self {
        Self {
            vm_path: vm_path.into(),
            switch_name: switch_name.into(),
            vlan_id: None,
            image_builder_script: None,
            timeouts: Timeouts::default(),
            tenant_config: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn with_vlan(mut self, vlan_id: u16) -> Self {
        self.vlan_id = Some(vlan_id);
        self
    }

    pub fn with_image_builder_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.image_builder_script = Some(script.into());
        self
    }

    pub fn with_tenant(
        mut self,
        tenant_name: impl Into<String>,
        admin_identity: impl Into<String>,
        image_name: impl Into<String>,
    ) -> Self {
        self.tenant_config.push(TenantConfig {
            tenant_name: tenant_name.into(),
            admin_identity: admin_identity.into(),
            image_name: image_name.into(),
        });
        self
    }

    pub fn with_image(
        mut self,
        image_name: impl Into<String>,
        install_media_path: impl Into<PathBuf>,
        reference_image_path: impl Into<PathBuf>,
    ) -> Self {
        self.images.push(ImageCatalogEntry {
            image_name: image_name.into(),
            install_media_path: install_media_path.into(),
            reference_image_path: reference_image_path.into(),
        });
        self
    }

    /// Load and validate a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        let catalog: FleetCatalog = serde_json::from_str(&raw).map_err(|e| {
            Error::Configuration(format!("invalid catalog {}: {}", path.display(), e))
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Validate and write the catalog, replacing any existing file atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(path, serde_json::to_string_pretty(self)?.as_bytes())
    }

    pub fn validate(&self) -> Result<()> {
        if self.vm_path.as_os_str().is_empty() {
            return Err(Error::Configuration("vmPath cannot be empty".into()));
        }
        if self.switch_name.trim().is_empty() {
            return Err(Error::Configuration("vSwitchName cannot be empty".into()));
        }
        for (i, t) in self.tenant_config.iter().enumerate() {
            validate_tenant_name(&t.tenant_name)?;
            if self.tenant_config[..i]
                .iter()
                .any(|o| o.tenant_name.eq_ignore_ascii_case(&t.tenant_name))
            {
                return Err(Error::Configuration(format!(
                    "duplicate tenant '{}'",
                    t.tenant_name
                )));
            }
        }
        for (i, img) in self.images.iter().enumerate() {
            if img.image_name.trim().is_empty() {
                return Err(Error::Configuration("imageName cannot be empty".into()));
            }
            if self.images[..i].iter().any(|o| o.image_name == img.image_name) {
                return Err(Error::Configuration(format!(
                    "duplicate image '{}'",
                    img.image_name
                )));
            }
        }
        Ok(())
    }

    pub fn tenant(&self, name: &str) -> Result<&TenantConfig> {
        self.tenant_config
            .iter()
            .find(|t| t.tenant_name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Configuration(format!("tenant '{}' is not in the catalog", name)))
    }

    pub fn image(&self, name: &str) -> Result<&ImageCatalogEntry> {
        self.images
            .iter()
            .find(|i| i.image_name == name)
            .ok_or_else(|| Error::Configuration(format!("image '{}' is not in the catalog", name)))
    }

    /// Image for a run: the explicit override if given, else the tenant default
    pub fn resolve_image(
        &self,
        tenant: &TenantConfig,
        override_name: Option<&str>,
    ) -> Result<&ImageCatalogEntry> {
        self.image(override_name.unwrap_or(&tenant.image_name))
    }

    /// Per-tenant directory holding VM disks and the cached enrollment config
    pub fn workspace_dir(&self, tenant_name: &str) -> PathBuf {
        self.vm_path.join(tenant_name)
    }

    pub fn add_tenant(&mut self, tenant: TenantConfig) -> Result<()> {
        validate_tenant_name(&tenant.tenant_name)?;
        if self.tenant(&tenant.tenant_name).is_ok() {
            return Err(Error::Configuration(format!(
                "tenant '{}' already exists",
                tenant.tenant_name
            )));
        }
        self.tenant_config.push(tenant);
        Ok(())
    }

    pub fn add_image(&mut self, image: ImageCatalogEntry) -> Result<()> {
        if self.image(&image.image_name).is_ok() {
            return Err(Error::Configuration(format!(
                "image '{}' already exists",
                image.image_name
            )));
        }
        self.images.push(image);
        Ok(())
    }
}

// Tenant names become directory names and VM name prefixes. Hyper-V treats
// `-Name` as a wildcard pattern, so brackets are rejected too.
fn validate_tenant_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Configuration("tenantName cannot be empty".into()));
    }
    if name
        .chars()
        .any(|c| {
            matches!(
                c,
                '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '[' | ']'
            )
        })
    {
        return Err(Error::Configuration(format!(
            "tenantName '{}' contains characters not allowed in a path or VM name",
            name
        )));
    }
    Ok(())
}

/// Write `bytes` to a sibling temp file and rename it over `path`
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Configuration(format!("{} has no file name", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));

    if let Err(e) = write_synced(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

// Data must reach the disk before the rename does.
fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
