//! Zero-touch enrollment profile and the config file the guest reads at first boot

use crate::graph::RemoteProfile;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the cached enrollment config inside a tenant workspace
pub const ENROLLMENT_CONFIG_FILE: &str = "EnrollmentConfig.json";
/// Directory inside the guest OS volume that Windows setup reads the config from
pub const GUEST_PROVISIONING_DIR: [&str; 3] = ["Windows", "Provisioning", "Autopilot"];
/// File name Windows setup expects inside [`GUEST_PROVISIONING_DIR`]
pub const GUEST_CONFIG_FILE: &str = "AutopilotConfigurationFile.json";

/// Provisioning directory below a mounted guest volume root
pub fn guest_provisioning_dir(volume_root: &Path) -> PathBuf {
    GUEST_PROVISIONING_DIR
        .iter()
        .fold(volume_root.to_path_buf(), |dir, part| dir.join(part))
}

const SCHEMA_VERSION: u32 = 2049;
const UPDATE_TIMEOUT_MS: u64 = 1_800_000;

/// Bitmask of out-of-box setup screens to skip or alter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OobeFlags(u32);

impl OobeFlags {
    pub const STANDARD_USER: u32 = 2;
    pub const HIDE_PRIVACY: u32 = 4;
    pub const SKIP_CORTANA: u32 = 8;
    pub const HIDE_EULA: u32 = 16;
    pub const SHARED_DEVICE: u32 = 32;
    pub const SKIP_EXPRESS_SETTINGS: u32 = 64;
    pub const PATCH_DOWNLOAD: u32 = 256;
    pub const SKIP_KEYBOARD: u32 = 1024;

    /// Flags every profile carries
    pub const BASE: u32 = Self::SKIP_CORTANA | Self::PATCH_DOWNLOAD;

    pub fn base() -> Self {
        Self(Self::BASE)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits;
    }

    /// Compose the mask for a remote profile's OOBE settings
    pub fn from_profile(profile: &RemoteProfile) -> Self {
        let oobe = &profile.oobe;
        let mut flags = Self::base();

        if eq_ci(oobe.user_type.as_deref(), "standard") {
            flags.insert(Self::STANDARD_USER);
        }
        if oobe.privacy_settings_hidden {
            flags.insert(Self::HIDE_PRIVACY);
        }
        if oobe.eula_hidden {
            flags.insert(Self::HIDE_EULA);
        }
        if oobe.keyboard_selection_page_skipped {
            flags.insert(Self::SKIP_KEYBOARD);
        }
        if eq_ci(oobe.device_usage_type.as_deref(), "shared") {
            flags.insert(Self::SHARED_DEVICE | Self::SKIP_EXPRESS_SETTINGS);
        }
        flags
    }
}

fn eq_ci(value: Option<&str>, expected: &str) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case(expected))
}

/// How the device joins the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainJoinMethod {
    CloudOnly = 0,
    Hybrid = 1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentProfile {
    pub correlation_id: String,
    pub display_name: String,
    pub domain_join_method: DomainJoinMethod,
    pub language: Option<String>,
    pub device_name_template: Option<String>,
    pub oobe_flags: OobeFlags,
    pub forced_enrollment: bool,
    pub tenant_id: String,
    pub tenant_domain: String,
    pub hybrid_skip_connectivity_check: bool,
}

impl EnrollmentProfile {
    pub fn from_remote(
        profile: &RemoteProfile,
        tenant_id: impl Into<String>,
        tenant_domain: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: profile.id.clone(),
            display_name: profile.display_name.clone(),
            domain_join_method: if profile.is_hybrid_join() {
                DomainJoinMethod::Hybrid
            } else {
                DomainJoinMethod::CloudOnly
            },
            language: profile.language.clone().filter(|l| !l.is_empty()),
            device_name_template: profile
                .device_name_template
                .clone()
                .filter(|t| !t.is_empty()),
            oobe_flags: OobeFlags::from_profile(profile),
            forced_enrollment: profile.oobe.escape_link_hidden,
            tenant_id: tenant_id.into(),
            tenant_domain: tenant_domain.into(),
            hybrid_skip_connectivity_check: profile.hybrid_skip_connectivity_check == Some(true),
        }
    }

    pub fn to_config_file(&self) -> Result<EnrollmentConfigFile> {
        let forced = u8::from(self.forced_enrollment);
        let server_data = AadServerData {
            zero_touch_config: ZeroTouchConfig {
                tenant_upn: String::new(),
                forced_enrollment: forced,
                tenant_domain: self.tenant_domain.clone(),
            },
        };

        Ok(EnrollmentConfigFile {
            comment: format!("Profile {}", self.display_name),
            version: SCHEMA_VERSION,
            correlation_id: self.correlation_id.clone(),
            domain_join_method: self.domain_join_method as u8,
            device_name: self.device_name_template.clone(),
            language: self.language.clone(),
            oobe_config: self.oobe_flags.bits(),
            forced_enrollment: forced,
            tenant_id: self.tenant_id.clone(),
            tenant_domain: self.tenant_domain.clone(),
            aad_server_data: serde_json::to_string(&server_data)?,
            hybrid_skip_connectivity_check: self.hybrid_skip_connectivity_check.then_some(1),
            update_disabled: 1,
            update_timeout_ms: UPDATE_TIMEOUT_MS,
        })
    }
}

/// On-disk enrollment config, using the field names Windows setup reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentConfigFile {
    #[serde(rename = "Comment_File")]
    pub comment: String,
    #[serde(rename = "Version")]
    pub version: u32,
    #[serde(rename = "ZtdCorrelationId")]
    pub correlation_id: String,
    #[serde(rename = "CloudAssignedDomainJoinMethod")]
    pub domain_join_method: u8,
    #[serde(rename = "CloudAssignedDeviceName", skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(rename = "CloudAssignedLanguage", skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(rename = "CloudAssignedOobeConfig")]
    pub oobe_config: u32,
    #[serde(rename = "CloudAssignedForcedEnrollment")]
    pub forced_enrollment: u8,
    #[serde(rename = "CloudAssignedTenantId")]
    pub tenant_id: String,
    #[serde(rename = "CloudAssignedTenantDomain")]
    pub tenant_domain: String,
    #[serde(rename = "CloudAssignedAadServerData")]
    pub aad_server_data: String,
    #[serde(
        rename = "HybridJoinSkipDCConnectivityCheck",
        skip_serializing_if = "Option::is_none"
    )]
    pub hybrid_skip_connectivity_check: Option<u8>,
    #[serde(rename = "CloudAssignedAutopilotUpdateDisabled")]
    pub update_disabled: u8,
    #[serde(rename = "CloudAssignedAutopilotUpdateTimeout")]
    pub update_timeout_ms: u64,
}

#[derive(Debug, Serialize)]
struct AadServerData {
    #[serde(rename = "ZeroTouchConfig")]
    zero_touch_config: ZeroTouchConfig,
}

#[derive(Debug, Serialize)]
struct ZeroTouchConfig {
    #[serde(rename = "CloudAssignedTenantUpn")]
    tenant_upn: String,
    #[serde(rename = "ForcedEnrollment")]
    forced_enrollment: u8,
    #[serde(rename = "CloudAssignedTenantDomain")]
    tenant_domain: String,
}
