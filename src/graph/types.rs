//! Directory API wire types

use serde::{Deserialize, Serialize};

pub const AZURE_AD_JOIN_PROFILE: &str =
    "#microsoft.graph.azureADWindowsAutopilotDeploymentProfile";
pub const HYBRID_JOIN_PROFILE: &str =
    "#microsoft.graph.activeDirectoryWindowsAutopilotDeploymentProfile";

/// One page of a collection response
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Out-of-box experience settings of a deployment profile.
///
/// Older API versions expose the same toggles as `hidePrivacySettings`,
/// `hideEULA`, `skipKeyboardSelectionPage` and `hideEscapeLink`; both spellings
/// are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OobeSettings {
    #[serde(alias = "hidePrivacySettings")]
    pub privacy_settings_hidden: bool,
    #[serde(alias = "hideEULA")]
    pub eula_hidden: bool,
    #[serde(alias = "skipKeyboardSelectionPage")]
    pub keyboard_selection_page_skipped: bool,
    #[serde(alias = "hideEscapeLink")]
    pub escape_link_hidden: bool,
    pub user_type: Option<String>,
    pub device_usage_type: Option<String>,
}

/// An Autopilot deployment profile as listed by the directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProfile {
    pub id: String,
    #[serde(rename = "@odata.type", default)]
    pub odata_type: Option<String>,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub device_name_template: Option<String>,
    #[serde(
        default,
        alias = "outOfBoxExperienceSettings",
        rename = "outOfBoxExperienceSetting"
    )]
    pub oobe: OobeSettings,
    #[serde(rename = "hybridAzureADJoinSkipConnectivityCheck", default)]
    pub hybrid_skip_connectivity_check: Option<bool>,
}

impl RemoteProfile {
    pub fn is_hybrid_join(&self) -> bool {
        self.odata_type.as_deref() == Some(HYBRID_JOIN_PROFILE)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub id: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
}
