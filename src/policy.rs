//! Enrollment profile retrieval and caching
//!
//! The enrollment config file in a tenant workspace is the cache: when it
//! exists nothing is fetched, when it is missing the directory is queried,
//! one profile is chosen and the file is written atomically. Deleting the file
//! is the only way to force a re-fetch.

use crate::config::write_atomic;
use crate::graph::{DirectoryApi, RemoteProfile};
use crate::models::{EnrollmentProfile, ENROLLMENT_CONFIG_FILE};
use crate::{Error, Result};
use std::path::{Path, PathBuf};

/// Picks one profile when the directory offers more than one
#[cfg_attr(test, mockall::automock)]
pub trait ProfileSelector {
    /// Index into `candidates`, or `None` when nothing was chosen
    fn choose(&self, candidates: &[RemoteProfile]) -> Result<Option<usize>>;
}

/// Never chooses between several profiles; the run continues without enrollment
pub struct AutoSelect;

impl ProfileSelector for AutoSelect {
    fn choose(&self, candidates: &[RemoteProfile]) -> Result<Option<usize>> {
        tracing::warn!(
            candidates = candidates.len(),
            "Several enrollment profiles found and none chosen automatically"
        );
        Ok(None)
    }
}

/// Fails the run when the choice is ambiguous
pub struct RejectAmbiguous;

impl ProfileSelector for RejectAmbiguous {
    fn choose(&self, candidates: &[RemoteProfile]) -> Result<Option<usize>> {
        let names: Vec<_> = candidates.iter().map(|p| p.display_name.as_str()).collect();
        Err(Error::Configuration(format!(
            "{} enrollment profiles match, pick one interactively: {}",
            candidates.len(),
            names.join(", ")
        )))
    }
}

/// Asks the operator on the terminal
pub struct OperatorPrompt;

struct Choice<'a> {
    index: usize,
    profile: &'a RemoteProfile,
}

impl std::fmt::Display for Choice<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.profile.display_name, self.profile.id)?;
        if let Some(desc) = self.profile.description.as_deref().filter(|d| !d.is_empty()) {
            write!(f, " - {}", desc)?;
        }
        Ok(())
    }
}

impl ProfileSelector for OperatorPrompt {
    fn choose(&self, candidates: &[RemoteProfile]) -> Result<Option<usize>> {
        let choices: Vec<_> = candidates
            .iter()
            .enumerate()
            .map(|(index, profile)| Choice { index, profile })
            .collect();

        match inquire::Select::new("Select the enrollment profile to apply:", choices).prompt() {
            Ok(choice) => Ok(Some(choice.index)),
            Err(
                inquire::InquireError::OperationCanceled
                | inquire::InquireError::OperationInterrupted,
            ) => Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot prompt for an enrollment profile");
                Ok(None)
            }
        }
    }
}

pub struct PolicyFetcher {
    directory: Box<dyn DirectoryApi>,
    selector: Box<dyn ProfileSelector>,
}

impl PolicyFetcher {
    pub fn new(directory: Box<dyn DirectoryApi>, selector: Box<dyn ProfileSelector>) -> Self {
        Self { directory, selector }
    }

    /// Path of the cached enrollment config for a workspace
    pub fn config_path(workspace: &Path) -> PathBuf {
        workspace.join(ENROLLMENT_CONFIG_FILE)
    }

    /// Return the workspace's enrollment config, fetching and writing it if missing.
    ///
    /// [`Error::NoProfiles`] and [`Error::SelectionAborted`] mean no file was
    /// written and the caller should provision without an enrollment payload.
    pub fn fetch_or_create(&self, workspace: &Path) -> Result<PathBuf> {
        let path = Self::config_path(workspace);
        if path.exists() {
            tracing::info!(path = %path.display(), "Using cached enrollment config");
            return Ok(path);
        }

        std::fs::create_dir_all(workspace).map_err(|e| {
            Error::Configuration(format!(
                "cannot create workspace {}: {}",
                workspace.display(),
                e
            ))
        })?;

        self.directory.authenticate()?;

        let profiles = self.directory.list_profiles()?;
        let profile = match profiles.len() {
            0 => {
                tracing::warn!("No enrollment profiles found; VMs will not be pre-enrolled");
                return Err(Error::NoProfiles);
            }
            1 => &profiles[0],
            _ => match self.selector.choose(&profiles)? {
                Some(i) if i < profiles.len() => &profiles[i],
                _ => {
                    tracing::info!("No enrollment profile selected; VMs will not be pre-enrolled");
                    return Err(Error::SelectionAborted);
                }
            },
        };
        tracing::info!(profile = %profile.display_name, id = %profile.id, "Selected enrollment profile");

        let organization = self.directory.organization()?;
        let domain = self.directory.default_domain()?;

        let enrollment = EnrollmentProfile::from_remote(profile, organization.id, domain);
        let file = enrollment.to_config_file()?;
        write_atomic(&path, serde_json::to_string_pretty(&file)?.as_bytes())?;

        tracing::info!(path = %path.display(), oobe = file.oobe_config, "Wrote enrollment config");
        Ok(path)
    }
}
