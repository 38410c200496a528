//! Error types for fleet provisioning

use std::time::Duration;
use thiserror::Error;

/// Step of [`DeviceProvisioner::provision`](crate::DeviceProvisioner::provision)
/// that a [`Error::Provisioning`] failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CheckName,
    CloneDisk,
    InjectEnrollment,
    CreateVm,
    SecureTpm,
    Start,
    TagMetadata,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisionStep::CheckName => write!(f, "check name"),
            ProvisionStep::CloneDisk => write!(f, "clone disk"),
            ProvisionStep::InjectEnrollment => write!(f, "inject enrollment config"),
            ProvisionStep::CreateVm => write!(f, "create VM"),
            ProvisionStep::SecureTpm => write!(f, "enable vTPM"),
            ProvisionStep::Start => write!(f, "start VM"),
            ProvisionStep::TagMetadata => write!(f, "tag VM metadata"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("No enrollment profiles found in the directory")]
    NoProfiles,

    #[error("No enrollment profile selected")]
    SelectionAborted,

    #[error("VM already exists: {0}")]
    ResourceConflict(String),

    #[error("Provisioning {vm} failed at step '{step}': {source}")]
    Provisioning {
        vm: String,
        step: ProvisionStep,
        #[source]
        source: Box<Error>,
    },

    #[error("Image build failed: {0}")]
    ImageBuild(String),

    #[error("PowerShell error: {0}")]
    PowerShell(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Directory API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a failure from one provisioning step with the VM it belongs to
    pub fn provisioning(vm: impl Into<String>, step: ProvisionStep, source: Error) -> Self {
        Error::Provisioning {
            vm: vm.into(),
            step,
            source: Box::new(source),
        }
    }

    /// Errors that mean "run without an enrollment payload" rather than abort
    pub fn skips_enrollment(&self) -> bool {
        matches!(self, Error::NoProfiles | Error::SelectionAborted)
    }

    /// Errors that abort the whole fleet run before any VM is touched
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::InvalidRequest(_) | Error::Authentication(_)
        )
    }
}
