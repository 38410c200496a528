//! Directory / device-management API (Microsoft Graph)

mod client;
mod types;

pub use client::{Credentials, GraphClient, RetryPolicy, GRAPH_BASE_URL, LOGIN_BASE_URL, REQUIRED_PERMISSIONS};
pub use types::*;

use crate::Result;

/// Read-only view of the directory used to build enrollment configs
#[cfg_attr(test, mockall::automock)]
pub trait DirectoryApi {
    /// Acquire a token; fails with [`Error::Authentication`](crate::Error::Authentication)
    fn authenticate(&self) -> Result<()>;

    /// All deployment profiles, every page concatenated in order
    fn list_profiles(&self) -> Result<Vec<RemoteProfile>>;

    fn organization(&self) -> Result<Organization>;

    /// Id of the domain flagged as default
    fn default_domain(&self) -> Result<String>;
}

/// Directory used when no credentials were supplied.
///
/// Runs that find a cached enrollment config, or skip enrollment, never call
/// it; anything else fails with an authentication error.
pub struct UnconfiguredDirectory;

impl UnconfiguredDirectory {
    fn missing() -> crate::Error {
        crate::Error::Authentication(
            "no directory credentials configured; set HV_FLEET_GRAPH_TOKEN or \
             HV_FLEET_DIRECTORY_TENANT, HV_FLEET_CLIENT_ID and HV_FLEET_CLIENT_SECRET"
                .into(),
        )
    }
}

impl DirectoryApi for UnconfiguredDirectory {
    fn authenticate(&self) -> Result<()> {
        Err(Self::missing())
    }

    fn list_profiles(&self) -> Result<Vec<RemoteProfile>> {
        Err(Self::missing())
    }

    fn organization(&self) -> Result<Organization> {
        Err(Self::missing())
    }

    fn default_domain(&self) -> Result<String> {
        Err(Self::missing())
    }
}
