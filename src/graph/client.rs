//! Blocking Graph client with token acquisition, paging and retries

use super::types::{Domain, Organization, Page, RemoteProfile, TokenResponse};
use super::DirectoryApi;
use crate::{Error, Result};
use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com";
pub const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Application permissions the app registration needs (all read-only)
pub const REQUIRED_PERMISSIONS: [&str; 3] = [
    "DeviceManagementServiceConfig.Read.All",
    "Organization.Read.All",
    "Domain.Read.All",
];

const PROFILES_PATH: &str = "/beta/deviceManagement/windowsAutopilotDeploymentProfiles";
const ORGANIZATION_PATH: &str = "/v1.0/organization";
const DOMAINS_PATH: &str = "/v1.0/domains";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGES: usize = 1000;
const MAX_ERROR_BODY: usize = 512;

/// How to obtain a bearer token
#[derive(Clone)]
pub enum Credentials {
    /// A token acquired elsewhere (e.g. `az account get-access-token`)
    Token(String),
    /// OAuth2 client-credentials grant for an app registration
    ClientSecret {
        directory_tenant: String,
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(***)"),
            Credentials::ClientSecret { directory_tenant, client_id, .. } => f
                .debug_struct("ClientSecret")
                .field("directory_tenant", directory_tenant)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Retry settings for transient directory API failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), honouring `Retry-After`
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or_else(|| {
            let exponent = attempt.saturating_sub(1).min(10) as u32;
            self.base_delay.saturating_mul(1 << exponent)
        });
        delay.min(self.max_delay)
    }
}

pub struct GraphClient {
    http: Client,
    credentials: Credentials,
    graph_url: String,
    login_url: String,
    retry: RetryPolicy,
    token: Mutex<Option<String>>,
}

impl GraphClient {
    pub fn new(credentials: Credentials) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("hv-fleet/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            credentials,
            graph_url: GRAPH_BASE_URL.to_string(),
            login_url: LOGIN_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            token: Mutex::new(None),
        })
    }

    pub fn with_graph_url(mut self, url: impl Into<String>) -> Self {
        self.graph_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_login_url(mut self, url: impl Into<String>) -> Self {
        self.login_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn token(&self) -> Result<String> {
        let mut cached = self.token.lock();
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let token = match &self.credentials {
            Credentials::Token(token) => token.clone(),
            Credentials::ClientSecret {
                directory_tenant,
                client_id,
                client_secret,
            } => {
                let url = format!("{}/{}/oauth2/v2.0/token", self.login_url, directory_tenant);
                tracing::debug!(directory_tenant = %directory_tenant, client_id = %client_id, "Requesting Graph token");
                let resp = self
                    .send_with_retry("token request", || {
                        self.http.post(&url).form(&[
                            ("grant_type", "client_credentials"),
                            ("client_id", client_id.as_str()),
                            ("client_secret", client_secret.as_str()),
                            ("scope", GRAPH_SCOPE),
                        ])
                    })
                    .map_err(as_auth_error)?;
                resp.json::<TokenResponse>()
                    .map_err(|e| Error::Authentication(format!("malformed token response: {}", e)))?
                    .access_token
            }
        };

        if token.trim().is_empty() {
            return Err(Error::Authentication("empty bearer token".into()));
        }
        *cached = Some(token.clone());
        Ok(token)
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.token()?;
        let resp = self.send_with_retry(url, || self.http.get(url).bearer_auth(&token))?;
        Ok(resp.json()?)
    }

    /// Follow `@odata.nextLink` until absent, concatenating every page
    fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(format!("{}{}", self.graph_url, path));
        let mut pages = 0;

        while let Some(url) = next.take() {
            pages += 1;
            if pages > MAX_PAGES {
                return Err(Error::Parse(format!("{} returned more than {} pages", path, MAX_PAGES)));
            }
            let page: Page<T> = self.get_json(&url)?;
            tracing::debug!(path = %path, page = pages, items = page.value.len(), "Fetched page");
            items.extend(page.value);
            next = page.next_link;
        }

        Ok(items)
    }

    fn send_with_retry(
        &self,
        what: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match build().send() {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                        let body = truncate_for_error(&resp.text().unwrap_or_default());
                        return Err(Error::Authentication(format!("{} returned {}: {}", what, status, body)));
                    }
                    if attempt < max_attempts && is_retryable_status(status) {
                        let delay = self.retry.delay(attempt, parse_retry_after(resp.headers()));
                        tracing::warn!(request = %what, status = %status, attempt, delay_ms = delay.as_millis() as u64, "Retrying directory request");
                        std::thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Err(Error::Api {
                        status: status.as_u16(),
                        body: truncate_for_error(&resp.text().unwrap_or_default()),
                    });
                }
                Err(e) => {
                    if attempt < max_attempts && is_retryable_transport_error(&e) {
                        let delay = self.retry.delay(attempt, None);
                        tracing::warn!(request = %what, error = %e, attempt, delay_ms = delay.as_millis() as u64, "Retrying directory request");
                        std::thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Err(Error::Http(e));
                }
            }
        }
    }
}

impl DirectoryApi for GraphClient {
    fn authenticate(&self) -> Result<()> {
        self.token().map(|_| ())
    }

    fn list_profiles(&self) -> Result<Vec<RemoteProfile>> {
        self.get_all(PROFILES_PATH)
    }

    fn organization(&self) -> Result<Organization> {
        self.get_all::<Organization>(ORGANIZATION_PATH)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Parse("directory returned no organization record".into()))
    }

    fn default_domain(&self) -> Result<String> {
        self.get_all::<Domain>(DOMAINS_PATH)?
            .into_iter()
            .find(|d| d.is_default)
            .map(|d| d.id)
            .ok_or_else(|| Error::Parse("directory has no default domain".into()))
    }
}

fn as_auth_error(e: Error) -> Error {
    match e {
        Error::Authentication(_) => e,
        other => Error::Authentication(other.to_string()),
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_for_error(text: &str) -> String {
    if text.chars().count() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_ERROR_BODY).collect();
    out.push_str("...");
    out
}
