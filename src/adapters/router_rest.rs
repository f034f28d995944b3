use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const HTTP_TIMEOUT_SECONDS: u64 = 3;
const ARP_PATH: &str = "/rest/ip/arp";

/// Source of the set of console addresses the router currently sees.
pub trait RouterClient: Send + Sync + 'static {
    fn reachable_hosts(&self) -> Result<HashSet<String>, RouterClientError>;
}

#[derive(Debug, Error)]
pub enum RouterClientError {
    #[error("failed to build router http client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("router request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("router answered with status {0}")]
    Status(u16),
    #[error("failed to parse router response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterCredentials {
    pub user: String,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArpEntry {
    address: Option<String>,
    status: Option<String>,
    #[serde(default)]
    disabled: Option<String>,
}

impl ArpEntry {
    fn is_reachable(&self) -> bool {
        if self.disabled.as_deref() == Some("true") {
            return false;
        }
        !matches!(
            self.status.as_deref(),
            Some("failed") | Some("incomplete")
        )
    }
}

/// Extracts the reachable addresses from an ARP table listing.
pub fn parse_arp_table(body: &str) -> Result<HashSet<String>, RouterClientError> {
    let entries: Vec<ArpEntry> = serde_json::from_str(body)?;
    Ok(entries
        .into_iter()
        .filter(ArpEntry::is_reachable)
        .filter_map(|entry| entry.address)
        .map(|address| address.trim().to_string())
        .filter(|address| !address.is_empty())
        .collect())
}

pub struct RouterRestClient {
    http: reqwest::blocking::Client,
    arp_url: String,
    credentials: Option<RouterCredentials>,
}

impl RouterRestClient {
    pub fn new(
        base_url: &str,
        credentials: Option<RouterCredentials>,
    ) -> Result<Self, RouterClientError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(RouterClientError::Build)?;

        Ok(Self {
            http,
            arp_url: format!("{}{ARP_PATH}", base_url.trim_end_matches('/')),
            credentials,
        })
    }
}

impl RouterClient for RouterRestClient {
    fn reachable_hosts(&self) -> Result<HashSet<String>, RouterClientError> {
        let mut request = self.http.get(&self.arp_url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.user, credentials.password.as_ref());
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(RouterClientError::Status(response.status().as_u16()));
        }
        parse_arp_table(&response.text()?)
    }
}
