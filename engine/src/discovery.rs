//! Tiered target acquisition: authenticated directory API with anonymous
//! fallback
//!
//! For each tracked title the primary tier is a key-authenticated HTTP
//! directory lookup, retried with linear backoff on server-side and
//! rate-limit errors. Authorization failures are never retried — a
//! permissions problem does not fix itself between attempts. When the
//! primary tier is unavailable or exhausted, an anonymous UDP directory
//! query serves as a degraded fallback; if that fails too the title simply
//! contributes nothing this round.

use crate::config::EngineConfig;
use crate::registry::TargetRegistry;
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use shared::TargetAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(10);

/// One address acquired from a directory tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub addr: TargetAddr,
    pub app_id: u32,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory API returned HTTP {status}")]
    Http { status: u16 },
    #[error("directory request failed: {0}")]
    Network(String),
}

impl DirectoryError {
    /// Server-side and rate-limit errors are worth another attempt.
    pub fn retryable(&self) -> bool {
        match self {
            DirectoryError::Http { status } => *status == 429 || *status >= 500,
            DirectoryError::Network(_) => true,
        }
    }

    /// Authorization failures abort the tier outright.
    pub fn fatal_for_tier(&self) -> bool {
        matches!(self, DirectoryError::Http { status: 401 | 403 })
    }
}

#[derive(Debug, Error)]
#[error("master query failed: {0}")]
pub struct MasterError(pub String);

/// Authenticated directory HTTP API (primary tier).
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn list_servers(
        &self,
        app_id: u32,
        filter: &str,
        limit: u32,
    ) -> Result<Vec<DiscoveredServer>, DirectoryError>;
}

/// Anonymous UDP directory protocol (fallback tier).
#[async_trait]
pub trait MasterQuery: Send + Sync {
    async fn list_servers(
        &self,
        region: u8,
        filter: &str,
    ) -> Result<Vec<DiscoveredServer>, MasterError>;
}

/// Tiered acquisition of server addresses for tracked titles.
pub struct Discovery {
    api: Option<Arc<dyn DirectoryApi>>,
    master: Option<Arc<dyn MasterQuery>>,
    attempts: u32,
    backoff_base: Duration,
    limit: u32,
    region: u8,
}

impl Discovery {
    pub fn new(
        api: Option<Arc<dyn DirectoryApi>>,
        master: Option<Arc<dyn MasterQuery>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            api,
            master,
            attempts: config.directory_attempts,
            backoff_base: config.backoff_base,
            limit: config.directory_limit,
            region: config.region,
        }
    }

    /// Acquires the current address list for one title through the tiers.
    /// Never fails: an exhausted or unconfigured pipeline yields an empty
    /// contribution for this round.
    pub async fn acquire(&self, app_id: u32) -> Vec<DiscoveredServer> {
        let filter = format!("\\appid\\{}", app_id);

        if let Some(api) = &self.api {
            let mut attempt = 0;
            while attempt < self.attempts {
                attempt += 1;
                match api.list_servers(app_id, &filter, self.limit).await {
                    Ok(servers) => {
                        info!("directory API returned {} servers for app {}", servers.len(), app_id);
                        return servers;
                    }
                    Err(e) if e.fatal_for_tier() => {
                        warn!("directory API rejected app {} ({}), not retrying", app_id, e);
                        break;
                    }
                    Err(e) if e.retryable() && attempt < self.attempts => {
                        warn!(
                            "directory API attempt {}/{} for app {} failed: {}",
                            attempt, self.attempts, app_id, e
                        );
                        tokio::time::sleep(self.backoff_base * attempt).await;
                    }
                    Err(e) => {
                        warn!("directory API gave up on app {}: {}", app_id, e);
                        break;
                    }
                }
            }
            info!("falling back to anonymous directory query for app {}", app_id);
        } else {
            info!("no directory API key configured, using anonymous query for app {}", app_id);
        }

        let Some(master) = &self.master else {
            warn!("no anonymous directory client configured, app {} contributes nothing", app_id);
            return Vec::new();
        };

        match master.list_servers(self.region, &filter).await {
            Ok(servers) => {
                info!("anonymous directory returned {} servers for app {}", servers.len(), app_id);
                servers
            }
            Err(e) => {
                warn!("anonymous directory query for app {} failed: {}", app_id, e);
                Vec::new()
            }
        }
    }
}

/// Merges acquired addresses into the registry, inserting unknown ones as
/// newly discovered targets. Returns the number of insertions.
pub async fn merge_into_registry(
    registry: &RwLock<TargetRegistry>,
    found: Vec<DiscoveredServer>,
    now_ms: u64,
) -> usize {
    let mut registry = registry.write().await;
    let mut added = 0;
    for server in found {
        if registry.insert_discovered(server.addr, server.app_id, now_ms) {
            added += 1;
        }
    }
    added
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    response: DirectoryBody,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryBody {
    #[serde(default)]
    servers: Vec<DirectoryEntry>,
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    addr: Option<String>,
    gameport: Option<u16>,
}

/// reqwest-backed implementation of the primary directory tier.
pub struct HttpDirectory {
    http: reqwest::Client,
    key: String,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            key: key.into(),
            base_url: "https://api.steampowered.com/IGameServersService/GetServerList/v1/".into(),
        }
    }

    pub fn with_base_url(key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            key: key.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectory {
    async fn list_servers(
        &self,
        app_id: u32,
        filter: &str,
        limit: u32,
    ) -> Result<Vec<DiscoveredServer>, DirectoryError> {
        let limit_param = limit.to_string();
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("key", self.key.as_str()),
                ("filter", filter),
                ("limit", limit_param.as_str()),
            ])
            .timeout(DIRECTORY_TIMEOUT)
            .send()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Http { status: status.as_u16() });
        }

        let body: DirectoryResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::Network(e.to_string()))?;

        let servers = body
            .response
            .servers
            .into_iter()
            .filter_map(|entry| {
                let addr_str = entry.addr?;
                // Entries either carry "ip:port" directly or a bare ip with
                // the game port alongside
                match addr_str.parse::<TargetAddr>() {
                    Ok(addr) => Some(addr),
                    Err(_) => {
                        let port = entry.gameport?;
                        if addr_str.is_empty() {
                            None
                        } else {
                            Some(TargetAddr::new(addr_str, port))
                        }
                    }
                }
            })
            .map(|addr| DiscoveredServer { addr, app_id })
            .collect();

        Ok(servers)
    }
}
