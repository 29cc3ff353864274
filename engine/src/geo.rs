//! IP geolocation seam and cache
//!
//! Lookups go through a collaborator trait so the engine never depends on
//! a specific provider; the bundled implementation talks to ipinfo.io.
//! Results are cached per IP and re-served without a lookup as long as
//! the cached entry is complete.

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("no geolocation token configured")]
    NoToken,
    #[error("geolocation request failed: {0}")]
    Request(String),
}

/// Raw lookup result from the geolocation collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoLookup {
    pub country: Option<String>,
    pub org: Option<String>,
}

/// Resolved geolocation data as published on records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub isp: String,
}

impl GeoInfo {
    pub fn unknown() -> Self {
        Self {
            country: "unknown".into(),
            isp: "-".into(),
        }
    }

    /// Incomplete entries (from older cache documents) are refetched.
    pub fn is_complete(&self) -> bool {
        !self.country.is_empty() && !self.isp.is_empty()
    }
}

impl From<GeoLookup> for GeoInfo {
    fn from(lookup: GeoLookup) -> Self {
        let country = lookup
            .country
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "unknown".into());
        // The org field leads with an AS number ("AS1299 Arelion"); only
        // the carrier name is published.
        let isp = match lookup.org.as_deref() {
            Some(org) if !org.is_empty() => {
                let mut parts = org.split_whitespace();
                let _as_number = parts.next();
                let rest = parts.collect::<Vec<_>>().join(" ");
                if rest.is_empty() {
                    "-".into()
                } else {
                    rest
                }
            }
            _ => "-".into(),
        };
        Self { country, isp }
    }
}

#[async_trait]
pub trait GeoApi: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<GeoLookup, GeoError>;
}

/// Per-IP geolocation cache, persisted as its own document.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeoCache {
    entries: HashMap<String, GeoInfo>,
}

impl GeoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached entry for an IP, only if it is complete enough to serve.
    pub fn cached(&self, ip: &str) -> Option<GeoInfo> {
        let entry = self.entries.get(ip)?;
        if entry.is_complete() {
            debug!("geo cache hit for {}: {}", ip, entry.country);
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn insert(&mut self, ip: &str, info: GeoInfo) {
        self.entries.insert(ip.to_string(), info);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// ipinfo.io-backed implementation of the geolocation collaborator.
pub struct IpinfoClient {
    http: reqwest::Client,
    token: Option<String>,
    base_url: String,
}

impl IpinfoClient {
    pub fn new(token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base_url: "https://ipinfo.io".into(),
        }
    }

    #[cfg(test)]
    fn with_base_url(token: Option<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl GeoApi for IpinfoClient {
    async fn lookup(&self, ip: &str) -> Result<GeoLookup, GeoError> {
        let token = self.token.as_ref().ok_or(GeoError::NoToken)?;
        let url = format!("{}/{}", self.base_url, ip);

        let response = self
            .http
            .get(&url)
            .query(&[("token", token.as_str())])
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await
            .map_err(|e| GeoError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GeoError::Request(format!("HTTP {}", response.status())));
        }

        response
            .json::<GeoLookup>()
            .await
            .map_err(|e| GeoError::Request(e.to_string()))
    }
}
