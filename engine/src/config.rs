//! Engine configuration and credentials loading

use crate::storage::{JsonStore, TOKENS_DOC};
use log::warn;
use serde::{Deserialize, Serialize};
use shared::LATENCY_PROBES;
use std::time::Duration;

/// Tunable knobs of the polling engine. Defaults match the production
/// deployment; tests override what they need.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum queries in flight during a poll cycle.
    pub concurrency: usize,
    /// Timeout applied to each individual sub-query.
    pub info_timeout: Duration,
    /// Concurrent metadata probes per target; minimum latency wins.
    pub latency_probes: usize,
    pub poll_interval: Duration,
    pub discovery_interval: Duration,
    pub sweep_interval: Duration,
    /// Titles to track; targets of other titles are swept out.
    pub app_ids: Vec<u32>,
    /// Attempt ceiling for the primary directory tier.
    pub directory_attempts: u32,
    /// Linear backoff base between directory retries.
    pub backoff_base: Duration,
    /// Result cap requested from the directory API.
    pub directory_limit: u32,
    /// Region code passed to the anonymous directory fallback.
    pub region: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            info_timeout: Duration::from_secs(2),
            latency_probes: LATENCY_PROBES,
            poll_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(3600),
            app_ids: Vec::new(),
            directory_attempts: 4,
            backoff_base: Duration::from_secs(1),
            directory_limit: 50_000,
            region: 0xFF,
        }
    }
}

/// API credentials, loaded from the tokens document. Either may be absent:
/// discovery then degrades to the anonymous tier and geolocation resolves
/// everything as unknown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub directory_api_key: Option<String>,
    #[serde(default)]
    pub geo_token: Option<String>,
}

impl Credentials {
    /// Loads credentials from storage. A missing or unreadable document is
    /// a degraded configuration, not a fatal error.
    pub async fn load(store: &JsonStore) -> Credentials {
        match store.load::<Credentials>(TOKENS_DOC).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                warn!("no tokens document found, running without credentials");
                Credentials::default()
            }
            Err(e) => {
                warn!("failed to read tokens document ({}), running without credentials", e);
                Credentials::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment_values() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.info_timeout, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.directory_attempts, 4);
        assert_eq!(config.directory_limit, 50_000);
    }

    #[tokio::test]
    async fn test_missing_tokens_document_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let credentials = Credentials::load(&store).await;
        assert!(credentials.directory_api_key.is_none());
        assert!(credentials.geo_token.is_none());
    }

    #[tokio::test]
    async fn test_partial_tokens_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());
        store
            .save(TOKENS_DOC, &serde_json::json!({ "geo_token": "abc" }))
            .await
            .unwrap();

        let credentials = Credentials::load(&store).await;
        assert_eq!(credentials.geo_token.as_deref(), Some("abc"));
        assert!(credentials.directory_api_key.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_tokens_document_degrades() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join(TOKENS_DOC), b"{oops").await.unwrap();

        let store = JsonStore::new(dir.path());
        let credentials = Credentials::load(&store).await;
        assert!(credentials.directory_api_key.is_none());
    }
}
