//! Atomic JSON document store backing all persisted engine state

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;

pub const SERVER_LIST_DOC: &str = "server_list.json";
pub const SERVER_HISTORY_DOC: &str = "server_history.json";
pub const GLOBAL_STATS_DOC: &str = "global_stats.json";
pub const GEO_CACHE_DOC: &str = "geo_cache.json";
pub const TAG_CACHE_DOC: &str = "tag_cache.json";
pub const TOKENS_DOC: &str = "tokens.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Whole-document JSON storage rooted at a data directory.
///
/// Documents are written to a `.tmp` sibling and renamed into place so a
/// crash mid-write never leaves a truncated document behind.
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Loads a named document. A missing or empty document is a normal
    /// first-run condition and yields `Ok(None)`.
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let path = self.dir.join(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("document {} not present yet", name);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            debug!("document {} is empty, treating as absent", name);
            return Ok(None);
        }

        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Saves a named document with atomic replace semantics.
    pub async fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_vec_pretty(value)?;
        let tmp = self.dir.join(format!("{}.tmp", name));
        let path = self.dir.join(name);

        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("saved document {} ({} bytes)", name, json.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_load_missing_document_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let loaded: Option<HashMap<String, u32>> = store.load("nothing.json").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        let mut doc = HashMap::new();
        doc.insert("a".to_string(), 1u32);
        doc.insert("b".to_string(), 2u32);

        tokio_test::assert_ok!(store.save("doc.json", &doc).await);

        let loaded: Option<HashMap<String, u32>> = store.load("doc.json").await.unwrap();
        assert_eq!(loaded, Some(doc));
    }

    #[tokio::test]
    async fn test_save_replaces_existing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path());

        store.save("doc.json", &vec![1u32, 2, 3]).await.unwrap();
        store.save("doc.json", &vec![9u32]).await.unwrap();

        let loaded: Option<Vec<u32>> = store.load("doc.json").await.unwrap();
        assert_eq!(loaded, Some(vec![9]));

        // No temp file left behind after the rename
        assert!(!dir.path().join("doc.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_empty_document_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("doc.json"), b"  \n").await.unwrap();

        let store = JsonStore::new(dir.path());
        let loaded: Option<Vec<u32>> = store.load("doc.json").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("doc.json"), b"{not json").await.unwrap();

        let store = JsonStore::new(dir.path());
        let result: Result<Option<Vec<u32>>, _> = store.load("doc.json").await;
        assert!(matches!(result, Err(StorageError::Serde(_))));
    }
}
