//! Tag stabilization cache with divergence hysteresis
//!
//! Upstream rule metadata is noisy: servers transiently report wrong or
//! empty values, and republishing every observation would make labels
//! flap. The cache only swaps its published content after a run of
//! consecutive observations that all disagree with it, so label changes
//! require sustained evidence rather than a single bad sample.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::{TAG_CACHE_TTL_SECS, TAG_DIVERGENCE_THRESHOLD};
use std::collections::HashMap;

/// Cached label state for one target address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagCacheEntry {
    pub tags: Vec<String>,
    /// Epoch seconds of the last refresh (content change or confirmation).
    pub last_refresh: u64,
    /// Consecutive observations that disagreed with the cached set.
    pub divergence: u32,
}

/// Per-address tag cache. Entries are never deleted; only their freshness
/// expires, which re-triggers the rule sub-query.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagCache {
    entries: HashMap<String, TagCacheEntry>,
}

impl TagCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the rule sub-query should run for this address: either no
    /// entry exists yet or the entry's freshness TTL has expired.
    pub fn needs_refresh(&self, addr: &str, now_secs: u64) -> bool {
        match self.entries.get(addr) {
            Some(entry) => now_secs.saturating_sub(entry.last_refresh) > TAG_CACHE_TTL_SECS,
            None => true,
        }
    }

    /// Currently published labels for an address, if any.
    pub fn current(&self, addr: &str) -> Option<&[String]> {
        self.entries.get(addr).map(|entry| entry.tags.as_slice())
    }

    /// Feeds one freshly extracted candidate label set through the
    /// hysteresis policy and returns the labels to publish.
    pub fn observe(&mut self, addr: &str, candidate: Vec<String>, now_secs: u64) -> Vec<String> {
        let Some(entry) = self.entries.get_mut(addr) else {
            // First observation wins
            debug!("tag cache: first observation for {}: {:?}", addr, candidate);
            self.entries.insert(
                addr.to_string(),
                TagCacheEntry {
                    tags: candidate.clone(),
                    last_refresh: now_secs,
                    divergence: 0,
                },
            );
            return candidate;
        };

        if set_equal(&entry.tags, &candidate) {
            // Confirmation: extend freshness without changing content
            entry.divergence = 0;
            entry.last_refresh = now_secs;
            return entry.tags.clone();
        }

        entry.divergence += 1;
        if entry.divergence >= TAG_DIVERGENCE_THRESHOLD {
            info!(
                "tag cache: {} changed after {} consecutive differing observations: {:?}",
                addr, entry.divergence, candidate
            );
            entry.tags = candidate.clone();
            entry.divergence = 0;
            entry.last_refresh = now_secs;
            return candidate;
        }

        debug!(
            "tag cache: {} diverging ({}/{}), keeping {:?}",
            addr, entry.divergence, TAG_DIVERGENCE_THRESHOLD, entry.tags
        );
        entry.tags.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Order-independent set equality; tag sets are small enough that sorting
/// clones is the simplest correct comparison.
fn set_equal(a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}
