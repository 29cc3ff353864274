//! Target registry and per-target health lifecycle for the polling engine
//!
//! This module owns the canonical set of tracked game-server endpoints,
//! including:
//! - Target lifecycle (discovery, success, degradation, offline, eviction)
//! - Consecutive-failure accounting and the offline threshold
//! - Staleness sweeps that drop dead or no-longer-configured targets
//! - Persistence round-trips for the target list document
//!
//! The registry is the single source of truth for which addresses a poll
//! cycle queries; it is mutated only by the scheduler's aggregator and by
//! discovery merges.

use log::info;
use serde::{Deserialize, Serialize};
use shared::{Record, TargetAddr, OFFLINE_FAILURE_THRESHOLD, STALE_TARGET_MS};
use std::collections::HashMap;

/// Derived health state of a tracked target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetState {
    /// Discovered but never successfully polled.
    Discovered,
    /// Last poll succeeded.
    Online,
    /// 1–2 consecutive failures; the prior record is still served.
    Degraded(u32),
    /// At or past the failure threshold with a prior record retained.
    Offline,
}

/// Outcome of recording a failed poll against a target.
#[derive(Debug, Clone, PartialEq)]
pub enum PollFailure {
    /// Below the offline threshold; nothing is published.
    Degraded(u32),
    /// Threshold crossed (or still exceeded) with a prior record: the
    /// offline copy of that record should be published.
    WentOffline(Record),
    /// Threshold crossed with no prior record: the target was removed.
    Evicted,
}

/// One tracked game-server endpoint.
///
/// The owning title (`app_id`) never changes once discovered; a title
/// reassignment upstream shows up as eviction followed by rediscovery.
#[derive(Debug, Clone)]
pub struct Target {
    pub app_id: u32,
    /// Epoch milliseconds of the last successful poll.
    pub last_successful: u64,
    pub failure_count: u32,
    pub last_data: Option<Record>,
}

impl Target {
    fn new(app_id: u32, discovered_at: u64) -> Self {
        Self {
            app_id,
            last_successful: discovered_at,
            failure_count: 0,
            last_data: None,
        }
    }

    pub fn state(&self) -> TargetState {
        match (self.failure_count, &self.last_data) {
            (0, None) => TargetState::Discovered,
            (0, Some(_)) => TargetState::Online,
            (n, _) if n < OFFLINE_FAILURE_THRESHOLD => TargetState::Degraded(n),
            _ => TargetState::Offline,
        }
    }
}

/// Persisted form of a target; failure counters and cached records
/// deliberately reset across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTarget {
    pub ip: String,
    pub port: u16,
    pub app_id: u32,
    pub last_successful: u64,
}

/// Registry of all tracked targets, keyed by globally-unique address.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: HashMap<TargetAddr, Target>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the registry from its persisted document.
    pub fn from_persisted(persisted: Vec<PersistedTarget>) -> Self {
        let targets = persisted
            .into_iter()
            .map(|p| {
                let addr = TargetAddr::new(p.ip, p.port);
                let target = Target {
                    app_id: p.app_id,
                    last_successful: p.last_successful,
                    failure_count: 0,
                    last_data: None,
                };
                (addr, target)
            })
            .collect();
        Self { targets }
    }

    pub fn to_persisted(&self) -> Vec<PersistedTarget> {
        self.targets
            .iter()
            .map(|(addr, target)| PersistedTarget {
                ip: addr.ip.clone(),
                port: addr.port,
                app_id: target.app_id,
                last_successful: target.last_successful,
            })
            .collect()
    }

    /// Inserts a newly discovered address.
    ///
    /// Already-tracked addresses are left untouched: discovery must never
    /// reset the health state or failure counters of an existing target.
    /// Returns true if the address was new.
    pub fn insert_discovered(&mut self, addr: TargetAddr, app_id: u32, now_ms: u64) -> bool {
        if self.targets.contains_key(&addr) {
            return false;
        }
        info!("tracking new server {} (app {})", addr, app_id);
        self.targets.insert(addr, Target::new(app_id, now_ms));
        true
    }

    /// Records a successful poll: the failure counter resets, the fresh
    /// record becomes the target's last known data, and the last-success
    /// timestamp is refreshed.
    pub fn record_success(&mut self, addr: &TargetAddr, record: Record, now_ms: u64) {
        if let Some(target) = self.targets.get_mut(addr) {
            target.failure_count = 0;
            target.last_successful = now_ms;
            target.last_data = Some(record);
        }
    }

    /// Records a failed poll and applies the offline/eviction policy.
    ///
    /// Returns `None` for unknown addresses. Crossing (or sitting past) the
    /// failure threshold republishes the prior record as offline; a target
    /// that never produced a record is evicted silently instead.
    pub fn record_failure(&mut self, addr: &TargetAddr) -> Option<PollFailure> {
        let target = self.targets.get_mut(addr)?;
        target.failure_count += 1;

        if target.failure_count < OFFLINE_FAILURE_THRESHOLD {
            return Some(PollFailure::Degraded(target.failure_count));
        }

        match &target.last_data {
            Some(prior) => {
                let offline = prior.to_offline();
                target.last_data = Some(offline.clone());
                Some(PollFailure::WentOffline(offline))
            }
            None => {
                info!("evicting {} after {} failures with no prior data", addr, target.failure_count);
                self.targets.remove(addr);
                Some(PollFailure::Evicted)
            }
        }
    }

    /// Evicts targets whose title left the configured set or whose last
    /// successful poll is older than the staleness window, regardless of
    /// their current state. Returns the evicted addresses.
    pub fn sweep(&mut self, active_app_ids: &[u32], now_ms: u64) -> Vec<TargetAddr> {
        let stale: Vec<TargetAddr> = self
            .targets
            .iter()
            .filter(|(_, target)| {
                !active_app_ids.contains(&target.app_id)
                    || now_ms.saturating_sub(target.last_successful) > STALE_TARGET_MS
            })
            .map(|(addr, _)| addr.clone())
            .collect();

        for addr in &stale {
            if let Some(target) = self.targets.remove(addr) {
                if active_app_ids.contains(&target.app_id) {
                    info!("evicting {}: no successful poll for over a day", addr);
                } else {
                    info!("evicting {}: app {} no longer tracked", addr, target.app_id);
                }
            }
        }

        stale
    }

    pub fn get(&self, addr: &TargetAddr) -> Option<&Target> {
        self.targets.get(addr)
    }

    pub fn contains(&self, addr: &TargetAddr) -> bool {
        self.targets.contains_key(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TargetAddr, &Target)> {
        self.targets.iter()
    }

    /// Snapshot of all tracked addresses with their owning title, used to
    /// build one poll job per target at cycle start.
    pub fn poll_targets(&self) -> Vec<(TargetAddr, u32)> {
        self.targets
            .iter()
            .map(|(addr, target)| (addr.clone(), target.app_id))
            .collect()
    }

    /// Last known records for replay to newly connected subscribers.
    pub fn last_records(&self) -> Vec<Record> {
        self.targets
            .values()
            .filter_map(|target| target.last_data.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
