//! Per-server history and global per-title aggregate documents
//!
//! Both documents are date-keyed by the local calendar day, so day
//! rollover needs no explicit reset step: a new date simply starts a new
//! key, and retention pruning trims the old ones. Date parameters are
//! passed in as strings to keep every update path deterministic under
//! test; only the helpers at the bottom touch the wall clock.

use crate::registry::TargetRegistry;
use chrono::{Duration as ChronoDuration, Local, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use shared::Record;
use std::collections::{BTreeMap, HashMap};

/// Daily peak history for one tracked server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Local date (`YYYY-MM-DD`) to peak concurrent players.
    pub history: BTreeMap<String, u32>,
}

/// Per-server history document, keyed by `ip:port`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerHistory {
    entries: HashMap<String, HistoryEntry>,
}

impl ServerHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one successful poll into the daily peak for `today` and prunes
    /// dates older than the cutoff. Empty servers never create or raise a
    /// peak. Returns true when the stored peak changed.
    pub fn update(&mut self, record: &Record, today: &str, cutoff: &str) -> bool {
        let key = format!("{}:{}", record.ip, record.port);
        let entry = self.entries.entry(key.clone()).or_insert_with(|| HistoryEntry {
            name: record.name.clone(),
            ip: record.ip.clone(),
            port: record.port,
            history: BTreeMap::new(),
        });

        // Track display-name changes so the document stays presentable
        if !record.name.is_empty() && record.name != "-" {
            entry.name = record.name.clone();
        }

        let mut changed = false;
        if record.current_players > 0 {
            let peak = entry.history.entry(today.to_string()).or_insert(0);
            if record.current_players > *peak {
                debug!("history: {} peak for {} now {}", key, today, record.current_players);
                *peak = record.current_players;
                changed = true;
            }
        }

        entry.history.retain(|date, _| date.as_str() >= cutoff);
        changed
    }

    pub fn get(&self, key: &str) -> Option<&HistoryEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Aggregate counters for one tracked title.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GameStats {
    pub name: String,
    pub total_servers: u32,
    pub current_players: u32,
    /// All-time peak of summed concurrent players.
    pub max_players: u32,
}

/// Global aggregate document across all tracked titles.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub games: HashMap<u32, GameStats>,
    /// Local date to per-title daily peak of summed concurrent players.
    pub history: BTreeMap<String, HashMap<u32, u32>>,
    pub last_updated: Option<String>,
    /// Players currently online across all titles; reset at cycle start
    /// and accumulated as polls complete.
    pub current_online: u32,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_online(&mut self) {
        self.current_online = 0;
    }

    pub fn add_online(&mut self, players: u32) {
        self.current_online += players;
    }

    /// Recomputes a title's aggregates by scanning the full registry.
    ///
    /// The scan is intentionally not incremental: recomputing from the
    /// registry on every update keeps the counters drift-free no matter
    /// what individual polls did. Today's and the all-time peaks only
    /// ever rise, and history dates older than the cutoff are pruned.
    pub fn update_for_app(
        &mut self,
        app_id: u32,
        game_description: &str,
        registry: &TargetRegistry,
        today: &str,
        cutoff: &str,
    ) {
        let game = self.games.entry(app_id).or_default();

        if !game_description.is_empty() && game_description != "-" {
            game.name = game_description.to_string();
        }

        let mut total_servers = 0;
        let mut current_players = 0;
        for (_, target) in registry.iter() {
            if target.app_id != app_id {
                continue;
            }
            if let Some(data) = &target.last_data {
                if !data.offline {
                    total_servers += 1;
                    current_players += data.current_players;
                }
            }
        }

        game.total_servers = total_servers;
        game.current_players = current_players;
        if current_players > game.max_players {
            debug!("stats: app {} all-time peak now {}", app_id, current_players);
            game.max_players = current_players;
        }

        let day = self.history.entry(today.to_string()).or_default();
        let peak = day.entry(app_id).or_insert(0);
        if current_players > *peak {
            *peak = current_players;
        }

        self.history.retain(|date, _| date.as_str() >= cutoff);
        self.last_updated = Some(Utc::now().to_rfc3339());
    }
}

/// Today's local calendar date as a `YYYY-MM-DD` key.
pub fn local_date_string() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Local date `days` days before today, used as a retention cutoff.
pub fn local_date_days_ago(days: i64) -> String {
    (Local::now() - ChronoDuration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}
