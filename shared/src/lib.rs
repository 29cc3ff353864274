use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Consecutive poll failures before a target is considered offline.
pub const OFFLINE_FAILURE_THRESHOLD: u32 = 3;
/// Targets with no successful poll for this long are evicted by the sweep.
pub const STALE_TARGET_MS: u64 = 86_400_000;
/// Tag cache entries fresher than this skip the rule sub-query entirely.
pub const TAG_CACHE_TTL_SECS: u64 = 300;
/// Consecutive differing tag observations required before the cache swaps.
pub const TAG_DIVERGENCE_THRESHOLD: u32 = 5;
/// Hard cap on published tags per server.
pub const MAX_TAGS: usize = 12;
/// Per-server daily peak history is kept for this many days.
pub const HISTORY_RETENTION_DAYS: i64 = 30;
/// Global per-title daily peak history is kept for this many days.
pub const STATS_RETENTION_DAYS: i64 = 365;
/// Concurrent metadata probes per target; the minimum latency wins.
pub const LATENCY_PROBES: usize = 5;
/// Latency sentinel published on offline records.
pub const OFFLINE_LATENCY: i64 = -1;

/// A tracked game-server endpoint, unique across all titles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TargetAddr {
    pub ip: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<TargetAddr> for String {
    fn from(addr: TargetAddr) -> String {
        addr.to_string()
    }
}

impl FromStr for TargetAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in address {:?}", s))?;
        if ip.is_empty() {
            return Err(format!("missing host in address {:?}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in address {:?}", s))?;
        Ok(TargetAddr::new(ip, port))
    }
}

impl TryFrom<String> for TargetAddr {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Raw metadata returned by the info sub-query of the server query protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub map: String,
    pub game: String,
    pub version: String,
    /// Environment byte from the wire: 'l' Linux, 'w' Windows, 'm' macOS.
    pub environment: char,
    pub players: u32,
    pub max_players: i32,
}

impl Metadata {
    pub fn os_label(&self) -> &'static str {
        match self.environment {
            'l' => "Linux",
            'w' => "Windows",
            'm' => "macOS",
            _ => "-",
        }
    }

    /// Max player counts arrive as a signed byte on some titles; negative
    /// values wrap back into the 0..=255 range.
    pub fn normalized_max_players(&self) -> u32 {
        if self.max_players < 0 {
            (self.max_players + 256) as u32
        } else {
            self.max_players as u32
        }
    }
}

/// One roster entry, pre-formatted for subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub name: String,
    pub score: String,
    pub duration: String,
}

impl PlayerEntry {
    pub fn from_raw(name: &str, score: i64, duration_secs: f64) -> Self {
        Self {
            name: if name.is_empty() { "-".into() } else { name.into() },
            score: format_score(score),
            duration: format_duration(duration_secs as u64),
        }
    }
}

/// Immutable snapshot of a target's polled status, as published to
/// subscribers and retained as the target's last known record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub ip: String,
    pub port: u16,
    pub app_id: u32,
    pub game_description: String,
    pub name: String,
    pub map: String,
    pub version: String,
    pub current_players: u32,
    pub max_players: u32,
    pub os: String,
    pub players: Vec<PlayerEntry>,
    pub latency: i64,
    pub country: String,
    pub isp: String,
    pub offline: bool,
    pub tags: Vec<String>,
}

impl Record {
    /// Offline copy of this record: live fields zeroed, descriptive fields
    /// (name, geo, tags) retained so subscribers can still render the entry.
    pub fn to_offline(&self) -> Record {
        Record {
            current_players: 0,
            players: Vec::new(),
            latency: OFFLINE_LATENCY,
            offline: true,
            ..self.clone()
        }
    }
}

/// One value from a rule payload. Upstream servers disagree about shapes, so
/// everything the wire can produce is representable here and normalized later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
    Nested(HashMap<String, RuleValue>),
}

/// Rule payload as returned by the rules sub-query: either an association
/// list (duplicate keys possible, last wins) or a flat map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawRules {
    List(Vec<(String, RuleValue)>),
    Map(HashMap<String, RuleValue>),
}

pub fn format_duration(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    format!("{}h{}m{}s", h, m, s)
}

pub fn format_score(score: i64) -> String {
    if score >= 0 {
        format!("+{}", score)
    } else {
        format!("{}", score)
    }
}

/// Current wall clock as milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Current wall clock as seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}
