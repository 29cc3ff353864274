//! Rule payload normalization and tag extraction
//!
//! Rule sub-query payloads arrive in whatever shape the remote server
//! produces: association lists, flat maps, binary blobs, nested objects.
//! [`normalize`] collapses all of them into one canonical string map, and
//! [`extract_tags`] derives the small published label set from a fixed
//! allow-list of known keys.

use shared::{RawRules, RuleValue, MAX_TAGS};
use std::collections::BTreeMap;

/// Interpretation of one allow-listed rule key.
enum TagRule {
    /// Non-empty string values are published verbatim.
    PassThrough,
    /// Enumerated game mode integer mapped to a fixed vocabulary; 0 means
    /// no label.
    GameMode,
    /// Boolean key publishing the given label when true.
    Flag(&'static str),
    /// The PvE flag is informative in both directions: presence publishes
    /// either "PvE" or "PvP".
    PveMode,
    /// Upstream reports this inverted: true means the server runs without
    /// cheat protection.
    InvertedAntiCheat,
}

/// Allow-listed rule keys in publication order. The legacy ready flag is
/// retained as table configuration even though current servers no longer
/// send it.
const TAG_KEYS: &[(&str, TagRule)] = &[
    ("ServerVersion_s", TagRule::PassThrough),
    ("Location_s", TagRule::PassThrough),
    ("GameMode_i", TagRule::GameMode),
    ("PVE_b", TagRule::PveMode),
    ("AntiCheat_b", TagRule::InvertedAntiCheat),
    ("Modded_b", TagRule::Flag("Modded")),
    ("Whitelist_b", TagRule::Flag("Whitelist")),
    ("RDY_b", TagRule::Flag("Ready")),
];

const NO_ANTI_CHEAT_TAG: &str = "NoAntiCheat";

/// Collapses a heterogeneous rule payload into a canonical string map.
///
/// Association lists and flat maps converge to the same representation;
/// duplicate keys in a list resolve to the last occurrence.
pub fn normalize(raw: &RawRules) -> BTreeMap<String, String> {
    let mut normalized = BTreeMap::new();
    match raw {
        RawRules::List(pairs) => {
            for (key, value) in pairs {
                normalized.insert(key.clone(), value_to_text(value));
            }
        }
        RawRules::Map(map) => {
            for (key, value) in map {
                normalized.insert(key.clone(), value_to_text(value));
            }
        }
    }
    normalized
}

fn value_to_text(value: &RuleValue) -> String {
    match value {
        RuleValue::Text(s) => s.clone(),
        RuleValue::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        RuleValue::Int(n) => n.to_string(),
        RuleValue::Float(f) => f.to_string(),
        RuleValue::Bool(b) => b.to_string(),
        RuleValue::Nested(map) => {
            // Nested objects usually wrap the interesting part in a
            // value-like field; fall back to a compact encoding otherwise.
            for key in ["value", "Value", "text"] {
                if let Some(inner) = map.get(key) {
                    return value_to_text(inner);
                }
            }
            serde_json::to_string(&map).unwrap_or_default()
        }
    }
}

fn parse_bool(text: &str) -> bool {
    text == "1" || text.eq_ignore_ascii_case("true")
}

fn game_mode_label(text: &str) -> Option<&'static str> {
    match text.parse::<i64>().ok()? {
        1 => Some("PvE"),
        2 => Some("PvP"),
        3 => Some("PvP-PvE"),
        4 => Some("RP"),
        5 => Some("PvE-RP"),
        6 => Some("PvP-RP"),
        // 0 and anything unknown: suppress rather than guess
        _ => None,
    }
}

/// Derives the published label set from a normalized rule map.
///
/// Labels are de-duplicated preserving first-seen order and capped at
/// [`MAX_TAGS`].
pub fn extract_tags(rules: &BTreeMap<String, String>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let push = |tags: &mut Vec<String>, label: String| {
        if !label.is_empty() && !tags.contains(&label) {
            tags.push(label);
        }
    };

    for (key, rule) in TAG_KEYS {
        let Some(value) = rules.get(*key) else {
            continue;
        };

        match rule {
            TagRule::PassThrough => {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    push(&mut tags, trimmed.to_string());
                }
            }
            TagRule::GameMode => {
                if let Some(label) = game_mode_label(value) {
                    push(&mut tags, label.to_string());
                }
            }
            TagRule::Flag(label) => {
                if parse_bool(value) {
                    push(&mut tags, (*label).to_string());
                }
            }
            TagRule::PveMode => {
                let label = if parse_bool(value) { "PvE" } else { "PvP" };
                push(&mut tags, label.to_string());
            }
            TagRule::InvertedAntiCheat => {
                if parse_bool(value) {
                    push(&mut tags, NO_ANTI_CHEAT_TAG.to_string());
                }
            }
        }
    }

    tags.truncate(MAX_TAGS);
    tags
}
