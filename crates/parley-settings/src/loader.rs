//! Settings resolution: deep merge, settings files, and environment overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::SessionSettings;

/// Load settings from a JSON file merged over defaults, then apply env overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SessionSettings> {
    let overrides = if path.exists() {
        debug!(?path, "loading session settings from file");
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        debug!(?path, "settings file not found, using defaults");
        Value::Object(serde_json::Map::new())
    };

    let mut settings = SessionSettings::with_overrides(overrides)?;
    apply_env_overrides(&mut settings);
    settings.finalize()
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (target, Value::Null) => target,
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` environment variable overrides.
///
/// Invalid values are ignored with a warning.
pub fn apply_env_overrides(settings: &mut SessionSettings) {
    if let Some(v) = read_env_string("PARLEY_MODEL") {
        settings.exchange.model = v;
    }
    if let Some(v) = read_env_string("PARLEY_EXCHANGE_URL") {
        settings.exchange.base_url = v;
    }
    if let Some(v) = read_env_string("PARLEY_CHANNEL_LABEL") {
        settings.transport.channel_label = v;
    }
    if let Some(v) = read_env_u64("PARLEY_ICE_TIMEOUT_MS", 100, 60_000) {
        settings.transport.ice_gathering_timeout_ms = v;
    }
    if let Some(v) = read_env_bool("PARLEY_AUTO_CONFIGURE") {
        settings.auto_configure = v;
    }
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
