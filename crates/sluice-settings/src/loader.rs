//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SluiceSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `SLUICE_*` environment overrides (highest priority)
//!
//! Objects merge per key, arrays and primitives are replaced, and nulls in
//! the file leave the default in place.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{sluice_home, BucketScope, ReleaseMode, SluiceSettings};

/// Default settings file: `~/.sluice/settings.json`.
pub fn settings_path() -> PathBuf {
    sluice_home().join("settings.json")
}

/// Load from `path` (or the default location) and apply env overrides.
pub fn load_settings(path: Option<&Path>) -> Result<SluiceSettings> {
    match path {
        Some(p) => load_settings_from_path(p),
        None => load_settings_from_path(&settings_path()),
    }
}

/// Load settings from a specific file with env overrides. A missing file
/// yields defaults; malformed JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SluiceSettings> {
    let defaults = serde_json::to_value(SluiceSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: SluiceSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive merge of `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides. Unparseable values are logged and ignored.
pub fn apply_env_overrides(settings: &mut SluiceSettings) {
    // queue
    if let Some(v) = read_env_string("SLUICE_QUEUE_DB") {
        settings.queue.db_path = v;
    }
    if let Some(v) = read_env_u64("SLUICE_ACCEPT_TIMEOUT_MS", 1, 3_600_000) {
        settings.queue.accept_timeout_ms = v;
    }

    // consumer
    if let Some(v) = read_env_u64("SLUICE_MAX_BATCH_SIZE", 1, 10_000) {
        settings.consumer.max_batch_size = v as usize;
    }
    if let Some(v) = read_env_u64("SLUICE_BACKOFF_MS", 0, 600_000) {
        settings.consumer.backoff_ms = v;
    }
    if let Some(v) = read_env_f64("SLUICE_TARGET_RATE") {
        settings.consumer.target_rate_per_sec = v;
    }
    if let Some(v) = read_env_bool("SLUICE_RELEASE_LOCK_AFTER_BATCH") {
        settings.consumer.release_lock_after_batch = v;
    }

    // lock
    if let Some(v) = read_env_string("SLUICE_LOCK_DB") {
        settings.lock.db_path = v;
    }
    if let Some(v) = read_env_string("SLUICE_PARTITIONS") {
        settings.lock.partitions = parse_list(&v);
    }
    if let Some(v) = read_env_u64("SLUICE_LOCK_TTL_SECS", 1, 86_400) {
        settings.lock.ttl_secs = v;
    }
    if let Some(v) = read_env_string("SLUICE_RELEASE_MODE") {
        match v.to_lowercase().as_str() {
            "owned" => settings.lock.release_mode = ReleaseMode::Owned,
            "unchecked" => settings.lock.release_mode = ReleaseMode::Unchecked,
            _ => tracing::warn!(key = "SLUICE_RELEASE_MODE", value = %v, "unknown release mode, ignoring"),
        }
    }

    // gate
    if let Some(v) = read_env_string("SLUICE_GATE_URL") {
        settings.gate.base_url = v;
    }

    // admission
    if let Some(v) = read_env_u16("SLUICE_PORT", 1, 65535) {
        settings.admission.port = v;
    }
    if let Some(v) = read_env_u64("SLUICE_BUCKET_CAPACITY", 1, 1_000_000_000) {
        settings.admission.capacity = v;
    }
    if let Some(v) = read_env_u64("SLUICE_REFILL_TOKENS", 1, 1_000_000_000) {
        settings.admission.refill_tokens = v;
    }
    if let Some(v) = read_env_u64("SLUICE_REFILL_PERIOD_SECS", 1, 86_400) {
        settings.admission.refill_period_secs = v;
    }
    if let Some(v) = read_env_string("SLUICE_BUCKET_SCOPE") {
        match v.to_lowercase().as_str() {
            "local" => settings.admission.scope = BucketScope::Local,
            "shared" => settings.admission.scope = BucketScope::Shared,
            _ => tracing::warn!(key = "SLUICE_BUCKET_SCOPE", value = %v, "unknown bucket scope, ignoring"),
        }
    }
    if let Some(v) = read_env_string("SLUICE_BUCKET_DB") {
        settings.admission.shared_db_path = v;
    }

    // telemetry
    if let Some(v) = read_env_string("SLUICE_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
    if let Some(v) = read_env_bool("SLUICE_LOG_JSON") {
        settings.telemetry.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Comma-separated list with blanks dropped.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Env var readers ─────────────────────────────────────────────────────────

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

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, u64::from(min), u64::from(max)).map(|n| n as u16);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
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

fn read_env_f64(name: &str) -> Option<f64> {
    let val = std::env::var(name).ok()?;
    let result = val.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid positive number env var, ignoring");
    }
    result
}
