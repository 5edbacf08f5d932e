#![forbid(unsafe_code)]

//! Runtime settings for the channel monitor.
//!
//! Values are layered: explicit overrides win over process environment
//! variables, which win over the `.env` file. Blank values count as unset and
//! malformed numbers fall back to their defaults.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SCAN_INTERVAL_MINUTES: u64 = 30;
pub const DEFAULT_IDLE_SCAN_CAP: usize = 20;
pub const DEFAULT_DISPLAY_CAP: usize = 50;
pub const DEFAULT_LISTING_TOOL: &str = "yt-dlp";
pub const DEFAULT_FEED_TIMEOUT_SECONDS: u64 = 15;

const STORE_FILE: &str = "channels.json";
const BANNERS_SUBDIR: &str = "banners";
const ARCHIVE_FILE: &str = "download-archive.txt";

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub root: PathBuf,
    pub store_path: PathBuf,
    pub banner_dir: PathBuf,
    pub archive_path: PathBuf,
    pub scan_interval: Duration,
    pub idle_scan_cap: usize,
    pub display_cap: usize,
    pub auto_scan: bool,
    pub listing_tool: PathBuf,
    pub feed_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub root: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
    pub auto_scan: Option<bool>,
    pub scan_interval_minutes: Option<u64>,
}

pub fn load_settings() -> Result<MonitorSettings> {
    resolve_settings(SettingsOverrides::default())
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<MonitorSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<MonitorSettings> {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<MonitorSettings> {
    let root = overrides
        .root
        .or_else(|| lookup_value("MONITOR_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .ok_or_else(|| anyhow!("MONITOR_ROOT not set"))?;

    // Minute counts too large to express in seconds are treated as malformed.
    let interval_secs = overrides
        .scan_interval_minutes
        .or_else(|| lookup_parsed("SCAN_INTERVAL_MINUTES", file_vars, &env_lookup))
        .filter(|minutes| *minutes >= 1)
        .and_then(|minutes: u64| minutes.checked_mul(60))
        .unwrap_or(DEFAULT_SCAN_INTERVAL_MINUTES * 60);
    let idle_scan_cap = lookup_parsed("IDLE_SCAN_CAP", file_vars, &env_lookup)
        .filter(|cap| *cap >= 1)
        .unwrap_or(DEFAULT_IDLE_SCAN_CAP);
    let display_cap =
        lookup_parsed("DISPLAY_CAP", file_vars, &env_lookup).unwrap_or(DEFAULT_DISPLAY_CAP);
    let auto_scan = overrides
        .auto_scan
        .or_else(|| {
            lookup_value("AUTO_SCAN", file_vars, &env_lookup)
                .as_deref()
                .and_then(parse_flag)
        })
        .unwrap_or(true);
    let listing_tool = lookup_value("LISTING_TOOL", file_vars, &env_lookup)
        .unwrap_or_else(|| DEFAULT_LISTING_TOOL.to_string());
    let feed_timeout = lookup_parsed("FEED_TIMEOUT_SECONDS", file_vars, &env_lookup)
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_FEED_TIMEOUT_SECONDS);
    let archive_path = lookup_value("DOWNLOAD_ARCHIVE", file_vars, &env_lookup)
        .map(PathBuf::from)
        .unwrap_or_else(|| root.join(ARCHIVE_FILE));

    Ok(MonitorSettings {
        store_path: root.join(STORE_FILE),
        banner_dir: root.join(BANNERS_SUBDIR),
        archive_path,
        root,
        scan_interval: Duration::from_secs(interval_secs),
        idle_scan_cap,
        display_cap,
        auto_scan,
        listing_tool: PathBuf::from(listing_tool),
        feed_timeout: Duration::from_secs(feed_timeout),
    })
}

/// Accepts the usual spellings of a boolean switch.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

fn lookup_parsed<T: std::str::FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.trim().parse::<T>().ok())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
