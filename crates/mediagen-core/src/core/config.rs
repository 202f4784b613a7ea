//! Pipeline Configuration
//!
//! JSON file + environment overlay. Loading is tolerant: a missing or broken
//! file yields defaults, and bad values are clamped instead of rejected.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::jobs::JobExecutorConfig;
use crate::core::usage::{DailyLimits, LimitType};

// =============================================================================
// Environment Variables
// =============================================================================

pub const ENV_CACHE_DIR: &str = "MEDIAGEN_CACHE_DIR";
pub const ENV_USAGE_DIR: &str = "MEDIAGEN_USAGE_DIR";
pub const ENV_TRACK_USAGE: &str = "MEDIAGEN_TRACK_USAGE";
pub const ENV_RESET_HOUR_UTC: &str = "MEDIAGEN_RESET_HOUR_UTC";
pub const ENV_MAX_WAIT_SECS: &str = "MEDIAGEN_MAX_WAIT_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "MEDIAGEN_POLL_INTERVAL_MS";

/// Shortest accepted poll interval
const MIN_POLL_INTERVAL_MS: u64 = 100;

// =============================================================================
// Config
// =============================================================================

/// Pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_usage_dir")]
    pub usage_dir: PathBuf,
    #[serde(default = "default_true")]
    pub track_usage: bool,
    #[serde(default)]
    pub limits: DailyLimits,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    #[serde(default = "default_upload_ttl_secs")]
    pub upload_ttl_secs: u64,
    /// Result memoization lifetime; disabled when absent
    #[serde(default)]
    pub result_ttl_secs: Option<u64>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn data_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("mediagen")
}

fn default_cache_dir() -> PathBuf {
    data_root().join("cache")
}

fn default_usage_dir() -> PathBuf {
    data_root().join("usage")
}

fn default_true() -> bool {
    true
}

fn default_max_wait_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_pending_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_upload_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            usage_dir: default_usage_dir(),
            track_usage: true,
            limits: DailyLimits::default(),
            max_wait_secs: default_max_wait_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            pending_ttl_secs: default_pending_ttl_secs(),
            upload_ttl_secs: default_upload_ttl_secs(),
            result_ttl_secs: None,
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl PipelineConfig {
    /// Loads a JSON config file, falling back to defaults when it is missing
    /// or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        let parsed = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))
            .and_then(|content| {
                serde_json::from_str::<PipelineConfig>(&content)
                    .map_err(|e| format!("Failed to parse config file: {}", e))
            });

        match parsed {
            Ok(mut config) => {
                config.normalize();
                config
            }
            Err(e) => {
                warn!("Failed to load config {}, using defaults: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlays the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Overlays values from `lookup`; unparseable values are ignored
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CACHE_DIR).filter(|v| !v.trim().is_empty()) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_USAGE_DIR).filter(|v| !v.trim().is_empty()) {
            self.usage_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_TRACK_USAGE) {
            match parse_bool(&raw) {
                Some(v) => self.track_usage = v,
                None => warn!("Ignoring {}={:?}: expected a boolean", ENV_TRACK_USAGE, raw),
            }
        }

        for limit_type in LimitType::all() {
            if let Some(v) = parse_env::<f64>(&lookup, limit_type.env_var()) {
                self.limits.set(limit_type, Some(v));
            }
        }

        if let Some(v) = parse_env::<u32>(&lookup, ENV_RESET_HOUR_UTC) {
            self.limits.reset_hour_utc = v;
        }
        if let Some(v) = parse_env::<u64>(&lookup, ENV_MAX_WAIT_SECS) {
            self.max_wait_secs = v;
        }
        if let Some(v) = parse_env::<u64>(&lookup, ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = v;
        }

        self.normalize();
    }

    /// Clamps values into their valid ranges
    pub fn normalize(&mut self) {
        self.limits.reset_hour_utc = self.limits.reset_hour_utc.min(23);
        self.poll_interval_ms = self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        self.max_concurrency = self.max_concurrency.max(1);
        self.max_wait_secs = self.max_wait_secs.max(1);

        for limit_type in LimitType::all() {
            if let Some(v) = self.limits.get(limit_type) {
                if !v.is_finite() || v < 0.0 {
                    warn!("Dropping invalid {} limit: {}", limit_type, v);
                    self.limits.set(limit_type, None);
                }
            }
        }
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }

    /// Executor settings derived from this config
    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_wait: Duration::from_secs(self.max_wait_secs),
            pending_ttl: Duration::from_secs(self.pending_ttl_secs),
            result_ttl: self.result_ttl_secs.map(Duration::from_secs),
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid number", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(config.track_usage);
        assert_eq!(config.max_wait_secs, 600);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.pending_ttl_secs, 86_400);
        assert_eq!(config.result_ttl_secs, None);
        assert_eq!(config.max_concurrency, 4);
        assert!(config.cache_dir.ends_with("mediagen/cache"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"limits": {"images": 5}, "resultTtlSecs": 3600}"#).unwrap();
        assert_eq!(config.limits.images, Some(5.0));
        assert_eq!(config.result_ttl_secs, Some(3600));
        assert_eq!(config.max_concurrency, 4);
        assert!(config.track_usage);
    }

    #[test]
    fn test_load_missing_and_invalid_files() {
        let dir = TempDir::new().unwrap();
        assert_eq!(
            PipelineConfig::load(dir.path().join("absent.json")).max_wait_secs,
            600
        );

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ nope").unwrap();
        assert_eq!(PipelineConfig::load(&broken).poll_interval_ms, 1000);
    }

    #[test]
    fn test_load_normalizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"pollIntervalMs": 5, "maxConcurrency": 0, "limits": {"resetHourUTC": 40, "videos": -1}}"#,
        )
        .unwrap();

        let config = PipelineConfig::load(&path);
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.limits.reset_hour_utc, 23);
        assert_eq!(config.limits.videos, None);
    }

    #[test]
    fn test_env_overlay() {
        let mut config = PipelineConfig::default();
        config.apply_env_from(env(&[
            ("MEDIAGEN_CACHE_DIR", "/var/cache/mg"),
            ("MEDIAGEN_TRACK_USAGE", "false"),
            ("MEDIAGEN_LIMIT_IMAGES", "25"),
            ("MEDIAGEN_LIMIT_TOTAL_COST", "2.5"),
            ("MEDIAGEN_RESET_HOUR_UTC", "6"),
            ("MEDIAGEN_MAX_WAIT_SECS", "abc"),
        ]));

        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/mg"));
        assert!(!config.track_usage);
        assert_eq!(config.limits.images, Some(25.0));
        assert_eq!(config.limits.total_cost, Some(2.5));
        assert_eq!(config.limits.reset_hour_utc, 6);
        // Unparseable value leaves the default
        assert_eq!(config.max_wait_secs, 600);
    }

    #[test]
    fn test_executor_config() {
        let config = PipelineConfig {
            result_ttl_secs: Some(60),
            ..Default::default()
        };
        let exec = config.executor_config();
        assert_eq!(exec.poll_interval, Duration::from_secs(1));
        assert_eq!(exec.max_wait, Duration::from_secs(600));
        assert_eq!(exec.result_ttl, Some(Duration::from_secs(60)));
    }
}
