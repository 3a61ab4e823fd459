//! Application configuration management.
//!
//! This module handles loading and saving the engine configuration: cache
//! expiry policies, tile download parameters, connectivity probing and the
//! retry protocol. Every field has a default, so a missing or partial file
//! is fine.
//!
//! Configuration is stored at `~/.config/pharmacache/config.json`.
//! A handful of fields can be overridden with `PHARMACACHE_*` environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "pharmacache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Prefix for environment overrides
const ENV_PREFIX: &str = "PHARMACACHE_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for cache snapshots and tiles. `None` means the platform cache dir.
    pub cache_dir: Option<PathBuf>,

    // Expiring cache
    pub cache_expiry_hours: u64,
    pub map_state_expiry_days: u64,

    // Search
    pub default_search_radius_m: u32,
    pub max_search_radius_m: u32,
    pub max_markers: usize,
    pub default_latitude: f64,
    pub default_longitude: f64,
    pub overpass_url: String,
    pub user_agent: String,

    // Tiles
    pub tile_url_template: String,
    pub tile_min_zoom: u8,
    pub tile_max_zoom: u8,
    pub tile_download_delay_ms: u64,
    pub tile_download_workers: usize,
    pub tile_origin_port: u16,
    pub tile_origin_workers: usize,

    // Connectivity
    pub probe_hosts: Vec<String>,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,

    // Retry protocol
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub fetch_workers: usize,
    pub watchdog_enabled: bool,
    pub watchdog_threshold_ms: u64,

    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            cache_expiry_hours: 24,
            map_state_expiry_days: 7,
            default_search_radius_m: 5000,
            max_search_radius_m: 20000,
            max_markers: 100,
            // Casablanca
            default_latitude: 33.5731,
            default_longitude: -7.5898,
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            user_agent: format!("{}/{}", APP_NAME, env!("CARGO_PKG_VERSION")),
            tile_url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            tile_min_zoom: 12,
            tile_max_zoom: 16,
            tile_download_delay_ms: 100,
            tile_download_workers: 2,
            tile_origin_port: 8765,
            tile_origin_workers: 4,
            probe_hosts: vec![
                "8.8.8.8:53".to_string(),
                "1.1.1.1:53".to_string(),
                "208.67.222.222:53".to_string(),
            ],
            probe_interval_secs: 10,
            probe_timeout_ms: 3000,
            max_retries: 2,
            retry_delay_ms: 2000,
            fetch_workers: 2,
            watchdog_enabled: false,
            watchdog_threshold_ms: 5000,
            shutdown_grace_ms: 2000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn tile_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("tiles"))
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("logs"))
    }

    /// Apply `PHARMACACHE_*` environment overrides. Unparseable values are
    /// logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_var("CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = env_var("TILE_URL") {
            self.tile_url_template = url;
        }
        if let Some(url) = env_var("OVERPASS_URL") {
            self.overpass_url = url;
        }
        if let Some(hosts) = env_var("PROBE_HOSTS") {
            self.probe_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(port) = env_var("TILE_ORIGIN_PORT") {
            match port.parse() {
                Ok(p) => self.tile_origin_port = p,
                Err(_) => warn!(value = %port, "Invalid PHARMACACHE_TILE_ORIGIN_PORT, keeping default"),
            }
        }
        if let Some(hours) = env_var("CACHE_EXPIRY_HOURS") {
            match hours.parse() {
                Ok(h) => self.cache_expiry_hours = h,
                Err(_) => warn!(value = %hours, "Invalid PHARMACACHE_CACHE_EXPIRY_HOURS, keeping default"),
            }
        }
    }

    pub fn cache_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.cache_expiry_hours as i64)
    }

    pub fn map_state_expiry(&self) -> chrono::Duration {
        chrono::Duration::days(self.map_state_expiry_days as i64)
    }

    pub fn tile_download_delay(&self) -> Duration {
        Duration::from_millis(self.tile_download_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn watchdog_threshold(&self) -> Duration {
        Duration::from_millis(self.watchdog_threshold_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Requested radius clamped to the configured maximum.
    pub fn search_radius(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_search_radius_m)
            .min(self.max_search_radius_m)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.cache_expiry(), chrono::Duration::hours(24));
        assert_eq!(config.map_state_expiry(), chrono::Duration::days(7));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_delay(), Duration::from_secs(2));
        assert_eq!((config.tile_min_zoom, config.tile_max_zoom), (12, 16));
        assert_eq!(config.probe_hosts.len(), 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay_ms, 2000);
        assert_eq!(config.tile_origin_port, 8765);
    }

    #[test]
    fn test_search_radius_is_clamped() {
        let config = Config::default();
        assert_eq!(config.search_radius(None), 5000);
        assert_eq!(config.search_radius(Some(50_000)), 20_000);
        assert_eq!(config.search_radius(Some(1200)), 1200);
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let config = Config {
            cache_dir: Some(PathBuf::from("/tmp/pc")),
            ..Config::default()
        };
        assert_eq!(config.cache_dir().unwrap(), PathBuf::from("/tmp/pc"));
        assert_eq!(config.tile_dir().unwrap(), PathBuf::from("/tmp/pc/tiles"));
    }
}
