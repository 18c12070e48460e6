//! Application configuration management.
//!
//! This module handles loading and saving the configuration: where the
//! backend and the serving origin live, the project API key, the fallback
//! time zone and the sync tuning knobs.
//!
//! Configuration is stored at `~/.config/fieldsync/config.json`. The
//! `FIELDSYNC_BACKEND_URL`, `FIELDSYNC_ORIGIN_URL` and `FIELDSYNC_API_KEY`
//! environment variables override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "fieldsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Database file name in the data directory
const STORE_FILE: &str = "fieldsync.db";

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321";
const DEFAULT_ORIGIN_URL: &str = "http://127.0.0.1:3000";

pub const ENV_BACKEND_URL: &str = "FIELDSYNC_BACKEND_URL";
pub const ENV_ORIGIN_URL: &str = "FIELDSYNC_ORIGIN_URL";
pub const ENV_API_KEY: &str = "FIELDSYNC_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub origin_url: String,
    /// Project API key. Falls back to the keychain when absent.
    pub api_key: Option<String>,
    /// Zone used when the session does not carry one.
    pub default_time_zone: Option<String>,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            origin_url: DEFAULT_ORIGIN_URL.to_string(),
            api_key: None,
            default_time_zone: None,
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upserts per remote call.
    pub batch_size: usize,
    /// Transient failures before an item is dead-lettered. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Months before the current one that hydration also refreshes.
    pub lookback_months: u32,
    pub probe_timeout_ms: u64,
    pub lease_ttl_secs: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_attempts: None,
            lookback_months: 0,
            probe_timeout_ms: 3000,
            lease_ttl_secs: 300,
        }
    }
}

impl SyncConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }
}

impl Config {
    /// Load the config file (or defaults) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
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

    /// Override fields from variables found by `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v: &String| !v.trim().is_empty());
        if let Some(url) = get(ENV_BACKEND_URL) {
            self.backend_url = url;
        }
        if let Some(url) = get(ENV_ORIGIN_URL) {
            self.origin_url = url;
        }
        if let Some(key) = get(ENV_API_KEY) {
            self.api_key = Some(key);
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the store, the session and the logs.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STORE_FILE))
    }
}
