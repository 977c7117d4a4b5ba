use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::AppError;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "DNSLENS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/dnslens/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Period of the background buffer -> archive sync.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Max delay before queued queries are written to the buffer.
    #[serde(default = "default_buffer_flush")]
    pub buffer_flush_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_retention_check")]
    pub retention_check_hours: u64,
    /// Initial lower bound of the visible window, 0 = unbounded.
    #[serde(default)]
    pub time_window_hours: u64,
    #[serde(default)]
    pub adblock: AdblockConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdblockConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<AdblockSource>,
    #[serde(default = "default_auto_update_hours")]
    pub auto_update_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdblockSource {
    pub name: String,
    /// `http(s)://` URL, `file://` URL or a plain path.
    pub url: String,
    #[serde(default = "default_source_format")]
    pub format: String,
}

fn default_db_path() -> String {
    "/var/lib/dnslens/dnslog.sqlite".to_string()
}
fn default_sync_interval() -> u64 {
    10
}
fn default_buffer_flush() -> u64 {
    1000
}
fn default_retention_days() -> u32 {
    30
}
fn default_retention_check() -> u64 {
    6
}
fn default_true() -> bool {
    true
}
fn default_auto_update_hours() -> u64 {
    24
}
fn default_source_format() -> String {
    "hosts".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl Default for AdblockConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), AppError> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load from `path`, or from `$DNSLENS_CONFIG`, or the default location.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var(CONFIG_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };

        if path.exists() {
            Self::load_from_file(&path)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Lower timestamp bound for the initial visible window.
    pub fn initial_earliest(&self, now: i64) -> Option<i64> {
        (self.time_window_hours > 0).then(|| now - self.time_window_hours as i64 * 3600)
    }
}
