//! Daemon configuration and on-disk layout.
//!
//! Everything lives under `~/.crawl-capture` (or `$CRAWL_CAPTURE_HOME`):
//! - `config.toml`: collector URL and timing knobs
//! - `daemon.sock`: IPC socket
//! - `session.json`: persisted session snapshot
//! - `logs/`: rolling daemon log

use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const HOME_ENV: &str = "CRAWL_CAPTURE_HOME";
pub const COLLECTOR_URL_ENV: &str = "CRAWL_CAPTURE_COLLECTOR_URL";
pub const SOCKET_ENV: &str = "CRAWL_CAPTURE_SOCKET";

const STATE_DIR_NAME: &str = ".crawl-capture";
const CONFIG_FILE: &str = "config.toml";
const SOCKET_NAME: &str = "daemon.sock";
const SNAPSHOT_FILE: &str = "session.json";
const LOG_DIR: &str = "logs";

pub const DEFAULT_COLLECTOR_URL: &str = "http://localhost/api";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REATTACH_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Base URL of the collector API; `/capture/...` paths are appended.
    pub collector_url: String,
    pub request_timeout_secs: u64,
    /// Fixed delay before the single reattach attempt after a detachment.
    pub reattach_delay_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            reattach_delay_ms: DEFAULT_REATTACH_DELAY_MS,
        }
    }
}

impl DaemonConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn reattach_delay(&self) -> Duration {
        Duration::from_millis(self.reattach_delay_ms)
    }
}

pub fn state_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(HOME_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(STATE_DIR_NAME))
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    state_dir().map(|dir| dir.join(CONFIG_FILE))
}

/// `$CRAWL_CAPTURE_SOCKET` wins over the state directory.
pub fn socket_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    state_dir().map(|dir| dir.join(SOCKET_NAME))
}

pub fn snapshot_path() -> Result<PathBuf, ConfigError> {
    state_dir().map(|dir| dir.join(SNAPSHOT_FILE))
}

pub fn log_dir() -> Result<PathBuf, ConfigError> {
    state_dir().map(|dir| dir.join(LOG_DIR))
}

/// Loads the config file, falling back to defaults when it does not exist.
/// `CRAWL_CAPTURE_COLLECTOR_URL` overrides the file's collector URL.
pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => config_path()?,
    };

    let mut config = read_config_file(&config_path)?;

    if let Ok(url) = env::var(COLLECTOR_URL_ENV) {
        let url = url.trim().trim_end_matches('/');
        if !url.is_empty() {
            config.collector_url = url.to_string();
        }
    }

    Ok(config)
}

fn read_config_file(path: &Path) -> Result<DaemonConfig, ConfigError> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Persists a new collector URL, keeping the rest of the file intact.
pub fn save_collector_url(path: &Path, collector_url: &str) -> Result<(), ConfigError> {
    let mut config = read_config_file(path)?;
    config.collector_url = collector_url.to_string();

    let write_err = |details: String| ConfigError::Write {
        path: path.to_path_buf(),
        details,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| write_err(err.to_string()))?;
    }
    let content = toml::to_string_pretty(&config).map_err(|err| write_err(err.to_string()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).map_err(|err| write_err(err.to_string()))?;
    fs::rename(&tmp_path, path).map_err(|err| write_err(err.to_string()))?;
    Ok(())
}
