//! Process configuration (layered: defaults < TOML file < environment).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HubError, Result};
use crate::logging::LogFormat;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

const ENV_BIND: &str = "MCP_HUB_BIND";
const ENV_DATA_FILE: &str = "MCP_HUB_DATA_FILE";
const ENV_LOG: &str = "MCP_HUB_LOG";
const ENV_LOG_FORMAT: &str = "MCP_HUB_LOG_FORMAT";
const ENV_RECONNECT_DELAY_SECS: &str = "MCP_HUB_RECONNECT_DELAY_SECS";
const ENV_PUBLIC_URL: &str = "MCP_HUB_PUBLIC_URL";

/// Gateway process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct HubConfig {
    /// Listen address of the HTTP surface.
    pub bind: String,
    /// JSON file holding the instance records.
    pub data_file: PathBuf,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Fixed delay between outbound reconnect attempts.
    pub reconnect_delay_secs: u64,
    /// Externally reachable base URL, used for default access addresses.
    pub public_url: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            data_file: default_data_file(),
            log_level: "info".to_string(),
            log_format: LogFormat::Auto,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            public_url: None,
        }
    }
}

/// `~/.mcp-hub/instances.json`, or a relative path when no home directory is known.
pub fn default_data_file() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".mcp-hub"))
        .unwrap_or_else(|| PathBuf::from(".mcp-hub"))
        .join("instances.json")
}

impl HubConfig {
    /// Defaults, then the TOML file if given, then `MCP_HUB_*` variables (`.env` included).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|error| {
            HubError::Configuration(format!("cannot read {}: {error}", path.display()))
        })?;
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    /// Apply environment overrides on top of `self`.
    pub fn with_env(mut self) -> Result<Self> {
        if let Some(bind) = env_var(ENV_BIND) {
            self.bind = bind;
        }
        if let Some(data_file) = env_var(ENV_DATA_FILE) {
            self.data_file = PathBuf::from(data_file);
        }
        if let Some(level) = env_var(ENV_LOG) {
            self.log_level = level;
        }
        if let Some(format) = env_var(ENV_LOG_FORMAT) {
            self.log_format = format.parse().map_err(|_| {
                HubError::Configuration(format!("{ENV_LOG_FORMAT}: unknown log format {format:?}"))
            })?;
        }
        if let Some(secs) = env_var(ENV_RECONNECT_DELAY_SECS) {
            self.reconnect_delay_secs = secs.parse().map_err(|_| {
                HubError::Configuration(format!(
                    "{ENV_RECONNECT_DELAY_SECS}: expected whole seconds, got {secs:?}"
                ))
            })?;
        }
        if let Some(url) = env_var(ENV_PUBLIC_URL) {
            self.public_url = Some(url);
        }
        Ok(self)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Base URL for derived access addresses; falls back to the bind address.
    pub fn public_base(&self) -> String {
        match self.public_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}", self.bind),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
