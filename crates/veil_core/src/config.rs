use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use veil_net::TransportConfig;

/// Environment variable naming the JSON config file.
pub const CONFIG_ENV: &str = "VEIL_CONFIG";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    /// Directory for the daily-rolling log file.
    pub log_dir: PathBuf,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            log_dir: PathBuf::from("logs"),
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Loads the file named by `VEIL_CONFIG`, or the defaults when it is unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }
}
