//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if required values are missing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::storage::StorageOptions;

const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Names this consumer's working directory. Defaults to the process id.
    pub consumer_id: String,
    /// Rescan interval when no filesystem notification arrives.
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

/// On-disk shape of the TOML config; everything but `data_dir` is optional.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    data_dir: PathBuf,
    consumer_id: Option<String>,
    poll_interval_ms: Option<u64>,
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Defaults for everything except the data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            consumer_id: std::process::id().to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(required_var("QUEUELITE_DATA_DIR")?);
        if let Ok(id) = std::env::var("QUEUELITE_CONSUMER_ID") {
            config.consumer_id = id;
        }
        if let Ok(ms) = std::env::var("QUEUELITE_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms.parse().map_err(|_| {
                Error::Config(format!("QUEUELITE_POLL_INTERVAL_MS is not a number: {ms:?}"))
            })?);
        }
        config.otel_endpoint = std::env::var("OTEL_ENDPOINT").ok();
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad config {}: {e}", path.display())))
    }

    fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        let file: FileConfig = toml::from_str(content)?;
        let mut config = Self::new(file.data_dir);
        if let Some(id) = file.consumer_id {
            config.consumer_id = id;
        }
        if let Some(ms) = file.poll_interval_ms {
            config.poll_interval = Duration::from_millis(ms);
        }
        config.otel_endpoint = file.otel_endpoint;
        if let Some(level) = file.log_level {
            config.log_level = level;
        }
        Ok(config)
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            poll_interval: self.poll_interval,
            ..StorageOptions::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
