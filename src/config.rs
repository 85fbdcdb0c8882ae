use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sentinel::SentinelOptions;

const DEFAULT_API_ADDR: &str = crate::api::DEFAULT_API_ADDR;
const DEFAULT_SETTINGS_DIR: &str = "settings";
const DEFAULT_BUFFER_CAPACITY: usize = crate::buffer::DEFAULT_BUFFER_CAPACITY;
const DEFAULT_QUEUE_CAPACITY: usize = crate::sink::DEFAULT_QUEUE_CAPACITY;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 5 * 60;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SentineldConfigFile {
    api_addr: Option<String>,
    settings_dir: Option<PathBuf>,
    buffer_capacity: Option<usize>,
    queue_capacity: Option<usize>,
    fetch_timeout_secs: Option<u64>,
    backoff_max_secs: Option<u64>,
    cloud: Option<CloudConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CloudConfigFile {
    api_url: Option<String>,
    content_url: Option<String>,
}

/// Process-level configuration of `sentineld`. The camera and sink settings
/// are not here: they live in the settings store and change at runtime.
#[derive(Debug, Clone)]
pub struct SentineldConfig {
    pub api_addr: String,
    pub settings_dir: PathBuf,
    pub buffer_capacity: usize,
    pub queue_capacity: usize,
    pub fetch_timeout: Duration,
    pub backoff_max: Duration,
    pub cloud_api_url: String,
    pub cloud_content_url: String,
}

impl SentineldConfig {
    /// Defaults, overlaid by the file named in `SENTINEL_CONFIG` (JSON, or TOML
    /// for a `.toml` extension), overlaid by `SENTINEL_*` variables.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTINEL_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentineldConfigFile) -> Self {
        let cloud = file.cloud.unwrap_or_default();
        Self {
            api_addr: file
                .api_addr
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            settings_dir: file
                .settings_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_DIR)),
            buffer_capacity: file.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY),
            queue_capacity: file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            fetch_timeout: Duration::from_secs(
                file.fetch_timeout_secs
                    .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
            ),
            backoff_max: Duration::from_secs(
                file.backoff_max_secs.unwrap_or(DEFAULT_BACKOFF_MAX_SECS),
            ),
            cloud_api_url: cloud
                .api_url
                .unwrap_or_else(|| crate::sink::dropbox::DEFAULT_API_URL.to_string()),
            cloud_content_url: cloud
                .content_url
                .unwrap_or_else(|| crate::sink::dropbox::DEFAULT_CONTENT_URL.to_string()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("SENTINEL_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("SENTINEL_SETTINGS_DIR") {
            if !dir.trim().is_empty() {
                self.settings_dir = PathBuf::from(dir);
            }
        }
        if let Ok(capacity) = std::env::var("SENTINEL_BUFFER_CAPACITY") {
            self.buffer_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_BUFFER_CAPACITY must be a positive integer"))?;
        }
        if let Ok(capacity) = std::env::var("SENTINEL_QUEUE_CAPACITY") {
            self.queue_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("SENTINEL_QUEUE_CAPACITY must be a positive integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("api_addr '{}' is not a socket address: {}", self.api_addr, e))?;
        if self.buffer_capacity == 0 {
            return Err(anyhow!("buffer_capacity must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be greater than zero"));
        }
        if self.fetch_timeout.is_zero() {
            return Err(anyhow!("fetch_timeout_secs must be greater than zero"));
        }
        if self.backoff_max < crate::backoff::DEFAULT_BACKOFF_MIN {
            return Err(anyhow!("backoff_max_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn sentinel_options(&self) -> SentinelOptions {
        SentinelOptions {
            buffer_capacity: self.buffer_capacity,
            queue_capacity: self.queue_capacity,
            backoff_max: self.backoff_max,
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentineldConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
