//! Server configuration

use anyhow::{Context, Result};
use protocol::constants::*;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_max_concurrent_clients")]
    pub max_concurrent_clients: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Largest chunk a client may request for a download
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Longest stream a client may request
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    /// Outbound frames queued per connection before the streamer waits
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_echo_requests: bool,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8080
}

fn default_max_concurrent_clients() -> usize {
    10
}

fn default_max_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

fn default_max_duration_ms() -> u64 {
    30_000
}

fn default_send_queue_depth() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL_MS
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            max_concurrent_clients: default_max_concurrent_clients(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            max_duration_ms: default_max_duration_ms(),
            send_queue_depth: default_send_queue_depth(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl LimitsConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.max_concurrent_clients == 0 {
            anyhow::bail!("max_concurrent_clients must be greater than zero");
        }
        if self.limits.max_chunk_size == 0 || self.limits.max_chunk_size > MAX_CHUNK_SIZE {
            anyhow::bail!("max_chunk_size must be between 1 and {} bytes", MAX_CHUNK_SIZE);
        }
        if self.limits.send_queue_depth == 0 {
            anyhow::bail!("send_queue_depth must be greater than zero");
        }
        if self.limits.progress_interval_ms == 0 {
            anyhow::bail!("progress_interval_ms must be greater than zero");
        }
        Ok(())
    }
}
