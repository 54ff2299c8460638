//! Configuration management

use crate::analysis::QualityPolicy;
use crate::output::ReportFormat;
use anyhow::{Context, Result};
use protocol::constants::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub throughput: ThroughputConfig,
    #[serde(default)]
    pub quality: QualityPolicy,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Outbound frames queued before `send` waits
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LatencyConfig {
    #[serde(default = "default_probe_count")]
    pub count: u32,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_duration_ms")]
    pub duration_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(default = "default_upload_duration_ms")]
    pub duration_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThroughputConfig {
    /// Trailing share of each phase used for the aggregate rate
    #[serde(default = "default_window_fraction")]
    pub window_fraction: f64,
    #[serde(default = "default_rate_ceiling_bps")]
    pub rate_ceiling_bps: f64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Shortest gap between inbound chunks that counts as a stall
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Slowest link a download keeps waiting on. The stall gap grows to the
    /// time one chunk takes at this rate.
    #[serde(default = "default_stall_rate_bps")]
    pub stall_rate_bps: f64,
    /// Bound on waiting for the server to wind a stream down after `stop`
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_true")]
    pub use_colors: bool,
    #[serde(default)]
    pub report_path: Option<String>,
    #[serde(default)]
    pub format: ReportFormat,
}

/// The part of the configuration a measurement session runs with
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub latency: LatencyConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub throughput: ThroughputConfig,
    pub quality: QualityPolicy,
}

/// Invalid phase configuration, rejected before any phase runs
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{phase} duration must be greater than zero")]
    ZeroDuration { phase: &'static str },

    #[error("{phase} chunk size must be between 1 and {max} bytes (got {got})")]
    InvalidChunkSize {
        phase: &'static str,
        max: usize,
        got: usize,
    },

    #[error("Probe count must be greater than zero")]
    ZeroProbeCount,

    #[error("Probe timeout must be greater than zero")]
    ZeroProbeTimeout,

    #[error("Window fraction must be in (0, 1] (got {0})")]
    InvalidWindowFraction(f64),

    #[error("Progress interval must be greater than zero")]
    ZeroProgressInterval,

    #[error("Chunk timeout must be greater than zero")]
    ZeroChunkTimeout,

    #[error("Stall rate must be a positive number (got {0})")]
    InvalidStallRate(f64),

    #[error("Rate ceiling must be a positive number (got {0})")]
    InvalidRateCeiling(f64),

    #[error("Send queue depth must be greater than zero")]
    ZeroQueueDepth,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_send_queue_depth() -> usize {
    8
}

fn default_probe_count() -> u32 {
    DEFAULT_PROBE_COUNT
}

fn default_probe_interval_ms() -> u64 {
    DEFAULT_PROBE_INTERVAL_MS
}

fn default_probe_timeout_ms() -> u64 {
    DEFAULT_PROBE_TIMEOUT_MS
}

fn default_download_duration_ms() -> u64 {
    DEFAULT_DOWNLOAD_DURATION_MS
}

fn default_upload_duration_ms() -> u64 {
    DEFAULT_UPLOAD_DURATION_MS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_window_fraction() -> f64 {
    DEFAULT_WINDOW_FRACTION
}

fn default_rate_ceiling_bps() -> f64 {
    DEFAULT_RATE_CEILING_BPS
}

fn default_progress_interval_ms() -> u64 {
    DEFAULT_PROGRESS_INTERVAL_MS
}

fn default_chunk_timeout_ms() -> u64 {
    2000
}

fn default_stall_rate_bps() -> f64 {
    1_000_000.0
}

fn default_drain_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_queue_depth: default_send_queue_depth(),
        }
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            count: default_probe_count(),
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_download_duration_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_upload_duration_ms(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            window_fraction: default_window_fraction(),
            rate_ceiling_bps: default_rate_ceiling_bps(),
            progress_interval_ms: default_progress_interval_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            stall_rate_bps: default_stall_rate_bps(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            use_colors: default_true(),
            report_path: None,
            format: ReportFormat::default(),
        }
    }
}

impl LatencyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ThroughputConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    /// Longest gap between `chunk_size` chunks before a download counts as
    /// stalled
    pub fn stall_timeout(&self, chunk_size: usize) -> Duration {
        let one_chunk = Duration::try_from_secs_f64(8.0 * chunk_size as f64 / self.stall_rate_bps)
            .unwrap_or(Duration::MAX);
        self.chunk_timeout().max(one_chunk)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| "Failed to parse config file")?;

        config.quality.normalize();
        config
            .session_config()
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path.as_ref()))?;

        if config.general.send_queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth.into());
        }

        Ok(config)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            latency: self.latency.clone(),
            download: self.download.clone(),
            upload: self.upload.clone(),
            throughput: self.throughput.clone(),
            quality: self.quality.clone(),
        }
    }
}

impl SessionConfig {
    /// Check every phase parameter; called by `Session::start`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.latency.count == 0 {
            return Err(ConfigError::ZeroProbeCount);
        }
        if self.latency.timeout_ms == 0 {
            return Err(ConfigError::ZeroProbeTimeout);
        }

        for (phase, duration_ms, chunk_size) in [
            ("download", self.download.duration_ms, self.download.chunk_size),
            ("upload", self.upload.duration_ms, self.upload.chunk_size),
        ] {
            if duration_ms == 0 {
                return Err(ConfigError::ZeroDuration { phase });
            }
            if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
                return Err(ConfigError::InvalidChunkSize {
                    phase,
                    max: MAX_CHUNK_SIZE,
                    got: chunk_size,
                });
            }
        }

        let t = &self.throughput;
        if !(t.window_fraction > 0.0 && t.window_fraction <= 1.0) {
            return Err(ConfigError::InvalidWindowFraction(t.window_fraction));
        }
        if t.progress_interval_ms == 0 {
            return Err(ConfigError::ZeroProgressInterval);
        }
        if t.chunk_timeout_ms == 0 {
            return Err(ConfigError::ZeroChunkTimeout);
        }
        if !(t.stall_rate_bps.is_finite() && t.stall_rate_bps > 0.0) {
            return Err(ConfigError::InvalidStallRate(t.stall_rate_bps));
        }
        if !(t.rate_ceiling_bps.is_finite() && t.rate_ceiling_bps > 0.0) {
            return Err(ConfigError::InvalidRateCeiling(t.rate_ceiling_bps));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.session_config().validate().is_ok());
        assert_eq!(config.download.duration_ms, 8000);
        assert_eq!(config.upload.duration_ms, 5000);
        assert_eq!(config.download.chunk_size, 1024 * 1024);
        assert_eq!(config.latency.timeout_ms, 2000);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut session = SessionConfig::default();
        session.upload.duration_ms = 0;
        assert_eq!(
            session.validate(),
            Err(ConfigError::ZeroDuration { phase: "upload" })
        );
    }

    #[test]
    fn test_window_fraction_bounds() {
        let mut session = SessionConfig::default();
        session.throughput.window_fraction = 0.0;
        assert!(matches!(session.validate(), Err(ConfigError::InvalidWindowFraction(_))));

        session.throughput.window_fraction = 1.0;
        assert!(session.validate().is_ok());

        session.throughput.window_fraction = f64::NAN;
        assert!(matches!(session.validate(), Err(ConfigError::InvalidWindowFraction(_))));
    }

    #[test]
    fn test_stall_timeout_scales_with_chunk_size() {
        let mut throughput = ThroughputConfig::default();
        // Small chunks keep the fixed gap
        assert_eq!(throughput.stall_timeout(64 * 1024), Duration::from_millis(2000));
        // 1 MiB at 1 Mbps takes about 8.4 s
        let big = throughput.stall_timeout(1024 * 1024);
        assert!(big > Duration::from_millis(8300) && big < Duration::from_millis(8500));

        throughput.stall_rate_bps = 0.0;
        let mut session = SessionConfig::default();
        session.throughput = throughput;
        assert_eq!(session.validate(), Err(ConfigError::InvalidStallRate(0.0)));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut session = SessionConfig::default();
        session.download.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(matches!(
            session.validate(),
            Err(ConfigError::InvalidChunkSize { phase: "download", .. })
        ));
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[general]
server_url = "ws://speed.example.net:9000"

[download]
duration_ms = 3000

[quality]
latency_steps = [[100.0, 20.0], [20.0, 5.0]]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.general.server_url, "ws://speed.example.net:9000");
        assert_eq!(config.download.duration_ms, 3000);
        assert_eq!(config.download.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.upload.duration_ms, DEFAULT_UPLOAD_DURATION_MS);
        // Steps are sorted on load
        assert_eq!(config.quality.latency_steps, vec![[20.0, 5.0], [100.0, 20.0]]);
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let mut config: Config = toml::from_str(include_str!("../../client.conf.example")).unwrap();
        config.quality.normalize();
        assert!(config.session_config().validate().is_ok());
        assert_eq!(config.general.server_url, default_server_url());
        assert_eq!(config.throughput.window_fraction, DEFAULT_WINDOW_FRACTION);
        assert_eq!(config.quality, QualityPolicy::default());
        assert_eq!(config.output.format, ReportFormat::Json);
        assert!(config.output.report_path.is_none());
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[latency]\ncount = 0").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
