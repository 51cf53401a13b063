//! Configuration loading and validation.
//!
//! A single TOML document configures the whole process. Missing optional keys
//! fall back to defaults; invalid values fail startup with a message that
//! names the offending key.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
}

/// Connection settings for the remote media server.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub server_url: String,
    pub api_key: String,
    pub user_id: String,
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_upstream_retry_attempts")]
    pub retry_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub max_size_gb: f64,
    pub eviction_threshold: f64,
    pub temp_directory: Option<PathBuf>,
    /// Items served or downloaded within this window are never evicted.
    pub protection_window_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./cache"),
            max_size_gb: 500.0,
            eviction_threshold: 0.85,
            temp_directory: None,
            protection_window_secs: 24 * 60 * 60,
        }
    }
}

impl CacheConfig {
    /// Resolved temp area, `{directory}/temp` unless overridden.
    pub fn temp_directory(&self) -> PathBuf {
        self.temp_directory
            .clone()
            .unwrap_or_else(|| self.directory.join("temp"))
    }

    pub fn max_size_bytes(&self) -> u64 {
        (self.max_size_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }

    pub fn protection_window(&self) -> Duration {
        Duration::from_secs(self.protection_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub workers: usize,
    pub rate_limit_mbps: f64,
    pub rate_limit_schedule: RateLimitScheduleConfig,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub auto_download_current: bool,
    pub auto_download_next: bool,
    pub auto_download_count: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            rate_limit_mbps: 10.0,
            rate_limit_schedule: RateLimitScheduleConfig::default(),
            retry_attempts: 5,
            retry_delay_ms: 1000,
            auto_download_current: true,
            auto_download_next: true,
            auto_download_count: 2,
        }
    }
}

impl DownloadConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Peak/off-peak bandwidth scheduling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitScheduleConfig {
    /// `HH:MM-HH:MM`, may span midnight. Empty string disables peak throttling.
    pub peak_hours: String,
    pub peak_limit_percent: u32,
}

impl Default for RateLimitScheduleConfig {
    fn default() -> Self {
        Self {
            peak_hours: "06:00-23:00".to_string(),
            peak_limit_percent: 25,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub enable_compression: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
            read_timeout_secs: 15,
            write_timeout_secs: 15,
            enable_compression: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub enabled: bool,
    pub sync_interval_secs: u64,
    pub history_days: u32,
    pub min_confidence: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sync_interval_secs: 4 * 60 * 60,
            history_days: 30,
            min_confidence: 0.7,
        }
    }
}

impl PredictionConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_upstream_retry_attempts() -> u32 {
    3
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every recognised key. The error message names the key so
    /// startup failures are actionable.
    pub fn validate(&self) -> Result<()> {
        if self.upstream.server_url.is_empty() {
            bail!("upstream.server_url must not be empty");
        }
        if self.upstream.api_key.is_empty() {
            bail!("upstream.api_key must not be empty");
        }
        if self.upstream.user_id.is_empty() {
            bail!("upstream.user_id must not be empty");
        }
        if self.cache.max_size_gb <= 0.0 {
            bail!("cache.max_size_gb must be positive");
        }
        if self.cache.eviction_threshold <= 0.0 || self.cache.eviction_threshold >= 1.0 {
            bail!("cache.eviction_threshold must be in (0, 1)");
        }
        if !(1..=10).contains(&self.download.workers) {
            bail!("download.workers must be in 1..=10");
        }
        if self.download.rate_limit_mbps <= 0.0 {
            bail!("download.rate_limit_mbps must be positive");
        }
        let schedule = &self.download.rate_limit_schedule;
        if !schedule.peak_hours.is_empty() {
            crate::rate::PeakWindow::parse(&schedule.peak_hours).with_context(|| {
                format!(
                    "download.rate_limit_schedule.peak_hours is invalid: {:?}",
                    schedule.peak_hours
                )
            })?;
        }
        if !(1..=100).contains(&schedule.peak_limit_percent) {
            bail!("download.rate_limit_schedule.peak_limit_percent must be in 1..=100");
        }
        if self.download.retry_attempts > 20 {
            bail!("download.retry_attempts must be in 0..=20");
        }
        if !(100..=60_000).contains(&self.download.retry_delay_ms) {
            bail!("download.retry_delay_ms must be in 100..=60000");
        }
        if self.download.auto_download_count > 10 {
            bail!("download.auto_download_count must be in 0..=10");
        }
        if !(1..=365).contains(&self.prediction.history_days) {
            bail!("prediction.history_days must be in 1..=365");
        }
        if !(0.0..=1.0).contains(&self.prediction.min_confidence) {
            bail!("prediction.min_confidence must be in [0, 1]");
        }
        Ok(())
    }
}
