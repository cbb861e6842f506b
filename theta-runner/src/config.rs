//! Serializable run configuration.
//!
//! A run is described by one TOML file:
//!
//! ```toml
//! symbols = ["SPX", "VIX"]
//! output_dir = "data"
//!
//! [terminal]
//! base_url = "http://127.0.0.1:25503/v3"
//!
//! [bulk]
//! workers = 4
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use theta_core::client::{parse_interval, DEFAULT_BASE_URL};
use theta_core::corrector::CorrectorConfig;
use theta_core::requester::RetryPolicy;
use thiserror::Error;

use crate::engine::EngineOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything needed to run the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Option roots to download.
    pub symbols: Vec<String>,

    /// Partition store root.
    pub output_dir: PathBuf,

    pub terminal: TerminalConfig,
    pub retry: RetryConfig,
    pub bulk: BulkConfig,
    pub corrector: CorrectorSection,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["SPX".to_string()],
            output_dir: PathBuf::from("data"),
            terminal: TerminalConfig::default(),
            retry: RetryConfig::default(),
            bulk: BulkConfig::default(),
            corrector: CorrectorSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Bar interval requested from history endpoints.
    pub interval: String,
    /// Greeks sampling interval for spot-proxy reconstruction.
    pub spot_sample_interval: String,
    /// JSON Lines audit trail of every request attempt.
    pub audit_log: PathBuf,
    /// Per-endpoint statistics CSV written after a run.
    pub stats_csv: Option<PathBuf>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 60,
            interval: "1m".to_string(),
            spot_sample_interval: "1s".to_string(),
            audit_log: PathBuf::from("logs/requests.jsonl"),
            stats_csv: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 6_000,
            jitter_pct: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BulkConfig {
    pub workers: usize,
    /// Attempts per work unit, on top of the requester's own retries.
    pub max_unit_attempts: u32,
    /// Re-download units whose partition already passes the integrity check.
    pub force: bool,
    /// Restrict calendar targets to expirations the terminal lists.
    pub intersect_listed: bool,
    /// Run the corrector over each fetched batch before persisting it.
    pub correct_on_fetch: bool,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_unit_attempts: 2,
            force: false,
            intersect_listed: true,
            correct_on_fetch: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CorrectorSection {
    pub expected_interval: String,
    pub max_gap_intervals: usize,
    pub neighbor_window: usize,
    /// Omit to allow re-fetching partitions of any age.
    pub refetch_retention_days: Option<i64>,
}

impl Default for CorrectorSection {
    fn default() -> Self {
        Self {
            expected_interval: "1m".to_string(),
            max_gap_intervals: 5,
            neighbor_window: 5,
            refetch_retention_days: Some(365),
        }
    }
}

impl RunConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("at least one symbol is required".into()));
        }
        if let Some(s) = self.symbols.iter().find(|s| s.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("blank symbol {s:?}")));
        }
        if self.bulk.workers == 0 {
            return Err(ConfigError::Invalid("bulk.workers must be at least 1".into()));
        }
        if self.bulk.max_unit_attempts == 0 {
            return Err(ConfigError::Invalid(
                "bulk.max_unit_attempts must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_pct) {
            return Err(ConfigError::Invalid(format!(
                "retry.jitter_pct must be within [0, 1], got {}",
                self.retry.jitter_pct
            )));
        }
        if self.terminal.timeout_secs == 0 {
            return Err(ConfigError::Invalid("terminal.timeout_secs must be positive".into()));
        }
        for (field, value) in [
            ("terminal.interval", &self.terminal.interval),
            ("terminal.spot_sample_interval", &self.terminal.spot_sample_interval),
            ("corrector.expected_interval", &self.corrector.expected_interval),
        ] {
            if parse_interval(value).is_none() {
                return Err(ConfigError::Invalid(format!("{field}: bad interval {value:?}")));
            }
        }
        if self.corrector.refetch_retention_days.is_some_and(|d| d < 0) {
            return Err(ConfigError::Invalid(
                "corrector.refetch_retention_days must not be negative".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            self.retry.base_delay_ms,
            self.retry.max_delay_ms,
            self.retry.jitter_pct,
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.terminal.timeout_secs)
    }

    pub fn corrector_config(&self) -> CorrectorConfig {
        let defaults = CorrectorConfig::default();
        CorrectorConfig {
            expected_interval: parse_interval(&self.corrector.expected_interval)
                .unwrap_or(defaults.expected_interval),
            max_gap_intervals: self.corrector.max_gap_intervals,
            neighbor_window: self.corrector.neighbor_window,
            refetch_retention_days: self.corrector.refetch_retention_days,
            reference_date: None,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_unit_attempts: self.bulk.max_unit_attempts,
            force: self.bulk.force,
            intersect_listed: self.bulk.intersect_listed,
        }
    }
}
