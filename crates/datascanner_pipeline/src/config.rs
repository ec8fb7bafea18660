//! Pipeline configuration parsing
//!
//! Reads settings from `~/.datascanner/config.toml` (or `--config`). Every
//! key is optional; an absent file means all defaults.

use datascanner_engine::backoff::BackoffParams;
use datascanner_engine::model::MAX_DERIVATION_DEPTH;
use datascanner_protocol::defaults::{
    DEFAULT_LEASE_SECS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_PREFETCH, DEFAULT_REQUEUE_LIMIT,
};
use datascanner_protocol::paths;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for config operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Config not found at: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Queue and report database shared by every stage.
    #[serde(default = "paths::default_database_path")]
    pub database_path: PathBuf,

    /// Container levels the processor descends into.
    #[serde(default = "default_max_derivation_depth")]
    pub max_derivation_depth: usize,

    /// Retry policy for busy backends.
    #[serde(default)]
    pub backoff: BackoffParams,

    /// Messages each stage works on at the same time.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    #[serde(default = "default_requeue_limit")]
    pub requeue_limit: u32,

    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Exporter also appends every result here as JSON lines.
    #[serde(default)]
    pub results_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: paths::default_database_path(),
            max_derivation_depth: default_max_derivation_depth(),
            backoff: BackoffParams::default(),
            prefetch: default_prefetch(),
            requeue_limit: default_requeue_limit(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            results_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_max_derivation_depth() -> usize { MAX_DERIVATION_DEPTH }
fn default_prefetch() -> usize { DEFAULT_PREFETCH }
fn default_requeue_limit() -> u32 { DEFAULT_REQUEUE_LIMIT }
fn default_lease_secs() -> u64 { DEFAULT_LEASE_SECS }
fn default_poll_interval_ms() -> u64 { DEFAULT_POLL_INTERVAL_MS }

/// Load configuration from a file. A missing file gives the defaults.
pub fn load_config(config_path: &Path) -> Result<PipelineConfig> {
    if !config_path.exists() {
        return Ok(PipelineConfig::default());
    }

    let content = std::fs::read_to_string(config_path)?;
    Ok(toml::from_str(&content)?)
}

/// Load from an explicitly named file, which then has to exist, or from
/// the default location.
pub fn load(explicit: Option<&Path>) -> Result<PipelineConfig> {
    match explicit {
        Some(path) if !path.exists() => Err(ConfigError::NotFound(path.display().to_string())),
        Some(path) => load_config(path),
        None => load_config(&paths::default_config_path()),
    }
}
