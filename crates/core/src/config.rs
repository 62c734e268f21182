//! Configuration for the arcflow pipeline with per-directory overrides.
//!
//! Config priority: directory-relative (.arcflow/arcflow.toml) > user (~/.config/arcflow/config.toml) > defaults

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, ErrorDomain};

/// Errors raised while reading or writing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("Failed to serialize config: {0}")]
  Serialize(#[from] toml::ser::Error),
}

impl DomainError for ConfigError {
  fn domain(&self) -> ErrorDomain {
    ErrorDomain::Config
  }

  fn code(&self) -> u32 {
    match self {
      Self::Io { .. } => 1,
      Self::Parse(_) => 2,
      Self::Serialize(_) => 3,
    }
  }
}

// ============================================================================
// Cache Configuration
// ============================================================================

/// Arc cache bounds and persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Upper bound on the summed cost of live arcs.
  /// An arc costs the byte length of its content, minimum 1.
  pub capacity: u64,

  /// Arcs not looked up for this many seconds are evicted
  #[serde(skip_serializing_if = "Option::is_none")]
  pub idle_timeout_secs: Option<u64>,

  /// When set, failed computations are cached as negative arcs for this many seconds.
  /// Unset (the default) means failures are never cached.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub negative_ttl_secs: Option<u64>,

  /// Directory for the on-disk arc store. Unset disables persistence.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub persist_dir: Option<PathBuf>,

  /// Maximum number of cached address-filter decisions
  pub filter_capacity: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: 64 * 1024 * 1024,
      idle_timeout_secs: Some(3600),
      negative_ttl_secs: None,
      persist_dir: None,
      filter_capacity: 1024,
    }
  }
}

// ============================================================================
// Filter Configuration
// ============================================================================

/// One address filter rule. `pattern` is a regular expression matched against
/// the normalized address string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FilterRuleConfig {
  Block { pattern: String },
  Redirect { pattern: String, to: String },
}

impl FilterRuleConfig {
  pub fn pattern(&self) -> &str {
    match self {
      Self::Block { pattern } | Self::Redirect { pattern, .. } => pattern,
    }
  }
}

/// Ordered address filter rules; the first matching rule wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
  pub rules: Vec<FilterRuleConfig>,
}

// ============================================================================
// Queue / Retry / Pipeline Configuration
// ============================================================================

fn default_workers() -> usize {
  num_cpus::get().max(1)
}

/// Worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Number of parallel queue processors draining the shared queue
  pub workers: usize,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      workers: default_workers(),
    }
  }
}

/// Backoff settings for retrying failed processor runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Maximum number of retry attempts after the first failure
  pub max_retries: u32,
  /// Delay before the first retry, in milliseconds
  pub initial_backoff_ms: u64,
  /// Upper bound on any single delay, in milliseconds
  pub max_backoff_ms: u64,
  /// Exponential factor applied per attempt
  pub backoff_multiplier: f64,
  /// Add up to 25% jitter to each delay
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_backoff_ms: 100,
      max_backoff_ms: 5_000,
      backoff_multiplier: 2.0,
      jitter: true,
    }
  }
}

/// Pipeline driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  /// Redirect filter decisions followed before giving up
  pub max_redirects: u32,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self { max_redirects: 5 }
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

fn default_log_level() -> String {
  "info".to_string()
}

fn default_log_rotation() -> String {
  "daily".to_string()
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: off, error, warn, info, debug, trace (RUST_LOG overrides)
  pub level: String,
  /// File rotation: hourly, daily, never
  pub rotation: String,
  /// Write logs to files in this directory instead of the console
  #[serde(skip_serializing_if = "Option::is_none")]
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      rotation: default_log_rotation(),
      directory: None,
    }
  }
}

// ============================================================================
// Top-level Configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub filter: FilterConfig,
  pub queue: QueueConfig,
  pub retry: RetryConfig,
  pub pipeline: PipelineConfig,
  pub logging: LoggingConfig,
}

impl Config {
  /// Load config for a directory, falling back to user config, then defaults.
  ///
  /// Unreadable or malformed files are skipped, never fatal.
  pub fn load(dir: &Path) -> Self {
    let local_config = Self::project_config_path(dir);
    if local_config.exists()
      && let Ok(config) = Self::load_from_path(&local_config)
    {
      return config;
    }

    if let Some(user_config_path) = Self::user_config_path()
      && user_config_path.exists()
      && let Ok(config) = Self::load_from_path(&user_config_path)
    {
      return config;
    }

    Self::default()
  }

  /// Load config from an explicit file, surfacing errors.
  pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&content)
  }

  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(content)?)
  }

  pub fn to_toml_string(&self) -> Result<String, ConfigError> {
    Ok(toml::to_string(self)?)
  }

  /// Get the user config path
  pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("arcflow").join("config.toml"))
  }

  /// Get the directory-relative config path
  pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".arcflow").join("arcflow.toml")
  }

  pub fn negative_ttl(&self) -> Option<std::time::Duration> {
    self.cache.negative_ttl_secs.map(std::time::Duration::from_secs)
  }

  pub fn idle_timeout(&self) -> Option<std::time::Duration> {
    self.cache.idle_timeout_secs.map(std::time::Duration::from_secs)
  }
}
