use std::{collections::HashMap, path::PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Core configuration. Sourced from an optional TOML file, overlaid
/// by environment variables and CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
  /// Path to the sqlite database file.
  /// Default: `docksmith.db`
  #[serde(default = "default_database_path")]
  pub database_path: PathBuf,

  /// Interval between background discovery passes in seconds.
  /// Default: `300`
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,

  /// Post-update health poll deadline in seconds.
  /// Default: `60`
  #[serde(default = "default_health_check_timeout")]
  pub health_check_timeout_secs: u64,

  /// Pre-update check script deadline in seconds.
  /// Default: `120`
  #[serde(default = "default_precheck_timeout")]
  pub precheck_timeout_secs: u64,

  /// Deadline for any single orchestration stage in seconds.
  /// Default: `600`
  #[serde(default = "default_stage_timeout")]
  pub stage_timeout_secs: u64,

  /// TTL for cached version resolutions in seconds.
  /// Default: `3600`
  #[serde(default = "default_version_cache_ttl")]
  pub version_cache_ttl_secs: u64,

  /// Retries for registry 429 / timeout before surfacing.
  /// Default: `3`
  #[serde(default = "default_registry_max_retries")]
  pub registry_max_retries: u32,

  /// Periodically prune dangling images.
  /// Default: `false`
  #[serde(default)]
  pub prune_enabled: bool,

  /// Interval between prune runs in seconds.
  /// Default: `86400`
  #[serde(default = "default_prune_interval")]
  pub prune_interval_secs: u64,

  /// Manual container -> stack mappings for containers without a
  /// compose project label.
  #[serde(default)]
  pub manual_stacks: HashMap<String, String>,

  /// Registry domain -> token. The opaque credential source for
  /// registry auth.
  #[serde(default)]
  pub registry_tokens: HashMap<String, String>,

  #[serde(default)]
  pub logging: LogConfig,
}

impl Default for CoreConfig {
  fn default() -> CoreConfig {
    CoreConfig {
      database_path: default_database_path(),
      poll_interval_secs: default_poll_interval(),
      health_check_timeout_secs: default_health_check_timeout(),
      precheck_timeout_secs: default_precheck_timeout(),
      stage_timeout_secs: default_stage_timeout(),
      version_cache_ttl_secs: default_version_cache_ttl(),
      registry_max_retries: default_registry_max_retries(),
      prune_enabled: false,
      prune_interval_secs: default_prune_interval(),
      manual_stacks: Default::default(),
      registry_tokens: Default::default(),
      logging: Default::default(),
    }
  }
}

impl CoreConfig {
  /// Config with registry tokens masked, safe for startup logging.
  pub fn sanitized(&self) -> CoreConfig {
    let mut config = self.clone();
    for token in config.registry_tokens.values_mut() {
      *token = String::from("*****");
    }
    config
  }
}

fn default_database_path() -> PathBuf {
  PathBuf::from("docksmith.db")
}
fn default_poll_interval() -> u64 {
  300
}
fn default_health_check_timeout() -> u64 {
  60
}
fn default_precheck_timeout() -> u64 {
  120
}
fn default_stage_timeout() -> u64 {
  600
}
fn default_version_cache_ttl() -> u64 {
  3600
}
fn default_registry_max_retries() -> u32 {
  3
}
fn default_prune_interval() -> u64 {
  86400
}

/// Environment variable overrides, `DOCKSMITH_` prefixed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Env {
  #[serde(default)]
  pub docksmith_config_path: Option<PathBuf>,
  #[serde(default)]
  pub docksmith_database_path: Option<PathBuf>,
  #[serde(default)]
  pub docksmith_poll_interval_secs: Option<u64>,
  #[serde(default)]
  pub docksmith_health_check_timeout_secs: Option<u64>,
  #[serde(default)]
  pub docksmith_precheck_timeout_secs: Option<u64>,
  #[serde(default)]
  pub docksmith_stage_timeout_secs: Option<u64>,
  #[serde(default)]
  pub docksmith_version_cache_ttl_secs: Option<u64>,
  #[serde(default)]
  pub docksmith_registry_max_retries: Option<u32>,
  #[serde(default)]
  pub docksmith_prune_enabled: Option<bool>,
  #[serde(default)]
  pub docksmith_prune_interval_secs: Option<u64>,
  #[serde(default)]
  pub docksmith_logging_level: Option<LogLevel>,
  #[serde(default)]
  pub docksmith_logging_stdio: Option<StdioLogMode>,
  #[serde(default)]
  pub docksmith_logging_pretty: Option<bool>,
}

/// Docksmith Core CLI arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "docksmith-core", about)]
pub struct CliArgs {
  /// Path to the config file.
  #[arg(long, short)]
  pub config_path: Option<PathBuf>,

  /// Override the log level.
  /// One of: trace, debug, info, warn, error.
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
  /// The logging level. default: info
  #[serde(default)]
  pub level: LogLevel,

  /// Controls logging to stdout / stderr
  #[serde(default)]
  pub stdio: StdioLogMode,

  /// Use tracing-subscriber's pretty logging output option.
  #[serde(default)]
  pub pretty: bool,
}

impl Default for LogConfig {
  fn default() -> LogConfig {
    LogConfig {
      level: Default::default(),
      stdio: Default::default(),
      pretty: false,
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Trace,
  Debug,
  #[default]
  Info,
  Warn,
  Error,
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> tracing::Level {
    match level {
      LogLevel::Trace => tracing::Level::TRACE,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Error => tracing::Level::ERROR,
    }
  }
}

impl From<tracing::Level> for LogLevel {
  fn from(level: tracing::Level) -> LogLevel {
    match level {
      tracing::Level::TRACE => LogLevel::Trace,
      tracing::Level::DEBUG => LogLevel::Debug,
      tracing::Level::INFO => LogLevel::Info,
      tracing::Level::WARN => LogLevel::Warn,
      tracing::Level::ERROR => LogLevel::Error,
    }
  }
}

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StdioLogMode {
  #[default]
  Standard,
  Json,
  None,
}
