use std::sync::OnceLock;

use clap::Parser;
use colored::Colorize;
use docksmith_client::entities::config::{
  CliArgs, CoreConfig, Env, LogLevel,
};

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse docksmith environment");
    let args = CliArgs::parse();
    let config_path = args
      .config_path
      .clone()
      .or(env.docksmith_config_path.clone());

    let config = match &config_path {
      Some(path) if path.is_file() => {
        let contents = std::fs::read_to_string(path)
          .expect("failed to read config file");
        toml::from_str(&contents)
          .expect("failed to parse config file")
      }
      Some(path) => {
        println!(
          "{}: config file {path:?} not found, using defaults",
          "WARN".yellow(),
        );
        CoreConfig::default()
      }
      None => {
        println!(
          "{}: no config path given, using defaults",
          "INFO".green(),
        );
        CoreConfig::default()
      }
    };

    apply_env(config, env, args)
  })
}

/// Environment variables and CLI flags override file values.
fn apply_env(
  mut config: CoreConfig,
  env: Env,
  args: CliArgs,
) -> CoreConfig {
  if let Some(path) = env.docksmith_database_path {
    config.database_path = path;
  }
  if let Some(interval) = env.docksmith_poll_interval_secs {
    config.poll_interval_secs = interval;
  }
  if let Some(timeout) = env.docksmith_health_check_timeout_secs {
    config.health_check_timeout_secs = timeout;
  }
  if let Some(timeout) = env.docksmith_precheck_timeout_secs {
    config.precheck_timeout_secs = timeout;
  }
  if let Some(timeout) = env.docksmith_stage_timeout_secs {
    config.stage_timeout_secs = timeout;
  }
  if let Some(ttl) = env.docksmith_version_cache_ttl_secs {
    config.version_cache_ttl_secs = ttl;
  }
  if let Some(retries) = env.docksmith_registry_max_retries {
    config.registry_max_retries = retries;
  }
  if let Some(enabled) = env.docksmith_prune_enabled {
    config.prune_enabled = enabled;
  }
  if let Some(interval) = env.docksmith_prune_interval_secs {
    config.prune_interval_secs = interval;
  }
  if let Some(level) = env.docksmith_logging_level {
    config.logging.level = level;
  }
  if let Some(stdio) = env.docksmith_logging_stdio {
    config.logging.stdio = stdio;
  }
  if let Some(pretty) = env.docksmith_logging_pretty {
    config.logging.pretty = pretty;
  }
  if let Some(level) = args.log_level {
    config.logging.level = LogLevel::from(level);
  }
  config
}
