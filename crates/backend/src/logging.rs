//! Logging setup for hosts embedding the pipeline

use std::path::Path;

use arcflow_core::config::LoggingConfig;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "arcflow.log";

/// Parse log level from config string
pub fn parse_log_level(level: &str) -> LevelFilter {
  match level.trim().to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
  // RUST_LOG overrides the configured level
  EnvFilter::builder()
    .with_default_directive(parse_log_level(&config.level).into())
    .from_env_lossy()
}

/// Install a global subscriber from configuration.
///
/// With `directory` set, logs go to a rolling file (no ANSI) and the returned
/// guard must be kept alive to flush them. Otherwise logs go to the console.
/// If a subscriber is already installed this is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
  match &config.directory {
    Some(dir) => match init_file_logging(config, dir) {
      Some(guard) => Some(guard),
      None => {
        // Fall back to console-only logging
        init_console_logging(config);
        None
      }
    },
    None => {
      init_console_logging(config);
      None
    }
  }
}

fn init_console_logging(config: &LoggingConfig) {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter(config))
    .with_target(true)
    .with_ansi(true)
    .try_init();
}

fn init_file_logging(config: &LoggingConfig, dir: &Path) -> Option<WorkerGuard> {
  if std::fs::create_dir_all(dir).is_err() {
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(dir, LOG_FILE_NAME),
    "never" => tracing_appender::rolling::never(dir, LOG_FILE_NAME),
    _ => tracing_appender::rolling::daily(dir, LOG_FILE_NAME),
  };
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter(config))
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .try_init()
    .ok()
    .map(|()| guard)
}
