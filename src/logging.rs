//! One-time `tracing` subscriber setup.

use crate::config::EngineConfig;
use crate::errors::{Error, Result};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging knobs, usually derived from [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json: bool,
    pub app_name: String,
}

impl From<&EngineConfig> for LoggingConfig {
    fn from(cfg: &EngineConfig) -> Self {
        LoggingConfig {
            level: parse_log_level(&cfg.log_level).unwrap_or(Level::INFO),
            json: cfg.log_json,
            app_name: cfg.app_name.clone(),
        }
    }
}

/// Install the global `tracing` subscriber. Must be called exactly once,
/// before any component is constructed.
///
/// Logs go to stderr, not stdout: stdout is the egress channel for emission
/// lines (§4.4), and a log line interleaved with an emission line would
/// break the "single line per message" contract.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if config.json {
        subscriber
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to install logger: {e}")))?;
    } else {
        subscriber
            .try_init()
            .map_err(|e| Error::Config(format!("failed to install logger: {e}")))?;
    }

    log_welcome(&config.app_name, env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Parse a log level from a string, the way `EngineConfig::log_level` stores it.
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::Config(format!("invalid log level: {level}")))
}

fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("starting {app_name} v{version}");
}
