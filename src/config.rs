//! Typed engine configuration: defaults, optional TOML overlay, environment
//! override. Narrowest source wins, in that order.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};

/// Environment variable holding the path to an optional TOML config file.
const CONFIG_PATH_VAR: &str = "DELAYECHO_CONFIG";
/// Prefix for environment-variable overrides, e.g. `DELAYECHO_STORE_URL`.
const ENV_PREFIX: &str = "DELAYECHO";

/// Everything the engine and its ambient stack need to boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connection string for the store (e.g. `redis://127.0.0.1:6379`).
    pub store_url: String,
    /// Max entries fetched per batch in an inspection pass.
    pub batch_size: usize,
    /// Lock TTL / processing window, in ms.
    pub processing_window_ms: u64,
    /// Delay before retrying a pass that left leftovers, in ms. Derived from
    /// `processing_window_ms` unless explicitly overridden.
    pub processing_retry_delay_ms: u64,
    /// Delay before the first reconnect attempt, in ms.
    pub reconnect_initial_delay_ms: u64,
    /// Floor used in the `3 + max(times_connected, floor)` attempt cap.
    pub reconnect_min_attempts: u32,
    /// Grace period a `health_check` ping is allowed before the component is
    /// reported unhealthy, in ms.
    pub health_check_timeout_ms: u64,
    /// Application name, used in log lines and as the service name.
    pub app_name: String,
    /// `tracing` log level filter (e.g. "info", "debug").
    pub log_level: String,
    /// Emit logs as JSON instead of human-readable text.
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let processing_window_ms = 1000;
        EngineConfig {
            store_url: "redis://127.0.0.1:6379".to_string(),
            batch_size: 30,
            processing_window_ms,
            processing_retry_delay_ms: default_retry_delay(processing_window_ms),
            reconnect_initial_delay_ms: 100,
            reconnect_min_attempts: 5,
            health_check_timeout_ms: 500,
            app_name: "delayecho".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// `PROCESSING_RETRY_DELAY = ceil(1.1 * PROCESSING_WINDOW)`.
fn default_retry_delay(processing_window_ms: u64) -> u64 {
    (processing_window_ms as f64 * 1.1).ceil() as u64
}

impl EngineConfig {
    /// Load configuration: built-in defaults, overlaid by an optional TOML
    /// file (path from `DELAYECHO_CONFIG`), overlaid by `DELAYECHO_*`
    /// environment variables. Validates before returning.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Ok(path) = std::env::var(CONFIG_PATH_VAR) {
            builder = builder.add_source(config::File::with_name(&path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("_")
                .try_parsing(true),
        );

        let raw = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to assemble configuration: {e}")))?;
        let cfg: EngineConfig = raw
            .try_deserialize()
            .map_err(|e| Error::Config(format!("failed to parse configuration: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be > 0".to_string()));
        }
        if self.processing_window_ms == 0 {
            return Err(Error::Config(
                "processing_window_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn processing_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.processing_window_ms)
    }

    pub fn processing_retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.processing_retry_delay_ms)
    }

    pub fn health_check_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.health_check_timeout_ms)
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.processing_retry_delay_ms, 1100);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.batch_size = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_processing_window_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.processing_window_ms = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }
}
