//! Client Configuration
//!
//! Settings can come from an optional file plus `VEHICLE_PROPS__*`
//! environment variables, e.g. `VEHICLE_PROPS__CONNECTION__GRACE_PERIOD_MS`.

use car_connection::ConnectionConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "VEHICLE_PROPS";

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration of the vehicle property client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyConfig {
    /// Shared connection and reconnect settings
    pub connection: ConnectionConfig,
    /// Capacity of per-stream event buffers
    pub event_buffer: usize,
    /// Timeout used by `get_value_with_default_timeout` (ms)
    pub query_timeout_ms: u64,
    /// Update rate used when callers have no preference (Hz)
    pub default_rate_hz: f32,
}

impl Default for PropertyConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            event_buffer: 64,
            query_timeout_ms: 5_000,
            default_rate_hz: 1.0,
        }
    }
}

impl PropertyConfig {
    /// Load from an optional file and the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let settings = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()
    }

    /// Parse inline TOML
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigLoadError> {
        let settings = Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()?;
        let config: Self = settings.try_deserialize()?;
        config.validate()
    }

    /// Default point query timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    fn validate(self) -> Result<Self, ConfigLoadError> {
        if self.event_buffer == 0 {
            return Err(ConfigLoadError::Invalid(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.default_rate_hz.is_nan() || self.default_rate_hz < 0.0 {
            return Err(ConfigLoadError::Invalid(format!(
                "default_rate_hz must be non-negative, got {}",
                self.default_rate_hz
            )));
        }
        Ok(self)
    }
}
