//! Configuration loading and management
//!
//! [`MapLinkConfig`] groups one section per component. Every section
//! deserializes straight into the runtime type it configures, so a loaded
//! config only needs [`MapLinkConfig::validate`] before use.

pub mod loader;

use maplink_common::error::ConfigError;
use maplink_common::observability::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::health::HealthMonitorConfig;
use crate::resilience::retry::RetryPolicy;

pub use loader::{apply_env_overrides, load, load_from_file, probe_config_paths};

/// Top-level configuration
///
/// ```toml
/// [logging]
/// filter = "info,maplink_core=debug"
/// format = "json"
///
/// [retry]
/// max_attempts = 4
/// initial_delay_ms = 250
///
/// [circuit_breaker]
/// failure_threshold = 3
/// recovery_timeout_ms = 15000
///
/// [health]
/// interval_ms = 10000
/// window_size = 20
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapLinkConfig {
    /// Tracing subscriber settings
    pub logging: LoggingConfig,
    /// Retry policy shared by every provider
    pub retry: RetryPolicy,
    /// Breaker settings applied to every provider
    pub circuit_breaker: CircuitBreakerConfig,
    /// Health monitor settings
    pub health: HealthMonitorConfig,
}

impl MapLinkConfig {
    /// Validate every section
    ///
    /// # Errors
    ///
    /// The first section error, as [`ConfigError::Invalid`] prefixed with
    /// the section name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sections: [(&str, Result<(), ConfigError>); 4] = [
            ("logging", self.logging.env_filter().map(|_| ())),
            ("retry", self.retry.validate()),
            ("circuit_breaker", self.circuit_breaker.validate()),
            ("health", self.health.validate()),
        ];

        for (section, result) in sections {
            result.map_err(|err| ConfigError::invalid(format!("[{section}] {err}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Validates that the defaults are usable as-is.
    #[test]
    fn test_default_config_is_valid() {
        let config = MapLinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.health.window_size, 10);
    }

    /// Validates partial TOML with millisecond durations.
    ///
    /// Assertions:
    /// - Confirms provided fields are applied.
    /// - Confirms omitted fields and sections keep their defaults.
    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: MapLinkConfig = toml::from_str(
            r#"
            [retry]
            max_attempts = 5
            max_delay_ms = 8000

            [circuit_breaker]
            recovery_timeout_ms = 1500
            "#,
        )
        .expect("valid toml");

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_delay, Duration::from_secs(8));
        assert_eq!(config.retry.initial_delay, RetryPolicy::default().initial_delay);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_millis(1500));
        assert_eq!(config.health, HealthMonitorConfig::default());
        assert!(config.validate().is_ok());
    }

    /// Validates that section errors name their section.
    #[test]
    fn test_validate_names_section() {
        let mut config = MapLinkConfig::default();
        config.health.window_size = 0;

        let err = config.validate().expect_err("window_size 0 is invalid");
        assert!(err.to_string().contains("[health]"), "unexpected message: {err}");
    }
}
