//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events; binaries and test harnesses
//! call [`init_tracing`] once to decide where those events go.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::ConfigError;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging section of the application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `"info,maplink_core=debug"`.
    /// `RUST_LOG` takes precedence when set.
    pub filter: String,
    /// Output format
    pub format: LogFormat,
    /// Include span enter/close events
    pub with_span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".to_string(), format: LogFormat::Pretty, with_span_events: false }
    }
}

impl LoggingConfig {
    /// Build the `EnvFilter`, preferring `RUST_LOG` over the configured
    /// directive
    pub fn env_filter(&self) -> Result<EnvFilter, ConfigError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.filter).map_err(|e| ConfigError::Invalid {
            message: format!("invalid log filter '{}': {}", self.filter, e),
        })
    }
}

/// Install the global tracing subscriber
///
/// Returns `Ok(false)` when a subscriber was already installed (for example
/// by a previous test), which is not treated as an error.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if the filter directive cannot be parsed.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, ConfigError> {
    let filter = config.env_filter()?;
    let span_events = if config.with_span_events {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };

    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_span_events(span_events))
            .try_init()
            .is_ok(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_current_span(true).with_span_events(span_events))
            .try_init()
            .is_ok(),
    };

    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates `LoggingConfig::default`.
    ///
    /// Assertions:
    /// - Confirms `config.filter` equals `"info"`.
    /// - Confirms `config.format` equals `LogFormat::Pretty`.
    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.filter, "info");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(!config.with_span_events);
    }

    /// Validates deserializing the logging section from TOML.
    #[test]
    fn test_logging_config_from_toml() {
        let config: LoggingConfig =
            toml::from_str("filter = \"debug\"\nformat = \"json\"\n").expect("valid TOML");
        assert_eq!(config.filter, "debug");
        assert_eq!(config.format, LogFormat::Json);
    }

    /// Validates that a second initialization is harmless.
    #[test]
    fn test_init_tracing_twice() {
        let config = LoggingConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert_eq!(init_tracing(&config).ok(), Some(false));
    }
}
