//! Integration tests for `maplink_common::error`.
//!
//! These suites validate classification and module error delegation so the
//! resilience layer receives consistent failure semantics.

use std::time::Duration;

use maplink_common::error::{CommonError, ConfigError, ErrorClassification, ErrorSeverity};
use thiserror::Error;

/// Validates that `CommonError` classification surfaces the expected
/// retryable, severity, and criticality combinations for each variant.
/// None of the shared variants is critical.
#[test]
fn classification_matrix_matches_expected_contract() {
    let cases = vec![
        (CommonError::rate_limit(None), true, ErrorSeverity::Warning, false),
        (
            CommonError::timeout("geocode", Duration::from_millis(800)),
            true,
            ErrorSeverity::Warning,
            false,
        ),
        (CommonError::backend("routing", "503", true), true, ErrorSeverity::Error, false),
        (CommonError::validation("bbox", "inverted"), false, ErrorSeverity::Error, false),
        (CommonError::unauthorized("tiles.read"), false, ErrorSeverity::Warning, false),
        (CommonError::task_cancelled("route-1"), false, ErrorSeverity::Info, false),
    ];

    for (err, retryable, severity, critical) in cases {
        assert_eq!(err.is_retryable(), retryable, "retryable mismatch for {err}");
        assert_eq!(err.severity(), severity, "severity mismatch for {err}");
        assert_eq!(err.is_critical(), critical, "critical mismatch for {err}");
    }
}

#[derive(Debug, Error)]
enum TileError {
    #[error("Tile {0} outside coverage")]
    OutOfCoverage(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl ErrorClassification for TileError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::OutOfCoverage(_) => false,
            Self::Common(e) => e.is_retryable(),
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::OutOfCoverage(_) => ErrorSeverity::Info,
            Self::Common(e) => e.severity(),
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_critical())
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Common(e) => e.retry_after(),
            Self::OutOfCoverage(_) => None,
        }
    }
}

fn fetch_tile(throttled: bool) -> Result<(), TileError> {
    let upstream: Result<(), CommonError> = if throttled {
        Err(CommonError::rate_limit(Some(Duration::from_secs(2))))
    } else {
        Ok(())
    };
    upstream?;
    Err(TileError::OutOfCoverage("14/8192/5461".to_string()))
}

/// Validates that module errors composed over `CommonError` delegate their
/// classification.
#[test]
fn module_errors_delegate_classification() {
    let throttled = fetch_tile(true).unwrap_err();
    assert!(throttled.is_retryable());
    assert_eq!(throttled.retry_after(), Some(Duration::from_secs(2)));

    let coverage = fetch_tile(false).unwrap_err();
    assert!(!coverage.is_retryable());
    assert_eq!(coverage.severity(), ErrorSeverity::Info);
    assert_eq!(coverage.to_string(), "Tile 14/8192/5461 outside coverage");
}

/// Validates `ConfigError` display formats.
#[test]
fn config_error_messages_are_actionable() {
    let err = ConfigError::Parse { format: "TOML".to_string(), message: "expected `=`".to_string() };
    assert_eq!(err.to_string(), "Invalid TOML format: expected `=`");

    let err = ConfigError::NotFound { path: "/etc/maplink.toml".to_string() };
    assert_eq!(err.to_string(), "Config file not found: /etc/maplink.toml");
}
