//! Common error types and classification for MapLink crates
//!
//! This module provides the error vocabulary shared by every MapLink crate:
//!
//! 1. **`CommonError`**: failure patterns that show up around map provider
//!    calls (timeouts, rate limiting, backend failures, auth, validation,
//!    cancellation). `maplink-core` turns them into provider failures.
//!
//! 2. **`ErrorClassification` trait**: a standard interface for classifying
//!    errors by retryability, severity and criticality. The resilience layer
//!    in `maplink-core` makes every retry and trip decision through it.
//!
//! 3. **`ErrorSeverity` enum**: a unified severity level for logging.
//!
//! 4. **`ConfigError`**: raised by configuration builders and loaders.
//!
//! ## Composition
//!
//! Module-specific errors should compose with `CommonError` rather than
//! duplicating its patterns:
//!
//! ```rust,ignore
//! #[derive(Debug, Error)]
//! pub enum TileError {
//!     #[error("Tile {0} is outside the provider's coverage")]
//!     OutOfCoverage(String),
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Common error variants that appear across multiple modules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Rate limiting errors
    RateLimitExceeded { retry_after: Option<Duration> },

    /// Timeout errors
    Timeout { operation: String, duration: Duration },

    /// Network or backend connectivity errors
    Backend { service: String, message: String, is_retryable: bool },

    /// Validation errors
    Validation { field: String, message: String },

    /// Permission or authorization errors
    Unauthorized { operation: String },

    /// Task cancellation (async)
    TaskCancelled { task_id: String, reason: Option<String> },
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitExceeded { retry_after: Some(retry) } => {
                write!(f, "Rate limit exceeded (retry in {retry:?})")
            }
            Self::RateLimitExceeded { retry_after: None } => write!(f, "Rate limit exceeded"),
            Self::Timeout { operation, duration } => {
                write!(f, "Operation '{operation}' timed out after {duration:?}")
            }
            Self::Backend { service, message, .. } => {
                write!(f, "Backend error from '{service}': {message}")
            }
            Self::Validation { field, message } => {
                write!(f, "Validation error for field '{field}': {message}")
            }
            Self::Unauthorized { operation } => write!(f, "Unauthorized to perform '{operation}'"),
            Self::TaskCancelled { task_id, reason: Some(reason) } => {
                write!(f, "Task '{task_id}' cancelled: {reason}")
            }
            Self::TaskCancelled { task_id, reason: None } => write!(f, "Task '{task_id}' cancelled"),
        }
    }
}

impl std::error::Error for CommonError {}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimitExceeded { .. } | Self::Timeout { .. } => true,
            Self::Backend { is_retryable, .. } => *is_retryable,
            Self::Validation { .. } | Self::Unauthorized { .. } | Self::TaskCancelled { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::RateLimitExceeded { .. } | Self::Timeout { .. } | Self::Unauthorized { .. } => {
                ErrorSeverity::Warning
            }
            Self::Backend { .. } | Self::Validation { .. } => ErrorSeverity::Error,
            Self::TaskCancelled { .. } => ErrorSeverity::Info,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl CommonError {
    /// Create a rate limit error
    pub fn rate_limit(retry_after: Option<Duration>) -> Self {
        Self::RateLimitExceeded { retry_after }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>, M: Into<String>>(
        service: S,
        message: M,
        is_retryable: bool,
    ) -> Self {
        Self::Backend { service: service.into(), message: message.into(), is_retryable }
    }

    /// Create a validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    /// Create an unauthorized error
    pub fn unauthorized<O: Into<String>>(operation: O) -> Self {
        Self::Unauthorized { operation: operation.into() }
    }

    /// Create a task cancelled error
    pub fn task_cancelled<S: Into<String>>(task_id: S) -> Self {
        Self::TaskCancelled { task_id: task_id.into(), reason: None }
    }

    /// Create a task cancelled error with a reason
    pub fn task_cancelled_with_reason<S: Into<String>, R: Into<String>>(
        task_id: S,
        reason: R,
    ) -> Self {
        Self::TaskCancelled { task_id: task_id.into(), reason: Some(reason.into()) }
    }
}

/// Error classification trait for consistent error handling across modules
///
/// Retry executors and circuit breakers only look at errors through this
/// trait, so any error type that implements it can flow through the
/// resilience layer.
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again, such as network resets, timeouts, rate limiting or 5xx
    /// responses.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable (e.g. from a
    /// `Retry-After` header)
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for logging and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Errors raised while building or loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value failed validation
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// A config file could not be found
    #[error("Config file not found: {path}")]
    NotFound { path: String },

    /// A config file could not be parsed
    #[error("Invalid {format} format: {message}")]
    Parse { format: String, message: String },

    /// An environment override held an unusable value
    #[error("Invalid value for {variable}: {message}")]
    Env { variable: String, message: String },

    /// The config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    /// Create a validation failure
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid { message: message.into() }
    }
}
