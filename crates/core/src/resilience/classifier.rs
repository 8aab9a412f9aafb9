//! Failure classification
//!
//! Every failure that leaves a provider call or probe is mapped onto one of
//! eight [`ErrorCategory`] values. The category decides whether a retry is
//! worthwhile; the rest of the engine never inspects raw failures.
//!
//! Rules are evaluated in order and the first match wins:
//!
//! | # | Signal                                   | Category         | Retryable |
//! |---|------------------------------------------|------------------|-----------|
//! | 1 | connection refused/reset, DNS, abort     | `NETWORK`        | yes       |
//! | 2 | elapsed time, abort due to timeout       | `TIMEOUT`        | yes       |
//! | 3 | HTTP 429, explicit rate-limit signal     | `RATE_LIMIT`     | yes       |
//! | 4 | HTTP 500/502/503/504                     | `API_ERROR`      | yes       |
//! | 5 | HTTP 401/403                             | `AUTHENTICATION` | no        |
//! | 6 | HTTP 400/422, explicit validation signal | `VALIDATION`     | no        |
//! | 7 | rendering / WebGL / canvas failures      | `RENDERING`      | yes       |
//! | 8 | anything else                            | `UNKNOWN`        | yes, with caution |

use std::fmt;
use std::time::Duration;

use maplink_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use maplink_common::utils::serde::duration_millis;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw failure returned by a provider operation or health probe
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderFailure {
    /// Connection could not be established or was dropped
    #[error("network error: {message}")]
    Network {
        /// Transport-level description
        message: String,
    },

    /// Request was aborted before completion
    #[error("request aborted: {reason}")]
    Aborted {
        /// Why the request was aborted
        reason: String,
    },

    /// Request exceeded its deadline
    #[error("{}", timeout_message(.after))]
    Timeout {
        /// Deadline that elapsed, when known
        after: Option<Duration>,
    },

    /// Provider answered with a non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Response status code
        status: u16,
        /// Response body or reason phrase
        message: String,
        /// `Retry-After` hint, when present
        retry_after: Option<Duration>,
    },

    /// Provider signalled throttling without an HTTP status
    #[error("rate limited")]
    RateLimited {
        /// Earliest time a retry may succeed
        retry_after: Option<Duration>,
    },

    /// Request was rejected as malformed
    #[error("validation failed: {message}")]
    Validation {
        /// What was rejected
        message: String,
    },

    /// Map rendering layer failed (style, WebGL context, canvas)
    #[error("rendering failed: {message}")]
    Rendering {
        /// Renderer description
        message: String,
    },

    /// Untyped failure, classified from its message
    #[error("{message}")]
    Other {
        /// Free-form description
        message: String,
    },
}

fn timeout_message(after: &Option<Duration>) -> String {
    match after {
        Some(after) => format!("timed out after {after:?}"),
        None => "timed out".to_string(),
    }
}

impl ProviderFailure {
    /// Network failure
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Aborted request
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted { reason: reason.into() }
    }

    /// Timeout after a known deadline
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after: Some(after) }
    }

    /// HTTP status failure without a retry hint
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http { status, message: message.into(), retry_after: None }
    }

    /// Validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Rendering failure
    pub fn rendering(message: impl Into<String>) -> Self {
        Self::Rendering { message: message.into() }
    }

    /// Untyped failure
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other { message: message.into() }
    }
}

impl From<CommonError> for ProviderFailure {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Timeout { duration, .. } => Self::Timeout { after: Some(duration) },
            CommonError::RateLimitExceeded { retry_after } => Self::RateLimited { retry_after },
            CommonError::Validation { field, message } => {
                Self::Validation { message: format!("{field}: {message}") }
            }
            CommonError::Unauthorized { operation } => Self::Http {
                status: 401,
                message: format!("unauthorized: {operation}"),
                retry_after: None,
            },
            CommonError::TaskCancelled { task_id, reason } => Self::Aborted {
                reason: match reason {
                    Some(reason) => format!("{task_id}: {reason}"),
                    None => format!("task {task_id}"),
                },
            },
            backend @ CommonError::Backend { .. } => Self::Other { message: backend.to_string() },
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for ProviderFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout { after: None };
        }
        if let Some(status) = err.status() {
            return Self::Http { status: status.as_u16(), message: err.to_string(), retry_after: None };
        }
        if err.is_connect() || err.is_request() {
            return Self::Network { message: err.to_string() };
        }
        Self::Other { message: err.to_string() }
    }
}

#[cfg(feature = "http")]
impl ProviderFailure {
    /// Turn a non-2xx response into an [`ProviderFailure::Http`]
    ///
    /// A `Retry-After` header given in seconds becomes the retry hint.
    ///
    /// # Errors
    ///
    /// Returns the failure when the status is not a success.
    pub async fn check_response(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderFailure> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let message = match response.text().await {
            Ok(body) if !body.is_empty() => body,
            _ => status.canonical_reason().unwrap_or("unknown status").to_string(),
        };

        Err(Self::Http { status: status.as_u16(), message, retry_after })
    }
}

/// Failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Connection, DNS or abort
    Network,
    /// Deadline elapsed
    Timeout,
    /// Provider throttling
    RateLimit,
    /// Provider-side 5xx
    ApiError,
    /// Credentials rejected
    Authentication,
    /// Request rejected as malformed
    Validation,
    /// Map rendering failure
    Rendering,
    /// Nothing matched
    Unknown,
}

impl ErrorCategory {
    /// Whether failures of this category are worth retrying
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Authentication | Self::Validation)
    }

    /// Stable upper-case name (`"RATE_LIMIT"`)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::ApiError => "API_ERROR",
            Self::Authentication => "AUTHENTICATION",
            Self::Validation => "VALIDATION",
            Self::Rendering => "RENDERING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure
///
/// Created once per failure and never mutated. `caution` is set only for
/// [`ErrorCategory::Unknown`], which is retried on a reduced budget when the
/// retry policy configures one.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{category}: {raw_message}")]
pub struct CategorizedError {
    /// Original failure text
    pub raw_message: String,
    /// Assigned category
    pub category: ErrorCategory,
    /// Whether a retry may succeed
    pub retryable: bool,
    /// Retry only on the reduced caution budget
    pub caution: bool,
    /// HTTP status, when the failure carried one
    pub status: Option<u16>,
    /// Provider retry hint, when the failure carried one
    #[serde(default, with = "duration_millis::option")]
    pub retry_after: Option<Duration>,
}

impl CategorizedError {
    /// Build a categorized error with the category's default retryability
    pub fn new(category: ErrorCategory, raw_message: impl Into<String>) -> Self {
        Self {
            raw_message: raw_message.into(),
            category,
            retryable: category.is_retryable(),
            caution: category == ErrorCategory::Unknown,
            status: None,
            retry_after: None,
        }
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl ErrorClassification for CategorizedError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn severity(&self) -> ErrorSeverity {
        match self.category {
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::RateLimit
            | ErrorCategory::ApiError => ErrorSeverity::Warning,
            ErrorCategory::Authentication
            | ErrorCategory::Validation
            | ErrorCategory::Rendering
            | ErrorCategory::Unknown => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Classify a raw failure
///
/// Pure function; the same failure always yields the same result.
pub fn classify(failure: &ProviderFailure) -> CategorizedError {
    let raw = failure.to_string();
    match failure {
        ProviderFailure::Network { .. } => CategorizedError::new(ErrorCategory::Network, raw),
        ProviderFailure::Aborted { reason } => {
            if mentions_timeout(&reason.to_ascii_lowercase()) {
                CategorizedError::new(ErrorCategory::Timeout, raw)
            } else {
                CategorizedError::new(ErrorCategory::Network, raw)
            }
        }
        ProviderFailure::Timeout { .. } => CategorizedError::new(ErrorCategory::Timeout, raw),
        ProviderFailure::Http { status, retry_after, .. } => {
            CategorizedError::new(category_for_status(*status), raw)
                .with_status(*status)
                .with_retry_after(*retry_after)
        }
        ProviderFailure::RateLimited { retry_after } => {
            CategorizedError::new(ErrorCategory::RateLimit, raw).with_retry_after(*retry_after)
        }
        ProviderFailure::Validation { .. } => CategorizedError::new(ErrorCategory::Validation, raw),
        ProviderFailure::Rendering { .. } => CategorizedError::new(ErrorCategory::Rendering, raw),
        ProviderFailure::Other { message } => classify_message(message),
    }
}

/// Classify a free-form failure message
///
/// Applies the same rule order as [`classify`] using keyword heuristics.
/// A bare three-digit token in the 4xx/5xx range is read as an HTTP status.
pub fn classify_message(message: &str) -> CategorizedError {
    let lower = message.to_ascii_lowercase();
    let status = status_token(&lower);
    let category = category_for_message(&lower, status);

    let error = CategorizedError::new(category, message);
    match status {
        Some(code) if category == category_for_status(code) => error.with_status(code),
        _ => error,
    }
}

fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        429 => ErrorCategory::RateLimit,
        500 | 502 | 503 | 504 => ErrorCategory::ApiError,
        401 | 403 => ErrorCategory::Authentication,
        400 | 422 => ErrorCategory::Validation,
        _ => ErrorCategory::Unknown,
    }
}

const NETWORK_MARKERS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "enotfound",
    "eai_again",
    "connection refused",
    "connection reset",
    "connection closed",
    "network",
    "dns",
    "failed to fetch",
    "unreachable",
];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "etimedout", "deadline exceeded"];

const RATE_LIMIT_MARKERS: &[&str] =
    &["too many requests", "rate limit", "rate-limit", "ratelimit", "quota exceeded", "throttl"];

const API_ERROR_MARKERS: &[&str] =
    &["internal server error", "bad gateway", "service unavailable", "gateway timeout"];

const AUTH_MARKERS: &[&str] =
    &["unauthorized", "unauthorised", "forbidden", "invalid api key", "invalid token", "access denied"];

const VALIDATION_MARKERS: &[&str] =
    &["bad request", "unprocessable", "validation", "invalid parameter", "invalid coordinates"];

const RENDERING_MARKERS: &[&str] = &["webgl", "render", "canvas", "style load", "shader", "glyph"];

fn mentions_timeout(lower: &str) -> bool {
    contains_any(lower, TIMEOUT_MARKERS)
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn category_for_message(lower: &str, status: Option<u16>) -> ErrorCategory {
    let status_category = status.map(category_for_status);
    let status_is = |category: ErrorCategory| status_category == Some(category);

    // An upstream 5xx ("504 Gateway Timeout") is an API error even though
    // its reason phrase mentions a timeout.
    if contains_any(lower, NETWORK_MARKERS) {
        ErrorCategory::Network
    } else if status_is(ErrorCategory::ApiError) || contains_any(lower, API_ERROR_MARKERS) {
        ErrorCategory::ApiError
    } else if mentions_timeout(lower) {
        ErrorCategory::Timeout
    } else if lower.contains("abort") {
        ErrorCategory::Network
    } else if status_is(ErrorCategory::RateLimit) || contains_any(lower, RATE_LIMIT_MARKERS) {
        ErrorCategory::RateLimit
    } else if status_is(ErrorCategory::Authentication) || contains_any(lower, AUTH_MARKERS) {
        ErrorCategory::Authentication
    } else if status_is(ErrorCategory::Validation) || contains_any(lower, VALIDATION_MARKERS) {
        ErrorCategory::Validation
    } else if contains_any(lower, RENDERING_MARKERS) {
        ErrorCategory::Rendering
    } else {
        ErrorCategory::Unknown
    }
}

fn status_token(lower: &str) -> Option<u16> {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|token| token.parse::<u16>().ok())
        .find(|code| (400..600).contains(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates the rule table for typed failures.
    ///
    /// Assertions:
    /// - Confirms each typed failure maps to its category.
    /// - Confirms retryability follows the category.
    #[test]
    fn test_classify_typed_failures() {
        let cases = vec![
            (ProviderFailure::network("connection refused"), ErrorCategory::Network, true),
            (ProviderFailure::aborted("user navigated away"), ErrorCategory::Network, true),
            (ProviderFailure::aborted("signal timeout"), ErrorCategory::Timeout, true),
            (ProviderFailure::timeout(Duration::from_secs(5)), ErrorCategory::Timeout, true),
            (ProviderFailure::http(429, "slow down"), ErrorCategory::RateLimit, true),
            (ProviderFailure::http(500, "boom"), ErrorCategory::ApiError, true),
            (ProviderFailure::http(502, "bad gateway"), ErrorCategory::ApiError, true),
            (ProviderFailure::http(503, "maintenance"), ErrorCategory::ApiError, true),
            (ProviderFailure::http(504, "upstream"), ErrorCategory::ApiError, true),
            (ProviderFailure::http(401, "missing key"), ErrorCategory::Authentication, false),
            (ProviderFailure::http(403, "plan limit"), ErrorCategory::Authentication, false),
            (ProviderFailure::http(400, "bbox"), ErrorCategory::Validation, false),
            (ProviderFailure::http(422, "zoom"), ErrorCategory::Validation, false),
            (ProviderFailure::http(418, "teapot"), ErrorCategory::Unknown, true),
            (ProviderFailure::validation("lat out of range"), ErrorCategory::Validation, false),
            (ProviderFailure::rendering("context lost"), ErrorCategory::Rendering, true),
        ];

        for (failure, category, retryable) in cases {
            let err = classify(&failure);
            assert_eq!(err.category, category, "category mismatch for {failure}");
            assert_eq!(err.retryable, retryable, "retryable mismatch for {failure}");
            assert_eq!(err.caution, category == ErrorCategory::Unknown);
        }
    }

    /// Validates that HTTP failures keep their status and retry hint.
    #[test]
    fn test_classify_http_keeps_status_and_hint() {
        let failure = ProviderFailure::Http {
            status: 429,
            message: "Too Many Requests".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        };
        let err = classify(&failure);

        assert_eq!(err.status, Some(429));
        assert_eq!(err.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(ErrorClassification::retry_after(&err), Some(Duration::from_secs(3)));
        assert_eq!(err.raw_message, "HTTP 429: Too Many Requests");
    }

    /// Validates keyword heuristics for untyped messages.
    ///
    /// Assertions:
    /// - Confirms transport markers win over status tokens.
    /// - Confirms unmatched messages fall through to `UNKNOWN` with caution.
    #[test]
    fn test_classify_message_heuristics() {
        let cases = vec![
            ("ECONNREFUSED 127.0.0.1:443", ErrorCategory::Network),
            ("getaddrinfo ENOTFOUND tiles.example.com", ErrorCategory::Network),
            ("The operation was aborted", ErrorCategory::Network),
            ("request timed out", ErrorCategory::Timeout),
            ("Too Many Requests", ErrorCategory::RateLimit),
            ("upstream returned 503", ErrorCategory::ApiError),
            ("Service Unavailable", ErrorCategory::ApiError),
            ("401 Unauthorized", ErrorCategory::Authentication),
            ("Invalid API key", ErrorCategory::Authentication),
            ("422 unprocessable entity", ErrorCategory::Validation),
            ("WebGL context lost", ErrorCategory::Rendering),
            ("took 500ms then failed", ErrorCategory::Unknown),
            ("something odd happened", ErrorCategory::Unknown),
        ];

        for (message, category) in cases {
            assert_eq!(classify_message(message).category, category, "for {message:?}");
        }

        let unknown = classify(&ProviderFailure::other("weird"));
        assert!(unknown.caution);
        assert!(unknown.retryable);
    }

    /// Validates that a status parsed from a message is recorded.
    #[test]
    fn test_classify_message_extracts_status() {
        let err = classify_message("upstream returned 503");
        assert_eq!(err.status, Some(503));

        let err = classify_message("connection reset after 503");
        assert_eq!(err.category, ErrorCategory::Network);
        assert_eq!(err.status, None);
    }

    /// Validates that gateway failures stay API errors.
    ///
    /// Assertions:
    /// - Confirms "504 Gateway Timeout" is `API_ERROR` with status 504, not
    ///   `TIMEOUT`.
    /// - Confirms "502 Bad Gateway" is `API_ERROR` with status 502.
    /// - Confirms a bare "gateway timeout" without a status is `API_ERROR`.
    #[test]
    fn test_classify_message_gateway_errors() {
        let err = classify_message("504 Gateway Timeout");
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert_eq!(err.status, Some(504));
        assert!(err.retryable);

        let err = classify_message("502 Bad Gateway");
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert_eq!(err.status, Some(502));

        let err = classify_message("upstream gateway timeout");
        assert_eq!(err.category, ErrorCategory::ApiError);
        assert_eq!(err.status, None);

        assert_eq!(classify_message("read timed out").category, ErrorCategory::Timeout);
    }

    /// Validates `CommonError` conversion into raw failures.
    #[test]
    fn test_common_error_conversion() {
        let timeout: ProviderFailure =
            CommonError::timeout("geocode", Duration::from_millis(250)).into();
        assert_eq!(classify(&timeout).category, ErrorCategory::Timeout);

        let limited: ProviderFailure =
            CommonError::rate_limit(Some(Duration::from_secs(1))).into();
        let err = classify(&limited);
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(1)));

        let unauthorized: ProviderFailure = CommonError::unauthorized("tiles").into();
        assert_eq!(classify(&unauthorized).category, ErrorCategory::Authentication);

        let backend: ProviderFailure = CommonError::backend("routing", "bad gateway", true).into();
        assert_eq!(classify(&backend).category, ErrorCategory::ApiError);
    }

    /// Validates severity for transient versus permanent categories.
    #[test]
    fn test_categorized_error_severity() {
        assert_eq!(
            classify(&ProviderFailure::network("dns")).severity(),
            ErrorSeverity::Warning
        );
        assert_eq!(classify(&ProviderFailure::http(401, "no")).severity(), ErrorSeverity::Error);
        assert!(!classify(&ProviderFailure::http(401, "no")).is_critical());
    }

    /// Validates the JSON shape of a categorized error.
    #[test]
    fn test_categorized_error_json_shape() {
        let err = classify(&ProviderFailure::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        });
        let json = serde_json::to_value(&err).expect("serialize");

        assert_eq!(json["category"], "RATE_LIMIT");
        assert_eq!(json["retry_after"], 1500);
        assert_eq!(json["caution"], false);
    }
}
