//! Retry with exponential backoff
//!
//! [`RetryExecutor`] runs one provider call up to `max_attempts` times.
//! Failures are classified after every attempt: non-retryable categories stop
//! immediately, retryable ones sleep for
//! `min(max_delay, initial_delay * 2^(attempt - 1))` (optionally jittered)
//! before the next attempt. Attempts are strictly sequential.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use maplink_common::error::{ConfigError, ErrorClassification, ErrorSeverity};
use maplink_common::utils::serde::duration_millis;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::classifier::{classify, CategorizedError, ErrorCategory, ProviderFailure};

/// Lower bound of the multiplicative jitter factor
pub const JITTER_MIN_FACTOR: f64 = 0.5;
/// Upper bound (exclusive) of the multiplicative jitter factor
pub const JITTER_MAX_FACTOR: f64 = 1.5;

/// Retry policy
///
/// Read-only for the duration of one `execute` call. Build through
/// [`RetryPolicy::builder`] to get validation, or deserialize from the
/// `[retry]` config section and call [`RetryPolicy::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(rename = "initial_delay_ms", with = "duration_millis")]
    pub initial_delay: Duration,
    /// Cap on any single delay
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    /// Multiply each delay by a random factor in `[0.5, 1.5)`
    pub jitter_enabled: bool,
    /// Deadline for a single attempt, `Duration::ZERO` disables it
    #[serde(rename = "per_attempt_timeout_ms", with = "duration_millis")]
    pub per_attempt_timeout: Duration,
    /// Attempt budget for `UNKNOWN` failures, `None` uses `max_attempts`
    pub caution_max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter_enabled: true,
            per_attempt_timeout: Duration::from_secs(10),
            caution_max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder starting from the defaults
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when an invariant is violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }

        if self.max_delay < self.initial_delay {
            return Err(ConfigError::invalid(format!(
                "max_delay ({:?}) must not be less than initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }

        if self.caution_max_attempts == Some(0) {
            return Err(ConfigError::invalid("caution_max_attempts must be at least 1"));
        }

        Ok(())
    }

    /// Deterministic backoff after `attempt` (1-based) failed
    ///
    /// `min(max_delay, initial_delay * 2^(attempt - 1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay to sleep after `attempt` failed with `error`
    ///
    /// Applies jitter when enabled; a rate-limit hint raises the delay to at
    /// least the hint, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, error: &CategorizedError) -> Duration {
        let mut delay = self.base_delay(attempt);
        if self.jitter_enabled {
            delay = apply_jitter(delay);
        }

        if error.category == ErrorCategory::RateLimit {
            if let Some(hint) = error.retry_after {
                delay = delay.max(hint.min(self.max_delay));
            }
        }

        delay
    }

    /// Attempt budget that applies once `error` has been seen
    pub fn budget_for(&self, error: &CategorizedError) -> u32 {
        match self.caution_max_attempts {
            Some(caution) if error.caution => caution.min(self.max_attempts),
            _ => self.max_attempts,
        }
    }

    fn attempt_timeout(&self) -> Option<Duration> {
        (!self.per_attempt_timeout.is_zero()).then_some(self.per_attempt_timeout)
    }
}

/// Multiply `delay` by a factor drawn uniformly from `[0.5, 1.5)`
pub fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(JITTER_MIN_FACTOR..JITTER_MAX_FACTOR);
    delay.mul_f64(factor)
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Start from [`RetryPolicy::default`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts including the first
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Delay after the first failure
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Cap on any single delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Enable or disable jitter
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter_enabled = enabled;
        self
    }

    /// Disable jitter
    pub fn no_jitter(self) -> Self {
        self.jitter(false)
    }

    /// Deadline for one attempt, `Duration::ZERO` disables it
    pub fn per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.policy.per_attempt_timeout = timeout;
        self
    }

    /// Reduced budget for `UNKNOWN` failures
    pub fn caution_max_attempts(mut self, attempts: u32) -> Self {
        self.policy.caution_max_attempts = Some(attempts);
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the policy is inconsistent.
    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// One attempt within a retry sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt_number: u32,
    /// Sleep that preceded this attempt
    #[serde(rename = "delay_before_attempt_ms", with = "duration_millis")]
    pub delay_before_attempt: Duration,
    /// Classified failure, `None` when the attempt succeeded
    pub error: Option<CategorizedError>,
}

/// Every attempt of an exhausted retry sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedRetryError {
    /// Attempt history in order
    pub attempts: Vec<AttemptRecord>,
}

impl AggregatedRetryError {
    /// Classified failures in attempt order
    pub fn errors(&self) -> impl Iterator<Item = &CategorizedError> {
        self.attempts.iter().filter_map(|record| record.error.as_ref())
    }

    /// Failure of the final attempt
    pub fn last_error(&self) -> Option<&CategorizedError> {
        self.attempts.last().and_then(|record| record.error.as_ref())
    }
}

impl fmt::Display for AggregatedRetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} attempts failed", self.attempts.len())?;
        if let Some(last) = self.last_error() {
            write!(f, "; last error: {last}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedRetryError {}

/// Retry sequence failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    /// A non-retryable failure stopped the sequence
    #[error("non-retryable failure on attempt {}: {error}", .attempts.len())]
    NonRetryable {
        /// The failure that stopped the sequence
        error: CategorizedError,
        /// Attempt history including the failing attempt
        attempts: Vec<AttemptRecord>,
    },

    /// Every attempt in the budget failed
    #[error(transparent)]
    Exhausted(AggregatedRetryError),

    /// The caller cancelled the sequence
    #[error("retry cancelled after {} attempts", .attempts.len())]
    Cancelled {
        /// Attempts completed before cancellation
        attempts: Vec<AttemptRecord>,
    },
}

impl RetryError {
    /// Attempt history
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::NonRetryable { attempts, .. } | Self::Cancelled { attempts } => attempts,
            Self::Exhausted(aggregated) => &aggregated.attempts,
        }
    }

    /// Most recent classified failure
    pub fn last_error(&self) -> Option<&CategorizedError> {
        match self {
            Self::NonRetryable { error, .. } => Some(error),
            Self::Exhausted(aggregated) => aggregated.last_error(),
            Self::Cancelled { attempts } => attempts.iter().rev().find_map(|r| r.error.as_ref()),
        }
    }

    /// Whether the caller cancelled the sequence
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl ErrorClassification for RetryError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::NonRetryable { .. } | Self::Cancelled { .. } => false,
            Self::Exhausted(aggregated) => aggregated.last_error().is_some_and(|e| e.retryable),
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled { .. } => ErrorSeverity::Info,
            _ => self.last_error().map_or(ErrorSeverity::Error, ErrorClassification::severity),
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        self.last_error().and_then(|e| e.retry_after)
    }
}

/// Successful retry sequence
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    /// Value returned by the successful attempt
    pub value: T,
    /// Attempt history, the last record is the success
    pub attempts: Vec<AttemptRecord>,
}

type AttemptHook = Arc<dyn Fn(u32, Duration) + Send + Sync>;
type SuccessHook = Arc<dyn Fn(u32) + Send + Sync>;
type FailureHook = Arc<dyn Fn(&CategorizedError, u32) + Send + Sync>;

/// Optional observation callbacks
///
/// Hooks run synchronously on the retrying task and are never awaited. A
/// panicking hook is caught and logged; it never fails the call.
#[derive(Clone, Default)]
pub struct RetryHooks {
    on_attempt: Option<AttemptHook>,
    on_success: Option<SuccessHook>,
    on_failure: Option<FailureHook>,
}

impl RetryHooks {
    /// No hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before each attempt with `(attempt_number, delay_before)`
    pub fn on_attempt(mut self, hook: impl Fn(u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_attempt = Some(Arc::new(hook));
        self
    }

    /// Called once with the number of attempts used
    pub fn on_success(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Called after each failed attempt with `(error, attempt_number)`
    pub fn on_failure(
        mut self,
        hook: impl Fn(&CategorizedError, u32) + Send + Sync + 'static,
    ) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RetryHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHooks")
            .field("on_attempt", &self.on_attempt.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

fn run_hook(name: &'static str, hook: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        warn!(hook = name, "Retry hook panicked; ignoring");
    }
}

/// Executes operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    hooks: RetryHooks,
}

impl RetryExecutor {
    /// Executor without hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor that reports to `hooks`
    pub fn with_hooks(hooks: RetryHooks) -> Self {
        Self { hooks }
    }

    /// Run `operation` until it succeeds, fails non-retryably or the budget
    /// runs out
    ///
    /// # Errors
    ///
    /// [`RetryError::NonRetryable`] or [`RetryError::Exhausted`].
    pub async fn execute<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProviderFailure>,
    {
        self.run(policy, None, operation).await.map(|outcome| outcome.value)
    }

    /// Like [`execute`](Self::execute), stopping as soon as `token` is
    /// cancelled
    ///
    /// Cancellation drops the in-flight attempt and schedules no further
    /// attempts.
    ///
    /// # Errors
    ///
    /// Additionally returns [`RetryError::Cancelled`].
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        token: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProviderFailure>,
    {
        self.run(policy, Some(token), operation).await.map(|outcome| outcome.value)
    }

    /// Like [`execute_with_cancel`](Self::execute_with_cancel), also
    /// returning the attempt history on success
    ///
    /// # Errors
    ///
    /// Same as [`execute_with_cancel`](Self::execute_with_cancel).
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        token: Option<&CancellationToken>,
        operation: F,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProviderFailure>,
    {
        self.run(policy, token, operation).await
    }

    #[instrument(skip_all, fields(max_attempts = policy.max_attempts))]
    async fn run<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        token: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProviderFailure>,
    {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut attempt_number = 1u32;
        let mut delay_before = Duration::ZERO;

        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                debug!(attempt = attempt_number, "Retry cancelled before attempt");
                return Err(RetryError::Cancelled { attempts });
            }

            if let Some(hook) = &self.hooks.on_attempt {
                run_hook("on_attempt", || hook(attempt_number, delay_before));
            }
            debug!(attempt = attempt_number, "Executing attempt");

            let result = tokio::select! {
                biased;
                () = cancelled(token) => {
                    debug!(attempt = attempt_number, "Retry cancelled during attempt");
                    return Err(RetryError::Cancelled { attempts });
                }
                result = run_attempt(policy, &mut operation) => result,
            };

            let error = match result {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        attempt_number,
                        delay_before_attempt: delay_before,
                        error: None,
                    });
                    if attempt_number > 1 {
                        debug!(attempts = attempt_number, "Operation succeeded after retries");
                    }
                    if let Some(hook) = &self.hooks.on_success {
                        run_hook("on_success", || hook(attempt_number));
                    }
                    return Ok(RetryOutcome { value, attempts });
                }
                Err(failure) => classify(&failure),
            };

            if let Some(hook) = &self.hooks.on_failure {
                run_hook("on_failure", || hook(&error, attempt_number));
            }
            attempts.push(AttemptRecord {
                attempt_number,
                delay_before_attempt: delay_before,
                error: Some(error.clone()),
            });

            if !error.retryable {
                warn!(
                    attempt = attempt_number,
                    category = %error.category,
                    error = %error.raw_message,
                    "Non-retryable failure, giving up"
                );
                return Err(RetryError::NonRetryable { error, attempts });
            }

            if attempt_number >= policy.budget_for(&error) {
                warn!(
                    attempts = attempt_number,
                    category = %error.category,
                    error = %error.raw_message,
                    "All retry attempts exhausted"
                );
                return Err(RetryError::Exhausted(AggregatedRetryError { attempts }));
            }

            let delay = policy.delay_for(attempt_number, &error);
            debug!(
                attempt = attempt_number,
                category = %error.category,
                delay_ms = delay.as_millis(),
                "Attempt failed, backing off"
            );

            tokio::select! {
                biased;
                () = cancelled(token) => {
                    debug!(attempt = attempt_number, "Retry cancelled during backoff");
                    return Err(RetryError::Cancelled { attempts });
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt_number += 1;
            delay_before = delay;
        }
    }
}

async fn run_attempt<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &mut F,
) -> Result<T, ProviderFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<ProviderFailure>,
{
    match policy.attempt_timeout() {
        Some(limit) => match tokio::time::timeout(limit, operation()).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ProviderFailure::timeout(limit)),
        },
        None => operation().await.map_err(Into::into),
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use maplink_common::testing::{CallCounter, Script};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(800))
            .no_jitter()
            .per_attempt_timeout(Duration::ZERO)
            .build()
            .expect("valid policy")
    }

    // =========================================================================
    // Policy
    // =========================================================================

    /// Validates `RetryPolicy::validate` rejections.
    ///
    /// Assertions:
    /// - Ensures zero attempts is rejected.
    /// - Ensures `max_delay < initial_delay` is rejected.
    /// - Ensures a zero caution budget is rejected.
    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::builder()
            .initial_delay(Duration::from_secs(2))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(RetryPolicy::builder().caution_max_attempts(0).build().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    /// Validates the capped doubling sequence.
    ///
    /// Assertions:
    /// - Confirms delays are 100, 200, 400, 800, 800 ms.
    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = fast_policy(6);
        let delays: Vec<u128> = (1..=5).map(|n| policy.base_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
        assert_eq!(policy.base_delay(64), Duration::from_millis(800));
    }

    /// Validates that jittered delays stay within half to one-and-a-half
    /// times the deterministic delay.
    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..500 {
            let jittered = apply_jitter(base);
            assert!(jittered >= Duration::from_millis(200), "{jittered:?} below bound");
            assert!(jittered < Duration::from_millis(600), "{jittered:?} above bound");
        }
    }

    /// Validates that a rate-limit hint raises the delay, capped by
    /// `max_delay`.
    #[test]
    fn test_rate_limit_hint_raises_delay() {
        let policy = fast_policy(3);
        let mut error = classify(&ProviderFailure::RateLimited {
            retry_after: Some(Duration::from_millis(300)),
        });
        assert_eq!(policy.delay_for(1, &error), Duration::from_millis(300));

        error.retry_after = Some(Duration::from_secs(30));
        assert_eq!(policy.delay_for(1, &error), Duration::from_millis(800));

        let network = classify(&ProviderFailure::network("reset"));
        assert_eq!(policy.delay_for(1, &network), Duration::from_millis(100));
    }

    /// Validates the reduced budget for `UNKNOWN` failures.
    #[test]
    fn test_caution_budget() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .caution_max_attempts(2)
            .build()
            .expect("valid policy");

        assert_eq!(policy.budget_for(&classify(&ProviderFailure::other("odd"))), 2);
        assert_eq!(policy.budget_for(&classify(&ProviderFailure::network("dns"))), 5);
        assert_eq!(fast_policy(4).budget_for(&classify(&ProviderFailure::other("odd"))), 4);
    }

    // =========================================================================
    // Executor
    // =========================================================================

    /// Validates success after N-1 failures.
    ///
    /// Assertions:
    /// - Confirms the success value is returned.
    /// - Confirms exactly N attempts are recorded with the expected delays.
    #[tokio::test(start_paused = true)]
    async fn test_execute_succeeds_after_failures() {
        let script = Script::fail_then_succeed(3, ProviderFailure::http(503, "down"), "tile");
        let executor = RetryExecutor::new();

        let outcome = executor
            .execute_with_outcome(&fast_policy(4), None, || {
                let script = script.clone();
                async move { script.next() }
            })
            .await
            .expect("fourth attempt succeeds");

        assert_eq!(outcome.value, "tile");
        assert_eq!(outcome.attempts.len(), 4);
        assert_eq!(script.calls(), 4);
        let delays: Vec<u128> =
            outcome.attempts.iter().map(|r| r.delay_before_attempt.as_millis()).collect();
        assert_eq!(delays, vec![0, 100, 200, 400]);
        assert!(outcome.attempts[3].error.is_none());
    }

    /// Validates that a non-retryable failure stops after one attempt.
    #[tokio::test(start_paused = true)]
    async fn test_execute_non_retryable_stops_immediately() {
        let script: Script<(), ProviderFailure> =
            Script::always_fail(ProviderFailure::http(401, "bad key"));

        let err = RetryExecutor::new()
            .execute(&fast_policy(5), || {
                let script = script.clone();
                async move { script.next() }
            })
            .await
            .expect_err("401 is not retryable");

        assert!(matches!(err, RetryError::NonRetryable { .. }));
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(script.calls(), 1);
        assert_eq!(err.last_error().map(|e| e.category), Some(ErrorCategory::Authentication));
    }

    /// Validates exhaustion with the aggregated history.
    #[tokio::test(start_paused = true)]
    async fn test_execute_exhausts_budget() {
        let script: Script<(), ProviderFailure> =
            Script::always_fail(ProviderFailure::network("ECONNRESET"));

        let err = RetryExecutor::new()
            .execute(&fast_policy(3), || {
                let script = script.clone();
                async move { script.next() }
            })
            .await
            .expect_err("always fails");

        let RetryError::Exhausted(aggregated) = &err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(aggregated.attempts.len(), 3);
        assert_eq!(aggregated.errors().count(), 3);
        assert!(err.is_retryable());
        assert!(err.to_string().starts_with("all 3 attempts failed"));
    }

    /// Validates that `UNKNOWN` failures use the caution budget.
    #[tokio::test(start_paused = true)]
    async fn test_execute_caution_budget_applies() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .caution_max_attempts(2)
            .no_jitter()
            .build()
            .expect("valid policy");
        let script: Script<(), ProviderFailure> =
            Script::always_fail(ProviderFailure::other("mystery"));

        let err = RetryExecutor::new()
            .execute(&policy, || {
                let script = script.clone();
                async move { script.next() }
            })
            .await
            .expect_err("always fails");

        assert_eq!(err.attempts().len(), 2);
        assert_eq!(script.calls(), 2);
    }

    /// Validates that a hung attempt is cut off by the per-attempt timeout
    /// and classified as `TIMEOUT`.
    #[tokio::test(start_paused = true)]
    async fn test_per_attempt_timeout() {
        let policy = RetryPolicy::builder()
            .max_attempts(2)
            .initial_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(10))
            .no_jitter()
            .per_attempt_timeout(Duration::from_millis(50))
            .build()
            .expect("valid policy");

        let err = RetryExecutor::new()
            .execute(&policy, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ProviderFailure>(())
            })
            .await
            .expect_err("every attempt hangs");

        assert_eq!(err.attempts().len(), 2);
        assert_eq!(err.last_error().map(|e| e.category), Some(ErrorCategory::Timeout));
    }

    /// Validates cancellation during backoff.
    ///
    /// Assertions:
    /// - Confirms `RetryError::Cancelled` is returned.
    /// - Confirms no further attempt is scheduled.
    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let token = CancellationToken::new();
        let counter = CallCounter::new();
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(1))
            .no_jitter()
            .build()
            .expect("valid policy");

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let err = RetryExecutor::new()
            .execute_with_cancel(&policy, &token, || {
                let counter = counter.clone();
                async move {
                    counter.hit();
                    Err::<(), _>(ProviderFailure::network("reset"))
                }
            })
            .await
            .expect_err("cancelled");

        assert!(err.is_cancelled());
        assert_eq!(err.attempts().len(), 1);
        assert_eq!(counter.get(), 1);
    }

    /// Validates that a panicking hook does not fail the call and the other
    /// hooks still fire.
    #[tokio::test(start_paused = true)]
    async fn test_panicking_hook_is_contained() {
        let successes = Arc::new(AtomicU32::new(0));
        let recorded = Arc::clone(&successes);
        let hooks = RetryHooks::new()
            .on_attempt(|_, _| panic!("hook exploded"))
            .on_success(move |attempts| {
                recorded.store(attempts, Ordering::SeqCst);
            });
        let script = Script::fail_then_succeed(1, ProviderFailure::http(502, "gw"), 7u8);

        let value = RetryExecutor::with_hooks(hooks)
            .execute(&fast_policy(3), || {
                let script = script.clone();
                async move { script.next() }
            })
            .await
            .expect("hook panic is ignored");

        assert_eq!(value, 7);
        assert_eq!(successes.load(Ordering::SeqCst), 2);
    }

    /// Validates failure hook arguments.
    #[tokio::test(start_paused = true)]
    async fn test_failure_hook_sees_each_failure() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hooks = RetryHooks::new().on_failure(move |error, attempt| {
            sink.lock().push((error.category, attempt));
        });
        let script = Script::fail_then_succeed(2, ProviderFailure::http(429, "slow"), ());

        RetryExecutor::with_hooks(hooks)
            .execute(&fast_policy(3), || {
                let script = script.clone();
                async move { script.next() }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(
            *seen.lock(),
            vec![(ErrorCategory::RateLimit, 1), (ErrorCategory::RateLimit, 2)]
        );
    }

    /// Validates the `[retry]` config section shape.
    #[test]
    fn test_policy_from_toml() {
        let policy: RetryPolicy = toml::from_str(
            "max_attempts = 4\ninitial_delay_ms = 50\nmax_delay_ms = 400\njitter_enabled = false\n",
        )
        .expect("valid TOML");

        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_millis(400));
        assert!(!policy.jitter_enabled);
        assert_eq!(policy.per_attempt_timeout, Duration::from_secs(10));
    }
}
