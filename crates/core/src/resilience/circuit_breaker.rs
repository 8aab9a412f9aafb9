//! Per-provider circuit breaker
//!
//! The breaker guards one provider. After `failure_threshold` consecutive
//! failures it opens and rejects calls without running them. Once
//! `recovery_timeout` has passed it admits a single probe call (half-open);
//! enough probe successes close it again, a probe failure re-opens it.
//! After `max_recovery_attempts` failed probes the breaker stays open until
//! [`CircuitBreaker::reset`] is called.
//!
//! All state lives behind one lock. Transitions are computed under the lock
//! and their notifications are dispatched after it is released.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use maplink_common::error::{ConfigError, ErrorClassification, ErrorSeverity};
use maplink_common::time::{Clock, SystemClock};
use maplink_common::utils::serde::duration_millis;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use super::events::{EventBus, ListenerId};
use super::provider::ProviderId;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, admitting one probe call at a time
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// Time spent open before a probe is admitted
    #[serde(rename = "recovery_timeout_ms", with = "duration_millis")]
    pub recovery_timeout: Duration,
    /// Failed probes before a manual reset is required, 0 for unlimited
    pub max_recovery_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
            max_recovery_attempts: 0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a threshold is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`]
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Start from the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive failures that open the circuit
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Consecutive half-open successes that close the circuit
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Time spent open before a probe is admitted
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    /// Failed probes before a manual reset is required, 0 for unlimited
    pub fn max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.config.max_recovery_attempts = attempts;
        self
    }

    /// Validate and build the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a threshold is zero.
    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Snapshot of a breaker's state record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures while closed
    pub consecutive_failures: u32,
    /// Consecutive successes (closed or half-open)
    pub consecutive_successes: u32,
    /// When the current state was entered
    pub last_state_change: Instant,
    /// Failed half-open probes since the circuit last closed
    pub recovery_attempt_count: u32,
    /// No automatic half-open until [`CircuitBreaker::reset`]
    pub manual_reset_required: bool,
}

/// A state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStateChange {
    /// Provider the breaker guards
    pub provider_id: ProviderId,
    /// State before the transition
    pub from: CircuitState,
    /// State after the transition
    pub to: CircuitState,
    /// Whether the breaker now requires a manual reset
    pub manual_reset_required: bool,
}

/// Call rejected because the circuit is open
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for provider '{provider_id}'")]
pub struct CircuitOpenError {
    /// Provider the breaker guards
    pub provider_id: ProviderId,
    /// State that rejected the call (`OPEN`, or `HALF_OPEN` with a probe in
    /// flight)
    pub state: CircuitState,
    /// Time until a probe may be admitted; `None` when a manual reset is
    /// required or a probe is already running
    pub retry_after: Option<Duration>,
    /// Whether only [`CircuitBreaker::reset`] can close the circuit
    pub manual_reset_required: bool,
}

impl ErrorClassification for CircuitOpenError {
    fn is_retryable(&self) -> bool {
        !self.manual_reset_required
    }

    fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::Warning
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Result of a guarded call: fail-fast rejection or the operation's own
/// error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    /// The operation ran and failed
    #[error("operation failed: {0}")]
    Failed(E),
}

impl<E> BreakerError<E> {
    /// The rejection, if the call was not run
    pub fn as_circuit_open(&self) -> Option<&CircuitOpenError> {
        match self {
            Self::CircuitOpen(err) => Some(err),
            Self::Failed(_) => None,
        }
    }

    /// The operation error, if the call ran
    pub fn into_failed(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            Self::CircuitOpen(_) => None,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_state_change: Instant,
    recovery_attempt_count: u32,
    manual_reset_required: bool,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_state_change: now,
            recovery_attempt_count: 0,
            manual_reset_required: false,
            probe_in_flight: false,
        }
    }

    fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_state_change: self.last_state_change,
            recovery_attempt_count: self.recovery_attempt_count,
            manual_reset_required: self.manual_reset_required,
        }
    }

    /// Move to `to`, returning the transition to notify
    fn transition(&mut self, to: CircuitState, now: Instant) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        (from, to)
    }
}

/// Admission ticket for one guarded call
///
/// Dropping a half-open permit without recording an outcome (for example
/// because the caller's future was cancelled) frees the probe slot without a
/// transition.
struct Permit<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    probe: bool,
    settled: bool,
}

impl<C: Clock> Permit<'_, C> {
    fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe);
    }

    fn release(mut self) {
        self.settled = true;
        self.breaker.release_probe(self.probe);
    }
}

impl<C: Clock> Drop for Permit<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release_probe(self.probe);
        }
    }
}

/// Circuit breaker for one provider
///
/// Clones share state. Time is read through a [`Clock`] so recovery timeouts
/// can be driven by a `MockClock` in tests.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    provider_id: ProviderId,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    events: Arc<EventBus<CircuitStateChange>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("provider_id", &self.provider_id)
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.consecutive_failures)
            .field("manual_reset_required", &inner.manual_reset_required)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            provider_id: self.provider_id.clone(),
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker using the system clock
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid configuration.
    pub fn new(
        provider_id: impl Into<ProviderId>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(provider_id, config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid configuration.
    pub fn with_clock(
        provider_id: impl Into<ProviderId>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = clock.now();

        Ok(Self {
            provider_id: provider_id.into(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner::new(now))),
            events: Arc::new(EventBus::new()),
            clock: Arc::new(clock),
        })
    }

    /// Provider this breaker guards
    pub fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` if the circuit admits it; every error counts as a
    /// failure
    ///
    /// # Errors
    ///
    /// [`BreakerError::CircuitOpen`] without running the operation, or
    /// [`BreakerError::Failed`] with the operation's error.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_when(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but only errors for which
    /// `counts_as_failure` returns `true` move the breaker
    ///
    /// Other errors (typically caller cancellation) leave the counters alone
    /// and free the probe slot.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    #[instrument(skip_all, fields(provider = %self.provider_id))]
    pub async fn execute_when<F, Fut, T, E, P>(
        &self,
        operation: F,
        counts_as_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                debug!(state = %rejection.state, "Circuit breaker rejecting call");
                return Err(BreakerError::CircuitOpen(rejection));
            }
        };

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(error) => {
                if counts_as_failure(&error) {
                    permit.failure();
                } else {
                    permit.release();
                }
                Err(BreakerError::Failed(error))
            }
        }
    }

    /// Like [`execute`](Self::execute), answering with `fallback` instead of
    /// a rejection when the circuit is open
    ///
    /// # Errors
    ///
    /// [`BreakerError::Failed`] when the operation ran and failed.
    pub async fn execute_with_fallback<F, Fut, T, E, G, GFut>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(CircuitOpenError) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(operation).await {
            Err(BreakerError::CircuitOpen(rejection)) => {
                debug!(provider = %self.provider_id, "Serving fallback for open circuit");
                Ok(fallback(rejection).await)
            }
            other => other,
        }
    }

    /// Snapshot of the full state record
    pub fn get_state(&self) -> CircuitBreakerState {
        self.inner.lock().snapshot()
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether the circuit is currently open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Whether only [`reset`](Self::reset) can close the circuit
    pub fn is_manual_reset_required(&self) -> bool {
        self.inner.lock().manual_reset_required
    }

    /// Force the breaker back to `CLOSED` with all counters cleared
    pub fn reset(&self) {
        let now = self.clock.now();
        let change = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            let was_manual = inner.manual_reset_required;
            *inner = BreakerInner::new(now);
            (previous != CircuitState::Closed || was_manual)
                .then_some((previous, CircuitState::Closed))
        };

        info!(provider = %self.provider_id, "Circuit breaker manually reset to closed state");
        if let Some((from, to)) = change {
            self.notify(from, to, false);
        }
    }

    /// Register a synchronous transition listener
    pub fn on_state_change(
        &self,
        listener: impl Fn(&CircuitStateChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.events.add_listener(listener)
    }

    /// Remove a listener added with [`on_state_change`](Self::on_state_change)
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    /// Subscribe to transitions
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitStateChange> {
        self.events.subscribe()
    }

    fn try_acquire(&self) -> Result<Permit<'_, C>, CircuitOpenError> {
        let now = self.clock.now();
        let mut change = None;

        let result = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let elapsed = now.saturating_duration_since(inner.last_state_change);
                    if inner.manual_reset_required {
                        Err(self.rejection(CircuitState::Open, None, true))
                    } else if elapsed >= self.config.recovery_timeout {
                        change = Some(inner.transition(CircuitState::HalfOpen, now));
                        inner.probe_in_flight = true;
                        Ok(true)
                    } else {
                        let remaining = self.config.recovery_timeout - elapsed;
                        Err(self.rejection(CircuitState::Open, Some(remaining), false))
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        Err(self.rejection(CircuitState::HalfOpen, None, false))
                    } else {
                        inner.probe_in_flight = true;
                        Ok(true)
                    }
                }
            }
        };

        if let Some((from, to)) = change {
            info!(provider = %self.provider_id, "Circuit breaker half-open, admitting probe");
            self.notify(from, to, false);
        }

        result.map(|probe| Permit { breaker: self, probe, settled: false })
    }

    fn rejection(
        &self,
        state: CircuitState,
        retry_after: Option<Duration>,
        manual_reset_required: bool,
    ) -> CircuitOpenError {
        CircuitOpenError {
            provider_id: self.provider_id.clone(),
            state,
            retry_after,
            manual_reset_required,
        }
    }

    fn on_success(&self, probe: bool) {
        let now = self.clock.now();
        let change = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed if !probe => {
                    inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen if probe => {
                    inner.probe_in_flight = false;
                    inner.consecutive_successes = inner.consecutive_successes.saturating_add(1);
                    inner.consecutive_failures = 0;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.recovery_attempt_count = 0;
                        Some(inner.transition(CircuitState::Closed, now))
                    } else {
                        None
                    }
                }
                // Outcome of a call admitted under an earlier state.
                _ => None,
            }
        };

        if let Some((from, to)) = change {
            info!(provider = %self.provider_id, "Circuit breaker closed after successful probe");
            self.notify(from, to, false);
        }
    }

    fn on_failure(&self, probe: bool) {
        let now = self.clock.now();
        let change = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed if !probe => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.consecutive_successes = 0;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        warn!(
                            provider = %self.provider_id,
                            failures = inner.consecutive_failures,
                            "Circuit breaker opened"
                        );
                        Some((inner.transition(CircuitState::Open, now), false))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen if probe => {
                    inner.probe_in_flight = false;
                    inner.recovery_attempt_count = inner.recovery_attempt_count.saturating_add(1);
                    let max = self.config.max_recovery_attempts;
                    if max > 0 && inner.recovery_attempt_count >= max {
                        inner.manual_reset_required = true;
                        warn!(
                            provider = %self.provider_id,
                            recovery_attempts = inner.recovery_attempt_count,
                            "Circuit breaker requires manual reset"
                        );
                    } else {
                        warn!(
                            provider = %self.provider_id,
                            recovery_attempts = inner.recovery_attempt_count,
                            "Circuit breaker re-opened after failed probe"
                        );
                    }
                    let manual = inner.manual_reset_required;
                    Some((inner.transition(CircuitState::Open, now), manual))
                }
                _ => None,
            }
        };

        if let Some(((from, to), manual)) = change {
            self.notify(from, to, manual);
        }
    }

    fn release_probe(&self, probe: bool) {
        if probe {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState, manual_reset_required: bool) {
        self.events.emit(CircuitStateChange {
            provider_id: self.provider_id.clone(),
            from,
            to,
            manual_reset_required,
        });
    }
}
