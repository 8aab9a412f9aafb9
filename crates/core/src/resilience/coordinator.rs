//! Multi-provider fallback
//!
//! The coordinator owns one [`CircuitBreaker`] per registered provider and
//! shares a [`HealthMonitor`] with the caller. For each call it ranks the
//! providers, then walks the ranking: every candidate runs the full retry
//! sequence inside its breaker, and any failure moves on to the next
//! candidate. Providers with an open circuit stay at the tail of the ranking
//! so a recovery probe can still reach them once their timeout has elapsed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use maplink_common::error::{ConfigError, ErrorClassification, ErrorSeverity};
use maplink_common::time::{Clock, SystemClock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitOpenError,
    CircuitState, CircuitStateChange,
};
use super::classifier::{CategorizedError, ProviderFailure};
use super::events::{EventBus, ListenerId};
use super::health::{HealthMonitor, HealthMonitorError, HealthStatus};
use super::provider::{ProviderId, ProviderRegistryEntry};
use super::retry::{RetryError, RetryExecutor, RetryPolicy};

/// The coordinator moved from one provider to the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSwitch {
    /// Provider that just failed
    pub from: ProviderId,
    /// Provider about to be tried
    pub to: ProviderId,
}

/// How one provider's turn ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    /// The breaker rejected the call without running it
    CircuitOpen(CircuitOpenError),
    /// The retry sequence ran and failed
    Failed(RetryError),
}

impl ProviderOutcome {
    fn is_transient(&self) -> bool {
        match self {
            Self::CircuitOpen(rejection) => rejection.is_retryable(),
            Self::Failed(error) => error.is_retryable(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen(rejection) => rejection.retry_after,
            Self::Failed(error) => error.retry_after(),
        }
    }
}

/// One provider tried during a coordinated call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAttempt {
    /// Provider identifier
    pub provider_id: ProviderId,
    /// Breaker state after the provider's turn
    pub circuit_state: CircuitState,
    /// Health status when the provider was ranked
    pub health: HealthStatus,
    /// How the turn ended
    pub outcome: ProviderOutcome,
}

/// Every provider was tried and none succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidersExhausted {
    attempts: Vec<ProviderAttempt>,
}

impl ProvidersExhausted {
    /// Providers in the order they were tried
    pub fn attempts(&self) -> &[ProviderAttempt] {
        &self.attempts
    }

    /// Every classified failure across all providers, in order
    pub fn errors(&self) -> impl Iterator<Item = &CategorizedError> {
        self.attempts
            .iter()
            .filter_map(|attempt| match &attempt.outcome {
                ProviderOutcome::Failed(error) => Some(error.attempts()),
                ProviderOutcome::CircuitOpen(_) => None,
            })
            .flatten()
            .filter_map(|record| record.error.as_ref())
    }

    /// Whether asking the user to retry later makes sense
    ///
    /// `true` when at least one provider failed transiently or has a circuit
    /// that will admit a probe on its own; `false` when every failure was
    /// permanent.
    pub fn manual_retry_suggested(&self) -> bool {
        self.attempts.iter().any(|attempt| attempt.outcome.is_transient())
    }
}

impl fmt::Display for ProvidersExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} providers failed", self.attempts.len())?;
        let tried: Vec<&str> = self.attempts.iter().map(|a| a.provider_id.as_str()).collect();
        if !tried.is_empty() {
            write!(f, " (tried: {})", tried.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ProvidersExhausted {}

/// Coordinated call failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// No provider produced a value
    #[error(transparent)]
    AllProvidersFailed(ProvidersExhausted),

    /// The caller cancelled the call
    #[error("provider call cancelled after {} providers", .attempts.len())]
    Cancelled {
        /// Providers tried before cancellation
        attempts: Vec<ProviderAttempt>,
    },

    /// The registry is empty
    #[error("no providers registered")]
    NoProviders,

    /// No provider registered under this id
    #[error("unknown provider: {provider_id}")]
    UnknownProvider {
        /// Requested identifier
        provider_id: ProviderId,
    },
}

impl ErrorClassification for CoordinatorError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::AllProvidersFailed(exhausted) => exhausted.manual_retry_suggested(),
            Self::Cancelled { .. } | Self::NoProviders | Self::UnknownProvider { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::AllProvidersFailed(_) => ErrorSeverity::Error,
            Self::Cancelled { .. } => ErrorSeverity::Info,
            Self::NoProviders => ErrorSeverity::Critical,
            Self::UnknownProvider { .. } => ErrorSeverity::Warning,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::NoProviders)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AllProvidersFailed(exhausted) => {
                exhausted.attempts.iter().filter_map(|a| a.outcome.retry_after()).min()
            }
            _ => None,
        }
    }
}

struct CoordinatedProvider<C: Clock> {
    entry: ProviderRegistryEntry,
    breaker: CircuitBreaker<C>,
    order: usize,
}

/// Ranks providers and falls back between them
pub struct ProviderCoordinator<C: Clock = SystemClock> {
    providers: Vec<CoordinatedProvider<C>>,
    policy: RetryPolicy,
    executor: RetryExecutor,
    health: Arc<HealthMonitor>,
    switches: EventBus<ProviderSwitch>,
}

impl<C: Clock> fmt::Debug for ProviderCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCoordinator")
            .field("providers", &self.provider_ids())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ProviderCoordinator<SystemClock> {
    /// Create a coordinator using the system clock for breaker timing
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for duplicate provider ids or an
    /// invalid policy or breaker configuration.
    pub fn new(
        registry: Vec<ProviderRegistryEntry>,
        policy: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        health: Arc<HealthMonitor>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(registry, policy, breaker_config, health, SystemClock)
    }
}

impl<C: Clock + Clone> ProviderCoordinator<C> {
    /// Create a coordinator whose breakers read time from `clock`
    ///
    /// Registers every provider with `health` without starting it.
    ///
    /// # Errors
    ///
    /// Same as [`ProviderCoordinator::new`].
    pub fn with_clock(
        registry: Vec<ProviderRegistryEntry>,
        policy: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
        health: Arc<HealthMonitor>,
        clock: C,
    ) -> Result<Self, ConfigError> {
        policy.validate()?;
        breaker_config.validate()?;

        let mut providers: Vec<CoordinatedProvider<C>> = Vec::with_capacity(registry.len());
        for (order, entry) in registry.into_iter().enumerate() {
            if providers.iter().any(|p| p.entry.provider_id == entry.provider_id) {
                return Err(ConfigError::invalid(format!(
                    "duplicate provider id '{}'",
                    entry.provider_id
                )));
            }
            let breaker = CircuitBreaker::with_clock(
                entry.provider_id.clone(),
                breaker_config.clone(),
                clock.clone(),
            )?;
            providers.push(CoordinatedProvider { entry, breaker, order });
        }

        health.register(providers.iter().map(|p| p.entry.clone()));

        Ok(Self { providers, policy, executor: RetryExecutor::new(), health, switches: EventBus::new() })
    }
}

impl<C: Clock> ProviderCoordinator<C> {
    /// Use `executor` (for example one carrying hooks) for retry sequences
    #[must_use]
    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Run `factory` against the best provider, falling back on failure
    ///
    /// `factory` receives the id of the provider to call and may be invoked
    /// several times per provider by the retry sequence.
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::AllProvidersFailed`] when every provider failed,
    /// or [`CoordinatorError::NoProviders`] for an empty registry.
    pub async fn call<F, Fut, T, E>(&self, factory: F) -> Result<T, CoordinatorError>
    where
        F: FnMut(ProviderId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProviderFailure>,
    {
        self.run(None, factory).await
    }

    /// Like [`call`](Self::call), stopping as soon as `token` is cancelled
    ///
    /// Cancellation is not recorded as a breaker failure and no further
    /// provider is tried.
    ///
    /// # Errors
    ///
    /// Additionally returns [`CoordinatorError::Cancelled`].
    pub async fn call_with_cancel<F, Fut, T, E>(
        &self,
        token: &CancellationToken,
        factory: F,
    ) -> Result<T, CoordinatorError>
    where
        F: FnMut(ProviderId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProviderFailure>,
    {
        self.run(Some(token), factory).await
    }

    #[instrument(skip_all, fields(providers = self.providers.len()))]
    async fn run<F, Fut, T, E>(
        &self,
        token: Option<&CancellationToken>,
        mut factory: F,
    ) -> Result<T, CoordinatorError>
    where
        F: FnMut(ProviderId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<ProviderFailure>,
    {
        let ranked = self.rank();
        if ranked.is_empty() {
            return Err(CoordinatorError::NoProviders);
        }

        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut previous: Option<ProviderId> = None;

        for (provider, health) in ranked {
            if token.is_some_and(CancellationToken::is_cancelled) {
                return Err(CoordinatorError::Cancelled { attempts });
            }

            let id = provider.entry.provider_id.clone();
            // Announced only once the breaker admits the call.
            let switch = previous.clone().map(|from| ProviderSwitch { from, to: id.clone() });

            let executor = &self.executor;
            let policy = &self.policy;
            let switches = &self.switches;
            let factory_ref = &mut factory;
            let call_id = id.clone();
            let result = provider
                .breaker
                .execute_when(
                    move || async move {
                        if let Some(switch) = switch {
                            info!(from = %switch.from, to = %switch.to, "Falling back to next provider");
                            switches.emit(switch);
                        }
                        let operation = || factory_ref(call_id.clone());
                        match token {
                            Some(token) => executor.execute_with_cancel(policy, token, operation).await,
                            None => executor.execute(policy, operation).await,
                        }
                    },
                    |error: &RetryError| !error.is_cancelled(),
                )
                .await;

            let admitted = !matches!(result, Err(BreakerError::CircuitOpen(_)));
            let outcome = match result {
                Ok(value) => {
                    if !attempts.is_empty() {
                        info!(provider = %id, skipped = attempts.len(), "Call served by fallback provider");
                    }
                    return Ok(value);
                }
                Err(BreakerError::CircuitOpen(rejection)) => {
                    debug!(provider = %id, "Skipping provider with open circuit");
                    ProviderOutcome::CircuitOpen(rejection)
                }
                Err(BreakerError::Failed(error)) if error.is_cancelled() => {
                    attempts.push(ProviderAttempt {
                        provider_id: id,
                        circuit_state: provider.breaker.state(),
                        health,
                        outcome: ProviderOutcome::Failed(error),
                    });
                    return Err(CoordinatorError::Cancelled { attempts });
                }
                Err(BreakerError::Failed(error)) => {
                    warn!(provider = %id, error = %error, "Provider failed");
                    ProviderOutcome::Failed(error)
                }
            };

            attempts.push(ProviderAttempt {
                provider_id: id.clone(),
                circuit_state: provider.breaker.state(),
                health,
                outcome,
            });
            if admitted {
                previous = Some(id);
            }
        }

        warn!(providers = attempts.len(), "All providers failed");
        Err(CoordinatorError::AllProvidersFailed(ProvidersExhausted { attempts }))
    }

    /// Providers in the order the next call would try them
    pub fn ranked_providers(&self) -> Vec<ProviderId> {
        self.rank().into_iter().map(|(p, _)| p.entry.provider_id.clone()).collect()
    }

    /// Registered providers in registration order
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.entry.provider_id.clone()).collect()
    }

    /// Best provider per health data, skipping open circuits
    pub fn recommended_provider(&self) -> Option<ProviderId> {
        self.health.recommended_provider(|id| self.find(id).is_some_and(|p| p.breaker.is_open()))
    }

    /// Breaker guarding `provider_id`
    pub fn breaker(&self, provider_id: &ProviderId) -> Option<&CircuitBreaker<C>> {
        self.find(provider_id).map(|p| &p.breaker)
    }

    /// Breaker state record for `provider_id`
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownProvider`] for an unregistered id.
    pub fn breaker_state(&self, provider_id: &ProviderId) -> Result<CircuitBreakerState, CoordinatorError> {
        self.find_or_err(provider_id).map(|p| p.breaker.get_state())
    }

    /// Force `provider_id`'s breaker back to `CLOSED`
    ///
    /// # Errors
    ///
    /// [`CoordinatorError::UnknownProvider`] for an unregistered id.
    pub fn reset_provider(&self, provider_id: &ProviderId) -> Result<(), CoordinatorError> {
        self.find_or_err(provider_id).map(|p| p.breaker.reset())
    }

    /// Shared health monitor
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Start background health probes for every registered provider
    ///
    /// # Errors
    ///
    /// [`HealthMonitorError::AlreadyRunning`] if the monitor is running.
    pub async fn start_monitoring(&self) -> Result<(), HealthMonitorError> {
        let entries = self.providers.iter().map(|p| p.entry.clone()).collect();
        self.health.start(entries).await
    }

    /// Stop background health probes
    ///
    /// # Errors
    ///
    /// See [`HealthMonitor::stop`].
    pub async fn stop_monitoring(&self) -> Result<(), HealthMonitorError> {
        self.health.stop().await
    }

    /// Register a synchronous provider-switch listener
    pub fn on_provider_switch(
        &self,
        listener: impl Fn(&ProviderSwitch) + Send + Sync + 'static,
    ) -> ListenerId {
        self.switches.add_listener(listener)
    }

    /// Remove a listener added with [`on_provider_switch`](Self::on_provider_switch)
    pub fn remove_switch_listener(&self, id: ListenerId) -> bool {
        self.switches.remove_listener(id)
    }

    /// Subscribe to provider switches
    pub fn subscribe_switches(&self) -> broadcast::Receiver<ProviderSwitch> {
        self.switches.subscribe()
    }

    /// Register one listener on every provider's breaker
    pub fn on_circuit_state_change(
        &self,
        listener: impl Fn(&CircuitStateChange) + Send + Sync + 'static,
    ) {
        let listener = Arc::new(listener);
        for provider in &self.providers {
            let listener = Arc::clone(&listener);
            provider.breaker.on_state_change(move |change| listener(change));
        }
    }

    fn find(&self, provider_id: &ProviderId) -> Option<&CoordinatedProvider<C>> {
        self.providers.iter().find(|p| &p.entry.provider_id == provider_id)
    }

    fn find_or_err(&self, provider_id: &ProviderId) -> Result<&CoordinatedProvider<C>, CoordinatorError> {
        self.find(provider_id)
            .ok_or_else(|| CoordinatorError::UnknownProvider { provider_id: provider_id.clone() })
    }

    fn rank(&self) -> Vec<(&CoordinatedProvider<C>, HealthStatus)> {
        let mut ranked: Vec<(&CoordinatedProvider<C>, HealthStatus, bool)> = self
            .providers
            .iter()
            .map(|p| {
                let health = self.health.status_of(&p.entry.provider_id).unwrap_or(HealthStatus::Healthy);
                (p, health, p.breaker.is_open())
            })
            .collect();

        ranked.sort_by_key(|(p, health, open)| (*open, health.rank(), p.entry.priority, p.order));
        ranked.into_iter().map(|(p, health, _)| (p, health)).collect()
    }
}
