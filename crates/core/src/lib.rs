//! # MapLink Core
//!
//! Resilience engine for calls to interchangeable map providers.
//!
//! This crate contains:
//! - Failure classification ([`resilience::classifier`])
//! - Retry with backoff, jitter, timeouts and deduplication
//! - Per-provider circuit breakers
//! - Periodic health monitoring with rolling windows
//! - A coordinator that ranks providers and falls back between them
//! - Configuration loading ([`config`])
//!
//! ## Architecture Principles
//! - Only depends on `maplink-common` plus the async runtime stack
//! - Provider protocols stay outside; operations and probes are injected
//! - Components are explicit instances with injected config and an explicit
//!   `start()`/`stop()` lifecycle

pub mod config;
pub mod resilience;

pub use config::MapLinkConfig;
pub use resilience::circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitOpenError,
    CircuitState, CircuitStateChange,
};
pub use resilience::classifier::{classify, CategorizedError, ErrorCategory, ProviderFailure};
pub use resilience::coordinator::{
    CoordinatorError, ProviderAttempt, ProviderCoordinator, ProviderOutcome, ProviderSwitch,
    ProvidersExhausted,
};
pub use resilience::dedup::RequestDeduplicator;
pub use resilience::events::{EventBus, ListenerId};
pub use resilience::health::{
    HealthMonitor, HealthMonitorConfig, HealthMonitorError, HealthStatus,
    ProviderHealthSnapshot, StatusChange,
};
pub use resilience::provider::{probe_fn, HealthProbe, ProviderId, ProviderRegistryEntry};
pub use resilience::retry::{
    AggregatedRetryError, AttemptRecord, RetryError, RetryExecutor, RetryHooks, RetryOutcome,
    RetryPolicy,
};
