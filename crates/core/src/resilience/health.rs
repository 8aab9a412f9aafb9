//! Periodic provider health monitoring
//!
//! Each registered provider gets its own background task driving a
//! `tokio::time::interval`. A tick runs the provider's [`HealthProbe`] under
//! `probe_timeout` and records the sample in a fixed-size rolling window.
//! Ticks for one provider never overlap (missed ticks are skipped) and
//! providers are probed independently of each other.
//!
//! Status is recomputed after every sample:
//!
//! - `UNHEALTHY`: the latest probe failed and the rolling success rate is
//!   below `unhealthy_below`
//! - `DEGRADED`: the success rate is below `degraded_below`, or the average
//!   latency of successful probes exceeds `degraded_latency`
//! - `HEALTHY`: otherwise, including a provider with no samples yet
//!
//! Probe failures never propagate; they only move the status.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use maplink_common::error::ConfigError;
use maplink_common::utils::serde::duration_millis;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::events::{EventBus, ListenerId};
use super::provider::{ProviderId, ProviderRegistryEntry};

/// Extra time `stop()` allows beyond `probe_timeout` for tasks to finish
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Time between probes of one provider
    #[serde(rename = "interval_ms", with = "duration_millis")]
    pub interval: Duration,
    /// Samples kept per provider
    pub window_size: usize,
    /// Average successful latency above which a provider is degraded
    #[serde(rename = "degraded_latency_ms", with = "duration_millis")]
    pub degraded_latency: Duration,
    /// Deadline for one probe
    #[serde(rename = "probe_timeout_ms", with = "duration_millis")]
    pub probe_timeout: Duration,
    /// Success rate below which a provider is degraded
    pub degraded_below: f64,
    /// Success rate below which a failing provider is unhealthy
    pub unhealthy_below: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            window_size: 10,
            degraded_latency: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            degraded_below: 0.9,
            unhealthy_below: 0.5,
        }
    }
}

impl HealthMonitorConfig {
    /// Create a configuration builder
    pub fn builder() -> HealthMonitorConfigBuilder {
        HealthMonitorConfigBuilder::default()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero interval, window or probe
    /// timeout, or thresholds outside `0 <= unhealthy_below <=
    /// degraded_below <= 1`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("interval must be greater than 0"));
        }

        if self.window_size == 0 {
            return Err(ConfigError::invalid("window_size must be at least 1"));
        }

        if self.probe_timeout.is_zero() {
            return Err(ConfigError::invalid("probe_timeout must be greater than 0"));
        }

        let in_unit = |value: f64| (0.0..=1.0).contains(&value);
        if !in_unit(self.degraded_below) || !in_unit(self.unhealthy_below) {
            return Err(ConfigError::invalid("health thresholds must be within 0.0..=1.0"));
        }

        if self.unhealthy_below > self.degraded_below {
            return Err(ConfigError::invalid(format!(
                "unhealthy_below ({}) must not exceed degraded_below ({})",
                self.unhealthy_below, self.degraded_below
            )));
        }

        Ok(())
    }
}

/// Builder for [`HealthMonitorConfig`]
#[derive(Debug, Default)]
pub struct HealthMonitorConfigBuilder {
    config: HealthMonitorConfig,
}

impl HealthMonitorConfigBuilder {
    /// Time between probes
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Samples kept per provider
    pub fn window_size(mut self, size: usize) -> Self {
        self.config.window_size = size;
        self
    }

    /// Latency threshold for `DEGRADED`
    pub fn degraded_latency(mut self, latency: Duration) -> Self {
        self.config.degraded_latency = latency;
        self
    }

    /// Deadline for one probe
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Success-rate threshold for `DEGRADED`
    pub fn degraded_below(mut self, rate: f64) -> Self {
        self.config.degraded_below = rate;
        self
    }

    /// Success-rate threshold for `UNHEALTHY`
    pub fn unhealthy_below(mut self, rate: f64) -> Self {
        self.config.unhealthy_below = rate;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// See [`HealthMonitorConfig::validate`].
    pub fn build(self) -> Result<HealthMonitorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Provider health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Probes succeed with acceptable latency
    Healthy,
    /// Probes mostly succeed but slowly or with some failures
    Degraded,
    /// The latest probe failed and most recent probes failed
    Unhealthy,
}

impl HealthStatus {
    /// Sort rank, lower is better
    pub fn rank(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeSample {
    success: bool,
    latency: Duration,
}

/// Fixed-size window of recent probe samples; the oldest sample is evicted
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<ProbeSample>,
    capacity: usize,
}

impl RollingWindow {
    /// Create an empty window holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    /// Record a sample
    pub fn push(&mut self, success: bool, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ProbeSample { success, latency });
    }

    /// Samples currently held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been recorded
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Successful samples in the window
    pub fn success_count(&self) -> usize {
        self.samples.iter().filter(|s| s.success).count()
    }

    /// Fraction of successful samples, `None` when empty
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.success_count() as f64 / self.samples.len() as f64)
    }

    /// Mean latency of successful samples, `None` when there are none
    pub fn average_success_latency(&self) -> Option<Duration> {
        let (total, count) = self
            .samples
            .iter()
            .filter(|s| s.success)
            .fold((Duration::ZERO, 0u32), |(total, count), s| (total + s.latency, count + 1));
        (count > 0).then(|| total / count)
    }
}

/// Point-in-time health of one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealthSnapshot {
    /// Provider identifier
    pub provider_id: ProviderId,
    /// Current status
    pub status: HealthStatus,
    /// Wall-clock time of the latest probe
    pub last_check_time: Option<DateTime<Utc>>,
    /// Duration of the latest probe in milliseconds
    pub last_response_time_ms: Option<u64>,
    /// Successful samples in the window
    pub rolling_success_count: usize,
    /// Samples in the window
    pub rolling_total_count: usize,
    /// Failed probes since the last success
    pub consecutive_failures: u32,
    /// Mean latency of successful samples in milliseconds
    pub average_latency_ms: Option<u64>,
}

/// A provider's status changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Provider identifier
    pub provider_id: ProviderId,
    /// Status before the sample
    pub previous: HealthStatus,
    /// Status after the sample
    pub current: HealthStatus,
}

/// Health monitor lifecycle errors
#[derive(Debug, Error)]
pub enum HealthMonitorError {
    /// `start()` called while running
    #[error("Health monitor already running")]
    AlreadyRunning,

    /// `stop()` called while stopped
    #[error("Health monitor not running")]
    NotRunning,

    /// Probe tasks did not finish in time and were aborted
    #[error("Health monitor tasks did not stop within {duration:?}")]
    StopTimeout {
        /// Time allowed
        duration: Duration,
    },

    /// No provider registered under this id
    #[error("Unknown provider: {provider_id}")]
    UnknownProvider {
        /// Requested identifier
        provider_id: ProviderId,
    },
}

/// Evaluate the status rules for a window
pub fn evaluate_status(
    window: &RollingWindow,
    last_probe_succeeded: bool,
    config: &HealthMonitorConfig,
) -> HealthStatus {
    let Some(rate) = window.success_rate() else {
        return HealthStatus::Healthy;
    };

    if !last_probe_succeeded && rate < config.unhealthy_below {
        return HealthStatus::Unhealthy;
    }

    let slow = window.average_success_latency().is_some_and(|avg| avg > config.degraded_latency);
    if rate < config.degraded_below || slow {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
struct SlotState {
    window: RollingWindow,
    status: HealthStatus,
    last_check_time: Option<DateTime<Utc>>,
    last_response_time: Option<Duration>,
    consecutive_failures: u32,
}

struct ProviderSlot {
    entry: ProviderRegistryEntry,
    order: usize,
    state: Mutex<SlotState>,
    // Serializes scheduled and manual probes of one provider.
    probe_gate: tokio::sync::Mutex<()>,
}

impl ProviderSlot {
    fn new(entry: ProviderRegistryEntry, order: usize, window_size: usize) -> Self {
        Self {
            entry,
            order,
            state: Mutex::new(SlotState {
                window: RollingWindow::new(window_size),
                status: HealthStatus::Healthy,
                last_check_time: None,
                last_response_time: None,
                consecutive_failures: 0,
            }),
            probe_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn id(&self) -> &ProviderId {
        &self.entry.provider_id
    }

    fn snapshot(&self) -> ProviderHealthSnapshot {
        let state = self.state.lock();
        ProviderHealthSnapshot {
            provider_id: self.entry.provider_id.clone(),
            status: state.status,
            last_check_time: state.last_check_time,
            last_response_time_ms: state.last_response_time.map(millis),
            rolling_success_count: state.window.success_count(),
            rolling_total_count: state.window.len(),
            consecutive_failures: state.consecutive_failures,
            average_latency_ms: state.window.average_success_latency().map(millis),
        }
    }
}

struct MonitorShared {
    config: HealthMonitorConfig,
    slots: RwLock<Vec<Arc<ProviderSlot>>>,
    events: EventBus<StatusChange>,
}

impl MonitorShared {
    fn slot(&self, provider_id: &ProviderId) -> Option<Arc<ProviderSlot>> {
        self.slots.read().iter().find(|slot| slot.id() == provider_id).cloned()
    }

    fn all_slots(&self) -> Vec<Arc<ProviderSlot>> {
        self.slots.read().clone()
    }

    async fn probe_slot(&self, slot: &ProviderSlot) {
        let _gate = slot.probe_gate.lock().await;
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.probe_timeout, slot.entry.probe.probe()).await;
        let latency = started.elapsed();

        let success = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(failure)) => {
                debug!(provider = %slot.id(), error = %failure, "Health probe failed");
                false
            }
            Err(_) => {
                debug!(
                    provider = %slot.id(),
                    timeout_ms = millis(self.config.probe_timeout),
                    "Health probe timed out"
                );
                false
            }
        };

        self.record(slot, success, latency);
    }

    fn record(&self, slot: &ProviderSlot, success: bool, latency: Duration) {
        let change = {
            let mut state = slot.state.lock();
            state.window.push(success, latency);
            state.last_check_time = Some(Utc::now());
            state.last_response_time = Some(latency);
            state.consecutive_failures =
                if success { 0 } else { state.consecutive_failures.saturating_add(1) };

            let previous = state.status;
            let current = evaluate_status(&state.window, success, &self.config);
            state.status = current;
            (previous != current).then(|| StatusChange {
                provider_id: slot.id().clone(),
                previous,
                current,
            })
        };

        if let Some(change) = change {
            info!(
                provider = %change.provider_id,
                previous = %change.previous,
                current = %change.current,
                "Provider health status changed"
            );
            self.events.emit(change);
        }
    }
}

struct MonitorRuntime {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    spawner: Handle,
}

impl MonitorRuntime {
    fn spawn_loop(&mut self, shared: &Arc<MonitorShared>, slot: Arc<ProviderSlot>) {
        let task = run_provider_loop(Arc::clone(shared), slot, self.token.child_token());
        self.handles.push(self.spawner.spawn(task));
    }
}

/// Background health monitor for a set of providers
///
/// ```no_run
/// use std::time::Duration;
///
/// use maplink_core::resilience::health::{HealthMonitor, HealthMonitorConfig};
/// use maplink_core::resilience::provider::{probe_fn, ProviderRegistryEntry};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let monitor = HealthMonitor::new(HealthMonitorConfig::default())?;
/// let osm = ProviderRegistryEntry::new("osm", probe_fn(|| async { Ok(()) }), 1);
///
/// monitor.start(vec![osm]).await?;
/// tokio::time::sleep(Duration::from_secs(60)).await;
/// println!("{:?}", monitor.snapshots());
/// monitor.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct HealthMonitor {
    shared: Arc<MonitorShared>,
    runtime: Mutex<Option<MonitorRuntime>>,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let providers = self.shared.slots.read().len();
        f.debug_struct("HealthMonitor")
            .field("config", &self.shared.config)
            .field("providers", &providers)
            .field("running", &self.is_running())
            .finish()
    }
}

impl HealthMonitor {
    /// Create a stopped monitor with no providers
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid configuration.
    pub fn new(config: HealthMonitorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(MonitorShared {
                config,
                slots: RwLock::new(Vec::new()),
                events: EventBus::new(),
            }),
            runtime: Mutex::new(None),
        })
    }

    /// Monitor configuration
    pub fn config(&self) -> &HealthMonitorConfig {
        &self.shared.config
    }

    /// Register providers
    ///
    /// Registration is additive: an id that is already known keeps its
    /// entry and its health history. While the schedule is running, each
    /// newly added provider gets its own probe loop right away.
    pub fn register(&self, providers: impl IntoIterator<Item = ProviderRegistryEntry>) {
        let mut runtime = self.runtime.lock();
        let added = self.insert_slots(providers);
        if let Some(runtime) = runtime.as_mut() {
            for slot in added {
                debug!(provider = %slot.id(), "Provider registered while running");
                runtime.spawn_loop(&self.shared, slot);
            }
        }
    }

    fn insert_slots(&self, providers: impl IntoIterator<Item = ProviderRegistryEntry>) -> Vec<Arc<ProviderSlot>> {
        let mut slots = self.shared.slots.write();
        let mut added = Vec::new();
        for entry in providers {
            if slots.iter().any(|slot| slot.id() == &entry.provider_id) {
                continue;
            }
            let order = slots.len();
            let slot = Arc::new(ProviderSlot::new(entry, order, self.shared.config.window_size));
            slots.push(Arc::clone(&slot));
            added.push(slot);
        }
        added
    }

    /// Register `providers` and start probing every registered provider on
    /// the configured interval
    ///
    /// The first probe of each provider runs immediately.
    ///
    /// # Errors
    ///
    /// Returns [`HealthMonitorError::AlreadyRunning`] if already started.
    #[instrument(skip_all)]
    pub async fn start(&self, providers: Vec<ProviderRegistryEntry>) -> Result<(), HealthMonitorError> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(HealthMonitorError::AlreadyRunning);
        }

        self.insert_slots(providers);
        let mut started = MonitorRuntime {
            token: CancellationToken::new(),
            handles: Vec::new(),
            spawner: Handle::current(),
        };
        for slot in self.shared.all_slots() {
            started.spawn_loop(&self.shared, slot);
        }

        info!(
            providers = started.handles.len(),
            interval_ms = millis(self.shared.config.interval),
            "Health monitor started"
        );
        *runtime = Some(started);
        Ok(())
    }

    /// Stop probing
    ///
    /// Probes already in flight complete and are recorded; no further ticks
    /// run.
    ///
    /// # Errors
    ///
    /// Returns [`HealthMonitorError::NotRunning`] if not started, or
    /// [`HealthMonitorError::StopTimeout`] if tasks did not finish within
    /// `probe_timeout` plus a grace period (they are aborted).
    #[instrument(skip_all)]
    pub async fn stop(&self) -> Result<(), HealthMonitorError> {
        let MonitorRuntime { token, handles, .. } =
            self.runtime.lock().take().ok_or(HealthMonitorError::NotRunning)?;

        info!("Stopping health monitor");
        token.cancel();

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let join_timeout = self.shared.config.probe_timeout + STOP_GRACE;
        match tokio::time::timeout(join_timeout, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        warn!(error = %err, "Health probe task ended abnormally");
                    }
                }
                info!("Health monitor stopped");
                Ok(())
            }
            Err(_) => {
                for abort in aborts {
                    abort.abort();
                }
                warn!(timeout_ms = millis(join_timeout), "Health monitor stop timed out");
                Err(HealthMonitorError::StopTimeout { duration: join_timeout })
            }
        }
    }

    /// Whether the background schedule is running
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Probe every registered provider once, concurrently
    ///
    /// Returns the resulting snapshots in registration order.
    pub async fn probe_all(&self) -> Vec<ProviderHealthSnapshot> {
        let slots = self.shared.all_slots();
        join_all(slots.iter().map(|slot| self.shared.probe_slot(slot))).await;
        slots.iter().map(|slot| slot.snapshot()).collect()
    }

    /// Probe one provider now
    ///
    /// # Errors
    ///
    /// Returns [`HealthMonitorError::UnknownProvider`] for an unregistered id.
    pub async fn probe_provider(
        &self,
        provider_id: &ProviderId,
    ) -> Result<ProviderHealthSnapshot, HealthMonitorError> {
        let slot = self.slot_or_err(provider_id)?;
        self.shared.probe_slot(&slot).await;
        Ok(slot.snapshot())
    }

    /// Feed an externally observed sample (for example from real traffic)
    ///
    /// # Errors
    ///
    /// Returns [`HealthMonitorError::UnknownProvider`] for an unregistered id.
    pub fn record_sample(
        &self,
        provider_id: &ProviderId,
        success: bool,
        latency: Duration,
    ) -> Result<(), HealthMonitorError> {
        let slot = self.slot_or_err(provider_id)?;
        self.shared.record(&slot, success, latency);
        Ok(())
    }

    /// Snapshot for one provider
    pub fn get_snapshot(&self, provider_id: &ProviderId) -> Option<ProviderHealthSnapshot> {
        self.shared.slot(provider_id).map(|slot| slot.snapshot())
    }

    /// Snapshots for all providers in registration order
    pub fn snapshots(&self) -> Vec<ProviderHealthSnapshot> {
        self.shared.all_slots().iter().map(|slot| slot.snapshot()).collect()
    }

    /// Current status of one provider
    pub fn status_of(&self, provider_id: &ProviderId) -> Option<HealthStatus> {
        self.shared.slot(provider_id).map(|slot| slot.state.lock().status)
    }

    /// Best provider to route to
    ///
    /// Considers only providers for which `is_open` returns `false`. Picks
    /// the `HEALTHY` provider with the lowest average latency, otherwise the
    /// best `DEGRADED` one, otherwise `None`. Providers without latency data
    /// sort after those with it; ties break on priority, then registration
    /// order.
    pub fn recommended_provider(&self, is_open: impl Fn(&ProviderId) -> bool) -> Option<ProviderId> {
        struct Candidate {
            id: ProviderId,
            status: HealthStatus,
            latency: Option<Duration>,
            priority: u32,
            order: usize,
        }

        let candidates: Vec<Candidate> = self
            .shared
            .all_slots()
            .iter()
            .filter(|slot| !is_open(slot.id()))
            .map(|slot| {
                let state = slot.state.lock();
                Candidate {
                    id: slot.id().clone(),
                    status: state.status,
                    latency: state.window.average_success_latency(),
                    priority: slot.entry.priority,
                    order: slot.order,
                }
            })
            .collect();

        [HealthStatus::Healthy, HealthStatus::Degraded].into_iter().find_map(|wanted| {
            candidates
                .iter()
                .filter(|c| c.status == wanted)
                .min_by_key(|c| (c.latency.is_none(), c.latency, c.priority, c.order))
                .map(|c| c.id.clone())
        })
    }

    /// Register a synchronous status-change listener
    pub fn on_status_change(
        &self,
        listener: impl Fn(&StatusChange) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.events.add_listener(listener)
    }

    /// Remove a listener added with [`on_status_change`](Self::on_status_change)
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.events.remove_listener(id)
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.shared.events.subscribe()
    }

    fn slot_or_err(&self, provider_id: &ProviderId) -> Result<Arc<ProviderSlot>, HealthMonitorError> {
        self.shared
            .slot(provider_id)
            .ok_or_else(|| HealthMonitorError::UnknownProvider { provider_id: provider_id.clone() })
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.token.cancel();
        }
    }
}

async fn run_provider_loop(shared: Arc<MonitorShared>, slot: Arc<ProviderSlot>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(provider = %slot.id(), "Health probe loop started");

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                // Runs to completion even if cancellation arrives meanwhile.
                shared.probe_slot(&slot).await;
            }
        }
    }

    debug!(provider = %slot.id(), "Health probe loop stopped");
}
