//! Provider identity and the health probe port

use std::borrow::Borrow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::classifier::ProviderFailure;

/// Stable identifier of a map provider (`"mapbox"`, `"osm-tiles"`, ...)
///
/// Cheap to clone; used as the key for breakers, health slots and events.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    /// Create an identifier
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderId({})", self.0)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl Borrow<str> for ProviderId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for ProviderId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ProviderId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Lightweight availability check for one provider
///
/// Probes run on the health monitor's schedule, independent of real traffic.
/// A probe that returns `Err` or exceeds the probe timeout counts as a failed
/// sample; the error itself never leaves the monitor.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Perform one probe
    async fn probe(&self) -> Result<(), ProviderFailure>;
}

/// [`HealthProbe`] backed by an async closure
pub struct FnProbe<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProviderFailure>> + Send + 'static,
{
    async fn probe(&self) -> Result<(), ProviderFailure> {
        (self.f)().await
    }
}

/// Wrap an async closure as a shareable [`HealthProbe`]
///
/// ```
/// use maplink_core::resilience::provider::probe_fn;
///
/// let probe = probe_fn(|| async { Ok(()) });
/// # drop(probe);
/// ```
pub fn probe_fn<F, Fut>(f: F) -> Arc<dyn HealthProbe>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProviderFailure>> + Send + 'static,
{
    Arc::new(FnProbe { f })
}

/// Probe that issues a `GET` and treats any non-2xx status as a failure
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "http")]
impl HttpProbe {
    /// Create a probe for `url` using a shared client
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self { client, url: url.into() }
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> Result<(), ProviderFailure> {
        let response = self.client.get(&self.url).send().await?;
        ProviderFailure::check_response(response).await.map(|_| ())
    }
}

/// Static registration of one provider
///
/// Set once at startup; the coordinator and the health monitor both read
/// from the same entries.
#[derive(Clone)]
pub struct ProviderRegistryEntry {
    /// Provider identifier
    pub provider_id: ProviderId,
    /// Health probe
    pub probe: Arc<dyn HealthProbe>,
    /// Ranking priority, lower values are preferred
    pub priority: u32,
}

impl ProviderRegistryEntry {
    /// Create an entry
    pub fn new(
        provider_id: impl Into<ProviderId>,
        probe: Arc<dyn HealthProbe>,
        priority: u32,
    ) -> Self {
        Self { provider_id: provider_id.into(), probe, priority }
    }
}

impl fmt::Debug for ProviderRegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistryEntry")
            .field("provider_id", &self.provider_id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Validates `ProviderId` serde behavior.
    ///
    /// Assertions:
    /// - Confirms the identifier serializes as a bare JSON string.
    /// - Confirms deserialization yields an equal identifier.
    #[test]
    fn test_provider_id_serializes_as_string() {
        let id = ProviderId::new("mapbox");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"mapbox\"");

        let back: ProviderId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    /// Validates lookups by `&str` against `ProviderId` keys.
    #[test]
    fn test_provider_id_borrow_lookup() {
        let mut map = std::collections::HashMap::new();
        map.insert(ProviderId::new("osm"), 1);
        assert_eq!(map.get("osm"), Some(&1));
    }

    /// Validates that closure probes report their outcome.
    #[tokio::test]
    async fn test_probe_fn_reports_outcome() {
        let ok = probe_fn(|| async { Ok(()) });
        let failing = probe_fn(|| async { Err(ProviderFailure::network("connection refused")) });

        assert!(ok.probe().await.is_ok());
        assert!(failing.probe().await.is_err());
    }
}
