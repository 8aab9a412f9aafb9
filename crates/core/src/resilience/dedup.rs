//! In-flight request deduplication
//!
//! Concurrent callers that ask for the same key share one retry sequence.
//! The shared call runs on its own task, so it settles and clears its key
//! even if every caller stops waiting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::classifier::ProviderFailure;
use super::retry::{RetryError, RetryExecutor, RetryPolicy};

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, RetryError>>>;

/// Collapses concurrent identical calls into one
///
/// `T` must be `Clone` because every waiting caller receives its own copy of
/// the settled result.
pub struct RequestDeduplicator<T> {
    executor: RetryExecutor,
    in_flight: Arc<Mutex<HashMap<String, SharedCall<T>>>>,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self { executor: self.executor.clone(), in_flight: Arc::clone(&self.in_flight) }
    }
}

impl<T> std::fmt::Debug for RequestDeduplicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(RetryExecutor::new())
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a deduplicator that retries through `executor`
    pub fn new(executor: RetryExecutor) -> Self {
        Self { executor, in_flight: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Run `operation` under `policy`, sharing the call with any concurrent
    /// caller using the same `key`
    ///
    /// The key is released once the call settles, successfully or not; a
    /// later call with the same key executes again. Callers that join an
    /// existing call get that call's result, whatever policy they passed.
    ///
    /// # Errors
    ///
    /// The [`RetryError`] of the shared call.
    pub async fn execute_deduplicated<F, Fut, E>(
        &self,
        key: impl Into<String>,
        policy: &RetryPolicy,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<ProviderFailure> + Send + 'static,
    {
        let key = key.into();
        let call = {
            let mut in_flight = self.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                debug!(key = %key, "Joining in-flight call");
                existing.clone()
            } else {
                let call = self.spawn_call(key.clone(), policy.clone(), operation);
                in_flight.insert(key, call.clone());
                call
            }
        };

        call.await
    }

    /// Number of keys with a call in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Whether `key` has a call in flight
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    fn spawn_call<F, Fut, E>(&self, key: String, policy: RetryPolicy, operation: F) -> SharedCall<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<ProviderFailure> + Send + 'static,
    {
        let executor = self.executor.clone();
        let in_flight = Arc::clone(&self.in_flight);

        let handle = tokio::spawn(async move {
            let result = executor.execute(&policy, operation).await;
            in_flight.lock().remove(&key);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => {
                    std::panic::resume_unwind(join_error.into_panic())
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Deduplicated call task was aborted");
                    Err(RetryError::Cancelled { attempts: Vec::new() })
                }
            }
        }
        .boxed()
        .shared()
    }
}
