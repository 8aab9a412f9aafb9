//! Resilience patterns for map provider calls
//!
//! Layering, from the inside out:
//!
//! 1. [`classifier`] turns a raw [`ProviderFailure`](classifier::ProviderFailure)
//!    into a [`CategorizedError`](classifier::CategorizedError).
//! 2. [`retry`] re-runs one provider call with exponential backoff, using the
//!    category to decide whether another attempt is worthwhile.
//! 3. [`circuit_breaker`] wraps the whole retry sequence per provider and
//!    fails fast while a provider is known to be down.
//! 4. [`health`] probes providers in the background and scores them.
//! 5. [`coordinator`] ranks providers by circuit state and health, then falls
//!    back from one to the next.
//!
//! [`events`] carries state-change notifications for all of the above.

pub mod circuit_breaker;
pub mod classifier;
pub mod coordinator;
pub mod dedup;
pub mod events;
pub mod health;
pub mod provider;
pub mod retry;
