//! Change notifications
//!
//! Components collect events while holding their state lock and hand them to
//! an [`EventBus`] only after the lock is released, so listeners never run
//! re-entrantly inside a transition. Each event goes to two audiences:
//! synchronous listeners registered with [`EventBus::add_listener`], and
//! async consumers holding a [`broadcast::Receiver`].

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

/// Default capacity of the broadcast channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Handle returned by [`EventBus::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Listener list plus broadcast channel for one event type
pub struct EventBus<E> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus with the default channel capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus whose broadcast channel buffers `capacity` events
    ///
    /// Slow receivers that fall further behind observe
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { listeners: RwLock::new(Vec::new()), next_id: AtomicU64::new(1), sender }
    }

    /// Register a synchronous listener
    pub fn add_listener(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns `false` if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Deliver one event to every listener and subscriber
    ///
    /// Must not be called while holding the lock that produced the event.
    /// A panicking listener is logged and skipped.
    pub fn emit(&self, event: E) {
        let listeners: Vec<Listener<E>> =
            self.listeners.read().iter().map(|(_, listener)| Arc::clone(listener)).collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!("Event listener panicked; continuing with remaining listeners");
            }
        }

        // No receivers is fine.
        let _ = self.sender.send(event);
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}
