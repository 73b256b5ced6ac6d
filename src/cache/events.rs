//! Cache Entry Events
//!
//! Synchronous listener dispatch with one slot per event kind. Listeners run
//! in registration order on the thread that caused the event. A panicking
//! listener is logged and skipped; delivery continues with the next one.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

/// Kind of entry change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Removed,
    Expired,
}

impl EventKind {
    const ALL: [EventKind; 4] = [
        EventKind::Created,
        EventKind::Updated,
        EventKind::Removed,
        EventKind::Expired,
    ];

    fn slot(self) -> usize {
        match self {
            EventKind::Created => 0,
            EventKind::Updated => 1,
            EventKind::Removed => 2,
            EventKind::Expired => 3,
        }
    }
}

/// A single entry change delivered to listeners
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryEvent<K, V> {
    /// What happened
    pub kind: EventKind,
    /// Name of the cache that raised the event
    pub cache: Arc<str>,
    /// Affected key
    pub key: K,
    /// New value for Created/Updated, last value for Removed/Expired.
    /// `None` only when a peer removal carried no value and the key was not
    /// held locally.
    pub value: Option<V>,
    /// Previous value, for Updated
    pub old_value: Option<V>,
}

/// Listener callback
pub type Listener<K, V> = Arc<dyn Fn(&CacheEntryEvent<K, V>) + Send + Sync>;

/// Registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Slot<K, V> = RwLock<Vec<(ListenerId, Listener<K, V>)>>;

/// Per-cache listener registry and dispatcher
pub struct EventBus<K, V> {
    cache: Arc<str>,
    slots: [Slot<K, V>; 4],
    next_id: AtomicU64,
}

impl<K, V> EventBus<K, V> {
    /// Create an empty bus for `cache`
    pub fn new(cache: impl Into<Arc<str>>) -> Self {
        Self {
            cache: cache.into(),
            slots: Default::default(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for one event kind
    pub fn register(&self, kind: EventKind, listener: Listener<K, V>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots[kind.slot()].write().push((id, listener));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn unregister(&self, id: ListenerId) -> bool {
        for slot in &self.slots {
            let mut listeners = slot.write();
            if let Some(pos) = listeners.iter().position(|(lid, _)| *lid == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    /// Check whether any listener is registered for `kind`
    pub fn has_listeners(&self, kind: EventKind) -> bool {
        !self.slots[kind.slot()].read().is_empty()
    }

    /// Number of registered listeners across all kinds
    pub fn listener_count(&self) -> usize {
        EventKind::ALL
            .iter()
            .map(|k| self.slots[k.slot()].read().len())
            .sum()
    }

    /// Drop every listener
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.write().clear();
        }
    }

    /// Build and deliver an event
    pub fn emit(&self, kind: EventKind, key: K, value: Option<V>, old_value: Option<V>) {
        if !self.has_listeners(kind) {
            return;
        }
        let event = CacheEntryEvent {
            kind,
            cache: Arc::clone(&self.cache),
            key,
            value,
            old_value,
        };
        self.dispatch(&event);
    }

    /// Deliver an event to every listener of its kind
    pub fn dispatch(&self, event: &CacheEntryEvent<K, V>) {
        // Snapshot so listeners may (un)register without deadlocking
        let listeners: Vec<_> = self.slots[event.kind.slot()].read().clone();

        for (id, listener) in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                warn!(
                    cache = %self.cache,
                    listener = id.0,
                    kind = ?event.kind,
                    "Cache entry listener panicked"
                );
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
