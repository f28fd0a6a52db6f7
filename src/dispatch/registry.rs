//! Listener trait and the thread-safe registry the dispatcher reads from.

use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::events::Event;

/// Receives every event the dispatcher delivers.
///
/// Called from the dispatcher worker, one event at a time, in queue order.
/// A slow listener delays delivery to everyone after it, so hand heavy work
/// off to your own task. A panic is caught and logged; delivery continues
/// with the next listener.
pub trait Listener: Send + Sync {
    /// Handle one event. The reference is only valid for this call.
    fn on_event(&self, event: &Event);
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Handle returned by [`ListenerRegistry::add`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl Display for ListenerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Entry = (ListenerId, Arc<dyn Listener>);

/// Set of registered listeners.
///
/// Cheap to clone; clones share the same set. Adding or removing never
/// affects a [`snapshot`](Self::snapshot) that was already taken.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    entries: Arc<RwLock<Vec<Entry>>>,
    next_id: Arc<AtomicU64>,
}

impl ListenerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Registering the same listener twice delivers
    /// every event to it twice.
    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a listener; returns `false` if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Copy of the current membership.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for ListenerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish_non_exhaustive()
    }
}
