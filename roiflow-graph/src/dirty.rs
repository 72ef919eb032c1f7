//! Observer lists and subscription handles for slot notifications.

use crate::slot::{Slot, WeakSlot};
use roiflow_core::Dirty;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Callback invoked with the slot that became dirty and the dirty extent.
pub type DirtyCallback = dyn Fn(&Slot, &Dirty) + Send + Sync;

/// Callback invoked with a multi-slot and the affected sub-slot index.
pub type IndexCallback = dyn Fn(&Slot, usize) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverKind {
    Dirty,
    Inserted,
    Removed,
}

/// Ordered list of callbacks keyed by subscription id.
pub(crate) struct ObserverList<F: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<F>)>>,
}

impl<F: ?Sized> ObserverList<F> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, callback: Arc<F>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Callbacks in subscription order. Callers invoke them after the lock
    /// is released so a callback may subscribe or unsubscribe.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Registration of a callback on a slot.
///
/// Dropping the handle unregisters the callback, so an observer that owns
/// its subscriptions can never be called after it is gone.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    slot: WeakSlot,
    kind: ObserverKind,
    id: u64,
}

impl Subscription {
    pub(crate) fn new(slot: WeakSlot, kind: ObserverKind, id: u64) -> Self {
        Self { slot, kind, id }
    }

    /// Unregisters the callback now.
    pub fn unsubscribe(self) {}

    /// Returns true while the observed slot still exists.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.slot.upgrade().is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            slot.remove_observer(self.kind, self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
