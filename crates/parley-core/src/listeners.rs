//! Copy-on-emit callback registries.
//!
//! Emission snapshots the registered callbacks under a short lock and invokes
//! them after releasing it, so callbacks may subscribe or unsubscribe (on this
//! or any other set) without deadlocking and without skipping their peers.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entries<T: ?Sized> {
    next_id: u64,
    callbacks: Vec<(u64, Callback<T>)>,
}

/// A set of callbacks notified with `&T`.
pub struct ListenerSet<T: ?Sized> {
    entries: Arc<Mutex<Entries<T>>>,
}

impl<T: ?Sized + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 0,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Register a callback. The returned handle removes exactly this callback.
    pub fn add(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut entries = self.entries.lock();
            let id = entries.next_id;
            entries.next_id += 1;
            entries.callbacks.push((id, Arc::new(callback)));
            id
        };
        let weak: Weak<Mutex<Entries<T>>> = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = weak.upgrade() {
                entries.lock().callbacks.retain(|(cid, _)| *cid != id);
            }
        })
    }

    /// Notify every callback registered at call time.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .entries
            .lock()
            .callbacks
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in snapshot {
            cb(value);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.entries.lock().callbacks.len())
            .finish()
    }
}

/// Handle returned by every `on`/`subscribe` call.
///
/// Dropping the handle keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "keep the subscription to be able to unsubscribe later"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// A subscription that removes nothing.
    pub fn noop() -> Self {
        Self { remove: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
