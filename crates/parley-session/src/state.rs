//! Connection lifecycle state machine.

use std::collections::VecDeque;

use parking_lot::Mutex;
use parley_core::{ConnectionState, ListenerSet, Subscription};
use tracing::info;

struct Inner {
    current: ConnectionState,
    /// Transitions written but not yet delivered, oldest first.
    pending: VecDeque<ConnectionState>,
    delivering: bool,
}

/// Single authoritative holder of a session's [`ConnectionState`].
///
/// Listeners see every distinct new state exactly once, in the order the
/// states were written, even when transitions race on different tasks or a
/// listener transitions from inside its callback. A transition to the
/// current state is a no-op.
pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
    listeners: ListenerSet<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                current: ConnectionState::Idle,
                pending: VecDeque::new(),
                delivering: false,
            }),
            listeners: ListenerSet::new(),
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.lock().current
    }

    /// Move to `next`. Returns whether the state changed.
    pub fn transition(&self, next: ConnectionState) -> bool {
        self.transition_if(|_| true, next)
    }

    /// Move to `next` only while the current state satisfies `allowed`.
    ///
    /// Whoever finds no delivery in progress delivers the whole queue, so a
    /// caller may return before its own state has reached listeners.
    pub fn transition_if(
        &self,
        allowed: impl FnOnce(ConnectionState) -> bool,
        next: ConnectionState,
    ) -> bool {
        {
            let mut inner = self.inner.lock();
            let previous = inner.current;
            if previous == next || !allowed(previous) {
                return false;
            }
            inner.current = next;
            inner.pending.push_back(next);
            info!(from = %previous, to = %next, "connection state changed");
            if inner.delivering {
                return true;
            }
            inner.delivering = true;
        }
        self.deliver();
        true
    }

    fn deliver(&self) {
        loop {
            let state = {
                let mut inner = self.inner.lock();
                match inner.pending.pop_front() {
                    Some(state) => state,
                    None => {
                        inner.delivering = false;
                        return;
                    }
                }
            };
            self.listeners.emit(&state);
        }
    }

    pub fn subscribe(
        &self,
        f: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.add(f)
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
