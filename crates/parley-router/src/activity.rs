//! Per-session speech activity: who is currently speaking.
//!
//! The store is written only by [`SpeechActivityMiddleware`] and read by any
//! number of subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_core::{Flow, ListenerSet, Subscription, WireEvent};
use serde::Serialize;
use tracing::trace;

use crate::middleware::{IncomingContext, IncomingMiddleware};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechSnapshot {
    pub user_speaking: bool,
    pub assistant_speaking: bool,
}

#[derive(Debug, Default)]
pub struct SpeechActivity {
    state: Mutex<SpeechSnapshot>,
    listeners: ListenerSet<SpeechSnapshot>,
}

impl SpeechActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SpeechSnapshot {
        *self.state.lock()
    }

    /// Notified with every distinct new snapshot.
    pub fn subscribe(&self, f: impl Fn(&SpeechSnapshot) + Send + Sync + 'static) -> Subscription {
        self.listeners.add(f)
    }

    /// Reset to silence and drop all subscribers.
    pub fn dispose(&self) {
        *self.state.lock() = SpeechSnapshot::default();
        self.listeners.clear();
    }

    fn apply(&self, kind: &str) {
        let next = {
            let mut state = self.state.lock();
            let before = *state;
            match kind {
                "input_audio_buffer.speech_started" => state.user_speaking = true,
                "input_audio_buffer.speech_stopped" => state.user_speaking = false,
                "output_audio_buffer.started" => state.assistant_speaking = true,
                "output_audio_buffer.stopped" | "output_audio_buffer.cleared" => {
                    state.assistant_speaking = false;
                }
                _ => return,
            }
            if *state == before {
                return;
            }
            *state
        };
        trace!(?next, "speech activity changed");
        self.listeners.emit(&next);
    }
}

/// Incoming stage that keeps a [`SpeechActivity`] store current.
pub struct SpeechActivityMiddleware {
    store: Arc<SpeechActivity>,
}

impl SpeechActivityMiddleware {
    pub fn new(store: Arc<SpeechActivity>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl IncomingMiddleware for SpeechActivityMiddleware {
    async fn handle(&self, event: &WireEvent, _cx: &IncomingContext<'_>) -> Flow {
        if let Some(kind) = event.kind() {
            self.store.apply(kind);
        }
        Flow::Continue
    }
}
