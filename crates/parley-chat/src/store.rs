//! Chat Reconciliation Store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use parley_core::{
    ChatMessage, ListenerSet, MessageStatus, Role, SemanticEvent, SemanticKind, Subscription,
    TerminalStatus,
};
use parley_router::EventRouter;
use tracing::trace;

/// Decides whether text is substantive enough to keep in the visible list.
pub type MeaningfulFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Text is meaningful when it contains at least one letter or digit.
pub fn default_meaningful(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

/// The router events the store consumes.
pub const CHAT_EVENTS: [SemanticKind; 8] = [
    SemanticKind::UserItemStarted,
    SemanticKind::AssistantResponseStarted,
    SemanticKind::UserDelta,
    SemanticKind::UserCompleted,
    SemanticKind::UserFailed,
    SemanticKind::UserTruncated,
    SemanticKind::AssistantDelta,
    SemanticKind::AssistantCompleted,
];

#[derive(Default)]
struct State {
    /// item id -> sequence reserved when the item was first seen
    user: HashMap<String, u64>,
    /// response id -> reserved sequence
    assistant: HashMap<String, u64>,
    /// Kept sorted by `sequence_timestamp`.
    messages: Vec<ChatMessage>,
    last_sequence: u64,
}

impl State {
    fn tracked(&mut self, role: Role) -> &mut HashMap<String, u64> {
        match role {
            Role::User => &mut self.user,
            Role::Assistant => &mut self.assistant,
        }
    }

    /// Strictly increasing, and never behind the wall clock in milliseconds.
    fn next_sequence(&mut self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.last_sequence = now.max(self.last_sequence + 1);
        self.last_sequence
    }

    fn position(&self, role: Role, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.role == role && m.source_id() == Some(id))
    }

    fn insert_ordered(&mut self, message: ChatMessage) {
        let at = self
            .messages
            .partition_point(|m| m.sequence_timestamp <= message.sequence_timestamp);
        self.messages.insert(at, message);
    }

    fn snapshot(&self) -> Arc<[ChatMessage]> {
        Arc::from(self.messages.as_slice())
    }
}

/// Turns streamed semantic events into an ordered, deduplicated message list.
pub struct ChatStore {
    state: Mutex<State>,
    listeners: ListenerSet<Arc<[ChatMessage]>>,
    meaningful: MeaningfulFn,
}

impl ChatStore {
    pub fn new() -> Self {
        Self::with_predicate(Arc::new(default_meaningful))
    }

    pub fn with_predicate(meaningful: MeaningfulFn) -> Self {
        Self {
            state: Mutex::new(State::default()),
            listeners: ListenerSet::new(),
            meaningful,
        }
    }

    /// Current message list.
    pub fn messages(&self) -> Arc<[ChatMessage]> {
        self.state.lock().snapshot()
    }

    /// Called with a fresh snapshot after every visible change.
    pub fn subscribe(
        &self,
        f: impl Fn(&Arc<[ChatMessage]>) + Send + Sync + 'static,
    ) -> Subscription {
        self.listeners.add(f)
    }

    fn publish(&self, snapshot: Arc<[ChatMessage]>) {
        trace!(messages = snapshot.len(), "chat changed");
        self.listeners.emit(&snapshot);
    }

    /// Reserve a sort position for an item that has not produced text yet.
    pub fn start(&self, role: Role, id: &str) {
        if id.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.tracked(role).contains_key(id) || state.position(role, id).is_some() {
            return;
        }
        let sequence = state.next_sequence();
        let _ = state.tracked(role).insert(id.to_string(), sequence);
    }

    /// Append streamed text, creating the message on the first fragment.
    pub fn put_delta(&self, role: Role, id: &str, delta: &str) {
        if id.is_empty() || delta.is_empty() {
            return;
        }
        let snapshot = {
            let mut state = self.state.lock();
            if let Some(index) = state.position(role, id) {
                state.messages[index].text.push_str(delta);
            } else {
                let known = state.tracked(role).get(id).copied();
                let sequence = match known {
                    Some(sequence) => sequence,
                    None => {
                        let sequence = state.next_sequence();
                        let _ = state.tracked(role).insert(id.to_string(), sequence);
                        sequence
                    }
                };
                let message =
                    new_message(role, id, delta.to_string(), sequence, MessageStatus::Streaming);
                state.insert_ordered(message);
            }
            state.snapshot()
        };
        self.publish(snapshot);
    }

    /// Close an item. Text that fails the meaningfulness predicate removes the message.
    pub fn finalize(
        &self,
        role: Role,
        id: &str,
        status: TerminalStatus,
        final_text: Option<&str>,
    ) {
        if id.is_empty() {
            return;
        }
        let snapshot = {
            let mut state = self.state.lock();
            let tracked = state.tracked(role).remove(id);
            match state.position(role, id) {
                None => {
                    let Some(text) = final_text.filter(|t| (self.meaningful)(t)) else {
                        return;
                    };
                    let sequence = match tracked {
                        Some(sequence) => sequence,
                        None => state.next_sequence(),
                    };
                    // never streamed, so it is shown as finished whatever ended it
                    let message =
                        new_message(role, id, text.to_string(), sequence, MessageStatus::Done);
                    state.insert_ordered(message);
                }
                Some(index) => {
                    let text = final_text
                        .map(str::to_string)
                        .unwrap_or_else(|| state.messages[index].text.clone());
                    if (self.meaningful)(&text) {
                        let message = &mut state.messages[index];
                        message.text = text;
                        message.status = status.into();
                    } else {
                        let _ = state.messages.remove(index);
                    }
                }
            }
            state.snapshot()
        };
        self.publish(snapshot);
    }

    /// Apply one router event.
    pub fn apply(&self, event: &SemanticEvent) {
        match event {
            SemanticEvent::UserItemStarted { item_id } => self.start(Role::User, item_id),
            SemanticEvent::AssistantResponseStarted { response_id } => {
                self.start(Role::Assistant, response_id);
            }
            SemanticEvent::UserDelta { item_id, delta } => {
                self.put_delta(Role::User, item_id, delta);
            }
            SemanticEvent::UserCompleted {
                item_id,
                transcript,
            } => self.finalize(Role::User, item_id, TerminalStatus::Done, Some(transcript.as_str())),
            SemanticEvent::UserFailed { item_id, .. } | SemanticEvent::UserTruncated { item_id } => {
                self.finalize(Role::User, item_id, TerminalStatus::Done, None);
            }
            SemanticEvent::AssistantDelta {
                response_id, delta, ..
            } => self.put_delta(Role::Assistant, response_id, delta),
            SemanticEvent::AssistantCompleted {
                response_id,
                status,
                text,
            } => self.finalize(Role::Assistant, response_id, *status, text.as_deref()),
            _ => {}
        }
    }

    /// Subscribe to the router events that feed the store.
    pub fn attach(self: &Arc<Self>, router: &EventRouter) -> Vec<Subscription> {
        CHAT_EVENTS
            .iter()
            .map(|kind| {
                let weak: Weak<Self> = Arc::downgrade(self);
                router.on(*kind, move |event| {
                    if let Some(store) = weak.upgrade() {
                        store.apply(event);
                    }
                })
            })
            .collect()
    }

    /// Drop every message, tracked item, and subscriber. Idempotent.
    pub fn destroy(&self) {
        *self.state.lock() = State::default();
        self.listeners.clear();
    }
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_message(
    role: Role,
    id: &str,
    text: String,
    sequence: u64,
    status: MessageStatus,
) -> ChatMessage {
    let (item_id, response_id) = match role {
        Role::User => (Some(id.to_string()), None),
        Role::Assistant => (None, Some(id.to_string())),
    };
    ChatMessage {
        id: format!("{role}:{id}"),
        role,
        text,
        sequence_timestamp: sequence,
        status,
        item_id,
        response_id,
    }
}
