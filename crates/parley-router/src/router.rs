//! Inbound Event Router.
//!
//! Each raw event passes through the incoming middleware chain, reaches the
//! `on_event` hook, and is classified into at most a couple of semantic
//! events which are fanned out to listeners registered per [`SemanticKind`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use parley_core::{
    AssistantChannel, ErrorScope, Flow, ListenerSet, SemanticEvent, SemanticKind,
    Subscription, TerminalStatus, WireEvent,
};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::hooks::{SessionHooks, ToolCall};
use crate::middleware::{IncomingContext, IncomingMiddleware, SessionView};
use crate::sender::MessageSender;

pub struct EventRouter {
    sender: Arc<MessageSender>,
    hooks: Arc<dyn SessionHooks>,
    middleware: Vec<Arc<dyn IncomingMiddleware>>,
    client: Mutex<Option<Weak<dyn SessionView>>>,
    listeners: Mutex<HashMap<SemanticKind, Arc<ListenerSet<SemanticEvent>>>>,
    /// call id -> argument fragments received so far
    tool_args: Mutex<HashMap<String, String>>,
    tool_tasks: Mutex<JoinSet<()>>,
}

impl EventRouter {
    pub fn new(
        sender: Arc<MessageSender>,
        hooks: Arc<dyn SessionHooks>,
        middleware: Vec<Arc<dyn IncomingMiddleware>>,
    ) -> Self {
        Self {
            sender,
            hooks,
            middleware,
            client: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            tool_args: Mutex::new(HashMap::new()),
            tool_tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn sender(&self) -> &Arc<MessageSender> {
        &self.sender
    }

    /// Session handed to incoming middleware. Held weakly since the session
    /// owns the router.
    pub fn set_client(&self, client: Weak<dyn SessionView>) {
        *self.client.lock() = Some(client);
    }

    /// Register `handler` for one kind of semantic event.
    pub fn on(
        &self,
        kind: SemanticKind,
        handler: impl Fn(&SemanticEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let set = Arc::clone(self.listeners.lock().entry(kind).or_default());
        set.add(handler)
    }

    pub fn listener_count(&self, kind: SemanticKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, |set| set.len())
    }

    fn emit(&self, event: SemanticEvent) {
        let set = self.listeners.lock().get(&event.kind()).cloned();
        if let Some(set) = set {
            set.emit(&event);
        }
    }

    /// Route raw channel text. Malformed text is reported and dropped.
    pub async fn route_text(&self, text: &str) {
        if let Some(event) = self.sender.channel().decode(text) {
            self.route(event).await;
        }
    }

    /// Route one parsed event through middleware, hooks, and classification.
    #[instrument(skip_all, fields(kind = event.kind().unwrap_or_default()))]
    pub async fn route(&self, event: WireEvent) {
        let client = self.client.lock().as_ref().and_then(Weak::upgrade);
        let cx = IncomingContext::new(&self.sender, client);
        let mut current = event;
        for stage in &self.middleware {
            match stage.handle(&current, &cx).await {
                Flow::Continue => {}
                Flow::Replace(next) => current = next,
                Flow::Stop => {
                    debug!("incoming middleware stopped event");
                    return;
                }
            }
        }

        self.hooks.on_event(&current);
        self.classify(&current);
    }

    fn classify(&self, event: &WireEvent) {
        let Some(kind) = event.kind() else {
            debug!("inbound event without type");
            return;
        };

        match kind {
            "conversation.item.created" | "conversation.item.added" => self.item_created(event),

            "response.created" => self.emit(SemanticEvent::AssistantResponseStarted {
                response_id: response_id(event),
            }),

            "conversation.item.input_audio_transcription.delta" => {
                let item_id = str_or_empty(event, "item_id");
                let delta = str_or_empty(event, "delta");
                if self.hooks.on_user_transcription_delta(&item_id, &delta).is_consumed() {
                    return;
                }
                self.emit(SemanticEvent::UserDelta { item_id, delta });
            }

            "conversation.item.input_audio_transcription.completed" => {
                let item_id = str_or_empty(event, "item_id");
                let transcript = str_or_empty(event, "transcript");
                if self
                    .hooks
                    .on_user_transcription_completed(&item_id, &transcript)
                    .is_consumed()
                {
                    return;
                }
                self.emit(SemanticEvent::UserCompleted { item_id, transcript });
            }

            "conversation.item.input_audio_transcription.failed" => {
                let error = event
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.emit(SemanticEvent::UserFailed {
                    item_id: str_or_empty(event, "item_id"),
                    error,
                });
            }

            "conversation.item.truncated" => self.emit(SemanticEvent::UserTruncated {
                item_id: str_or_empty(event, "item_id"),
            }),

            "response.audio_transcript.delta" | "response.output_audio_transcript.delta" => {
                self.assistant_delta(event, AssistantChannel::AudioTranscript);
            }

            "response.text.delta" | "response.output_text.delta" => {
                self.assistant_delta(event, AssistantChannel::Text);
            }

            "response.audio_transcript.done" | "response.output_audio_transcript.done" => {
                let text = event.str_field("transcript").map(str::to_string);
                self.assistant_completed(response_id(event), TerminalStatus::Done, text);
            }

            "response.text.done" | "response.output_text.done" => {
                let text = event.str_field("text").map(str::to_string);
                self.assistant_completed(response_id(event), TerminalStatus::Done, text);
            }

            "response.done" | "response.completed" => {
                let cancelled = event
                    .get("response")
                    .and_then(|r| r.get("status"))
                    .and_then(Value::as_str)
                    .is_some_and(|s| s == "cancelled" || s == "canceled");
                let status = if cancelled {
                    TerminalStatus::Canceled
                } else {
                    TerminalStatus::Done
                };
                self.assistant_completed(response_id(event), status, None);
            }

            "response.cancelled" | "response.canceled" => {
                self.assistant_completed(response_id(event), TerminalStatus::Canceled, None);
            }

            "response.function_call_arguments.delta" => {
                let call_id = str_or_empty(event, "call_id");
                let delta = str_or_empty(event, "delta");
                self.tool_args
                    .lock()
                    .entry(call_id.clone())
                    .or_default()
                    .push_str(&delta);
                self.emit(SemanticEvent::ToolCallDelta { call_id, delta });
            }

            "response.function_call_arguments.done" => self.tool_call_done(event),

            "error" => {
                let error = event.get("error");
                let message = error
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error")
                    .to_string();
                let code = error
                    .and_then(|e| e.get("code"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                warn!(code = code.as_deref().unwrap_or_default(), message = %message, "server error event");
                self.hooks.on_server_error(&message, event);
                self.emit(SemanticEvent::Error {
                    scope: ErrorScope::Server,
                    message,
                    code,
                    raw: Some(event.as_value().clone()),
                });
            }

            other => debug!(kind = other, "unhandled inbound event"),
        }
    }

    fn item_created(&self, event: &WireEvent) {
        let Some(item) = event.get("item") else {
            return;
        };
        if item.get("role").and_then(Value::as_str) != Some("user") {
            return;
        }
        let item_id = item
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.emit(SemanticEvent::UserItemStarted {
            item_id: item_id.clone(),
        });

        // typed input arrives complete and never streams
        if let Some(text) = literal_text(item) {
            self.emit(SemanticEvent::UserCompleted {
                item_id,
                transcript: text,
            });
        }
    }

    fn assistant_delta(&self, event: &WireEvent, channel: AssistantChannel) {
        let response_id = response_id(event);
        let delta = str_or_empty(event, "delta");
        let verdict = match channel {
            AssistantChannel::AudioTranscript => {
                self.hooks.on_assistant_transcript_delta(&response_id, &delta)
            }
            AssistantChannel::Text => self.hooks.on_assistant_text_delta(&response_id, &delta),
        };
        if verdict.is_consumed() {
            return;
        }
        self.emit(SemanticEvent::AssistantDelta {
            response_id,
            item_id: event.str_field("item_id").map(str::to_string),
            channel,
            delta,
        });
    }

    fn assistant_completed(&self, response_id: String, status: TerminalStatus, text: Option<String>) {
        if self
            .hooks
            .on_assistant_completed(&response_id, status, text.as_deref())
            .is_consumed()
        {
            return;
        }
        self.emit(SemanticEvent::AssistantCompleted {
            response_id,
            status,
            text,
        });
    }

    fn tool_call_done(&self, event: &WireEvent) {
        let call_id = str_or_empty(event, "call_id");
        let name = str_or_empty(event, "name");
        let buffered = self.tool_args.lock().remove(&call_id);
        let raw = buffered
            .filter(|s| !s.is_empty())
            .or_else(|| {
                event
                    .str_field("arguments")
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "{}".to_string());

        let args: Value = match serde_json::from_str(&raw) {
            Ok(args) => args,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "invalid tool call arguments");
                self.emit(SemanticEvent::Error {
                    scope: ErrorScope::Tool,
                    message: format!("invalid arguments for tool call {call_id}: {e}"),
                    code: None,
                    raw: Some(event.as_value().clone()),
                });
                return;
            }
        };

        self.emit(SemanticEvent::ToolCallDone {
            call_id: call_id.clone(),
            name: name.clone(),
            args: args.clone(),
        });

        let hooks = Arc::clone(&self.hooks);
        let sender = Arc::clone(&self.sender);
        let call = ToolCall {
            name,
            args,
            call_id,
        };
        let mut tasks = self.tool_tasks.lock();
        while tasks.try_join_next().is_some() {}
        let _ = tasks.spawn(async move {
            let call_id = call.call_id.clone();
            if let Some(output) = hooks.on_tool_call(call).await {
                let _ = sender.send_tool_output(&call_id, &output).await;
                let _ = sender.send_response(None).await;
            }
        });
    }

    /// Accumulated argument text for a call that has not completed yet.
    pub fn buffered_args(&self, call_id: &str) -> Option<String> {
        self.tool_args.lock().get(call_id).cloned()
    }

    /// Wait for every tool hook spawned so far to finish.
    pub async fn drain_tool_calls(&self) {
        let mut tasks = std::mem::take(&mut *self.tool_tasks.lock());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(error = %e, "tool hook panicked");
                }
            }
        }
    }

    /// Drop listeners and buffered arguments and abort pending tool hooks.
    /// Safe to call repeatedly.
    pub fn cleanup(&self) {
        let sets: Vec<_> = self.listeners.lock().drain().map(|(_, set)| set).collect();
        for set in sets {
            set.clear();
        }
        self.tool_args.lock().clear();
        self.tool_tasks.lock().abort_all();
    }
}

fn str_or_empty(event: &WireEvent, key: &str) -> String {
    event.str_field(key).unwrap_or_default().to_string()
}

/// `response.id` for whole-response events, `response_id` for part events.
fn response_id(event: &WireEvent) -> String {
    event
        .get("response")
        .and_then(|r| r.get("id"))
        .and_then(Value::as_str)
        .or_else(|| event.str_field("response_id"))
        .unwrap_or_default()
        .to_string()
}

/// Finished text carried by a created item, if any.
fn literal_text(item: &Value) -> Option<String> {
    let parts: Vec<&str> = item
        .get("content")?
        .as_array()?
        .iter()
        .filter(|part| {
            matches!(
                part.get("type").and_then(Value::as_str),
                Some("input_text" | "text")
            )
        })
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .filter(|text| !text.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}
