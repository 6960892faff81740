//! Outbound Message Sender.

use std::sync::Arc;

use parley_core::ids::ClientEventId;
use parley_core::{ErrorStage, Flow, Reporter, WireEvent};
use parley_transport::ControlChannelManager;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::middleware::OutgoingMiddleware;

/// Options for [`MessageSender::send_response_strict`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StrictResponse {
    pub instructions: String,
    /// Additional `response` fields (modalities, voice, tools...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StrictResponse {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            extra: Map::new(),
        }
    }
}

/// Writes events to the control channel through the outgoing middleware chain.
///
/// Sends never fail loudly: every failure is a recoverable `data_channel`
/// warning and the call returns `false`.
pub struct MessageSender {
    channel: Arc<ControlChannelManager>,
    reporter: Reporter,
    middleware: Vec<Arc<dyn OutgoingMiddleware>>,
}

impl MessageSender {
    pub fn new(
        channel: Arc<ControlChannelManager>,
        reporter: Reporter,
        middleware: Vec<Arc<dyn OutgoingMiddleware>>,
    ) -> Self {
        Self {
            channel,
            reporter,
            middleware,
        }
    }

    pub fn channel(&self) -> &Arc<ControlChannelManager> {
        &self.channel
    }

    /// Send one event. Returns whether it was written.
    pub async fn send_raw(&self, event: WireEvent) -> bool {
        let kind = event.kind().unwrap_or("<untyped>").to_string();
        if !self.channel.is_open() {
            self.reporter.warn(
                ErrorStage::DataChannel,
                format!("cannot send {kind}: control channel is not open"),
            );
            return false;
        }

        let mut current = event;
        for stage in &self.middleware {
            match stage.handle(&current).await {
                Flow::Continue => {}
                Flow::Replace(next) => current = next,
                Flow::Stop => {
                    debug!(kind = %kind, "outgoing middleware stopped event");
                    return false;
                }
            }
        }

        if current.get("event_id").is_none() {
            current.set("event_id", json!(ClientEventId::new().as_str()));
        }

        // middleware may have awaited; the channel is re-checked by the write
        match self.channel.send(&current) {
            Ok(()) => true,
            Err(e) => {
                self.reporter
                    .warn(ErrorStage::DataChannel, format!("failed to send {kind}: {e}"));
                false
            }
        }
    }

    /// `response.create` with optional response parameters.
    pub async fn send_response(&self, params: Option<Value>) -> bool {
        let response = params.unwrap_or_else(|| json!({}));
        self.send_raw(WireEvent::new(json!({
            "type": "response.create",
            "response": response,
        })))
        .await
    }

    /// `response.create` with mandatory instructions. Blank instructions are refused.
    pub async fn send_response_strict(&self, options: StrictResponse) -> bool {
        if options.instructions.trim().is_empty() {
            self.reporter.warn(
                ErrorStage::DataChannel,
                "strict response request needs non-empty instructions",
            );
            return false;
        }
        let response = match serde_json::to_value(&options) {
            Ok(v) => v,
            Err(e) => {
                self.reporter.warn(ErrorStage::DataChannel, e);
                return false;
            }
        };
        self.send_raw(WireEvent::new(json!({
            "type": "response.create",
            "response": response,
        })))
        .await
    }

    /// `session.update` with a partial session patch.
    pub async fn update_session(&self, patch: Value) -> bool {
        self.send_raw(WireEvent::new(json!({
            "type": "session.update",
            "session": patch,
        })))
        .await
    }

    /// Return a tool result. Strings are sent verbatim, other values as JSON text.
    pub async fn send_tool_output(&self, call_id: &str, output: &Value) -> bool {
        let output = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.send_raw(WireEvent::new(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            },
        })))
        .await
    }

    /// Add a typed user message to the conversation.
    pub async fn send_user_text(&self, text: &str) -> bool {
        self.send_raw(WireEvent::new(json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": text }],
            },
        })))
        .await
    }

    pub async fn cancel_response(&self) -> bool {
        self.send_raw(WireEvent::typed("response.cancel")).await
    }

    pub async fn commit_audio_buffer(&self) -> bool {
        self.send_raw(WireEvent::typed("input_audio_buffer.commit")).await
    }

    pub async fn clear_audio_buffer(&self) -> bool {
        self.send_raw(WireEvent::typed("input_audio_buffer.clear")).await
    }
}
