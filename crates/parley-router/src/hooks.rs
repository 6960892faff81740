//! Caller-supplied hooks invoked while routing inbound events.
//!
//! Every method has a no-op default, so an implementation only overrides
//! the capabilities it cares about.

use async_trait::async_trait;
use parley_core::{ErrorEvent, HookVerdict, TerminalStatus, WireEvent};
use serde_json::Value;

/// A completed function call requested by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
    pub call_id: String,
}

/// Hook capability set.
///
/// The per-delta hooks may return [`HookVerdict::Consume`] to suppress the
/// semantic event that would otherwise follow. Work the hook already did
/// (logging, side channels) stands either way.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Every inbound event that survived incoming middleware, recognized or not.
    fn on_event(&self, _event: &WireEvent) {}

    fn on_user_transcription_delta(&self, _item_id: &str, _delta: &str) -> HookVerdict {
        HookVerdict::Pass
    }

    fn on_user_transcription_completed(&self, _item_id: &str, _transcript: &str) -> HookVerdict {
        HookVerdict::Pass
    }

    fn on_assistant_transcript_delta(&self, _response_id: &str, _delta: &str) -> HookVerdict {
        HookVerdict::Pass
    }

    fn on_assistant_text_delta(&self, _response_id: &str, _delta: &str) -> HookVerdict {
        HookVerdict::Pass
    }

    /// A response stream finished, was canceled, or produced its final text.
    fn on_assistant_completed(
        &self,
        _response_id: &str,
        _status: TerminalStatus,
        _text: Option<&str>,
    ) -> HookVerdict {
        HookVerdict::Pass
    }

    /// Run a tool. `Some(output)` is sent back to the backend followed by a
    /// request for a new response.
    async fn on_tool_call(&self, _call: ToolCall) -> Option<Value> {
        None
    }

    /// The backend sent a top-level `error` event.
    fn on_server_error(&self, _message: &str, _event: &WireEvent) {}

    /// Any failure reported during the session.
    fn on_error(&self, _error: &ErrorEvent) {}
}

/// Hook set with every capability left at its default.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

#[async_trait]
impl SessionHooks for NoHooks {}
