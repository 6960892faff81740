//! Middleware chains for inbound and outbound events.
//!
//! Stages run strictly in registration order. Each returns a [`Flow`]:
//! `Continue` passes the current event on, `Replace` swaps it for the rest of
//! the chain, and `Stop` ends processing of that event silently.

use std::sync::Arc;

use async_trait::async_trait;
use parley_core::{ChatMessage, ConnectionState, Flow, WireEvent};

use crate::activity::SpeechSnapshot;
use crate::sender::MessageSender;

/// Read-only view of the session an incoming stage runs in.
pub trait SessionView: Send + Sync {
    fn state(&self) -> ConnectionState;
    fn chat(&self) -> Arc<[ChatMessage]>;
    fn speech(&self) -> SpeechSnapshot;
}

/// Everything an incoming stage receives besides the event.
pub struct IncomingContext<'a> {
    sender: &'a MessageSender,
    client: Option<Arc<dyn SessionView>>,
}

impl<'a> IncomingContext<'a> {
    pub fn new(sender: &'a MessageSender, client: Option<Arc<dyn SessionView>>) -> Self {
        Self { sender, client }
    }

    /// Lets a stage answer an event directly.
    pub fn sender(&self) -> &MessageSender {
        self.sender
    }

    /// The owning session, when the router is attached to one that is alive.
    pub fn client(&self) -> Option<&Arc<dyn SessionView>> {
        self.client.as_ref()
    }
}

/// A stage in the inbound chain, run before classification.
#[async_trait]
pub trait IncomingMiddleware: Send + Sync {
    async fn handle(&self, event: &WireEvent, cx: &IncomingContext<'_>) -> Flow;
}

/// A stage in the outbound chain, run before the channel write.
#[async_trait]
pub trait OutgoingMiddleware: Send + Sync {
    async fn handle(&self, event: &WireEvent) -> Flow;
}

/// Adapter returned by [`incoming_fn`].
pub struct IncomingFn<F>(F);

#[async_trait]
impl<F> IncomingMiddleware for IncomingFn<F>
where
    F: Fn(&WireEvent, &IncomingContext<'_>) -> Flow + Send + Sync,
{
    async fn handle(&self, event: &WireEvent, cx: &IncomingContext<'_>) -> Flow {
        (self.0)(event, cx)
    }
}

/// Wrap a synchronous closure as an incoming stage.
pub fn incoming_fn<F>(f: F) -> Arc<dyn IncomingMiddleware>
where
    F: Fn(&WireEvent, &IncomingContext<'_>) -> Flow + Send + Sync + 'static,
{
    Arc::new(IncomingFn(f))
}

/// Adapter returned by [`outgoing_fn`].
pub struct OutgoingFn<F>(F);

#[async_trait]
impl<F> OutgoingMiddleware for OutgoingFn<F>
where
    F: Fn(&WireEvent) -> Flow + Send + Sync,
{
    async fn handle(&self, event: &WireEvent) -> Flow {
        (self.0)(event)
    }
}

/// Wrap a synchronous closure as an outgoing stage.
pub fn outgoing_fn<F>(f: F) -> Arc<dyn OutgoingMiddleware>
where
    F: Fn(&WireEvent) -> Flow + Send + Sync + 'static,
{
    Arc::new(OutgoingFn(f))
}

/// Outgoing stage that drops `conversation.item.create` messages whose text
/// content is empty or whitespace.
pub fn block_empty_user_text() -> Arc<dyn OutgoingMiddleware> {
    outgoing_fn(|event| {
        if event.kind() != Some("conversation.item.create") {
            return Flow::Continue;
        }
        let Some(content) = event
            .get("item")
            .and_then(|item| item.get("content"))
            .and_then(|c| c.as_array())
        else {
            return Flow::Continue;
        };
        let has_text = content.iter().any(|part| {
            part.get("text")
                .and_then(|t| t.as_str())
                .is_some_and(|t| !t.trim().is_empty())
        });
        let is_text_only = content
            .iter()
            .all(|part| part.get("text").is_some());
        if is_text_only && !has_text {
            Flow::Stop
        } else {
            Flow::Continue
        }
    })
}
