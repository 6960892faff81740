//! Control Channel Manager: the ordered event channel to the backend.

use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::{ErrorEvent, ErrorStage, Milestone, Reporter, WireEvent};
use tokio::sync::broadcast;
use tracing::trace;

use crate::engine::{ChannelEvent, ChannelOptions, ChannelState, DataChannel, PeerConnection};
use crate::errors::{StageError, TransportError};

pub struct ControlChannelManager {
    reporter: Reporter,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
}

impl ControlChannelManager {
    pub fn new(reporter: Reporter) -> Self {
        Self {
            reporter,
            channel: Mutex::new(None),
        }
    }

    /// Create the control channel on `peer`. Must happen before the offer.
    pub async fn create(
        &self,
        peer: &Arc<dyn PeerConnection>,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataChannel>, StageError> {
        let channel = peer
            .create_data_channel(label, ChannelOptions { ordered })
            .await
            .map_err(|e| StageError::new(ErrorStage::DataChannel, e))?;
        let replaced = self.channel.lock().replace(Arc::clone(&channel));
        if let Some(replaced) = replaced {
            self.shut(replaced).await;
        }
        self.reporter.milestone(Milestone::ChannelCreated);
        Ok(channel)
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.lock().clone()
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<ChannelEvent>> {
        self.channel.lock().as_ref().map(|c| c.subscribe())
    }

    pub fn is_open(&self) -> bool {
        self.channel
            .lock()
            .as_ref()
            .is_some_and(|c| c.ready_state() == ChannelState::Open)
    }

    /// Serialize and write one event. Fails when the channel is not open.
    pub fn send(&self, event: &WireEvent) -> Result<(), TransportError> {
        let channel = self
            .channel()
            .filter(|c| c.ready_state() == ChannelState::Open)
            .ok_or(TransportError::ChannelNotOpen)?;
        let text = event.to_text()?;
        trace!(kind = event.kind().unwrap_or_default(), "sending event");
        channel.send(&text)
    }

    /// Parse inbound text. Malformed payloads are reported and dropped.
    pub fn decode(&self, text: &str) -> Option<WireEvent> {
        match WireEvent::parse(text) {
            Ok(event) => Some(event),
            Err(e) => {
                let preview: String = text.chars().take(120).collect();
                self.reporter.report(
                    ErrorEvent::warning(ErrorStage::DataChannel, format!("malformed inbound message: {e}"))
                        .with_context(serde_json::json!({ "payload": preview })),
                );
                None
            }
        }
    }

    /// Close and forget the channel. Failures become `hangup` warnings.
    pub async fn close(&self) {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            self.shut(channel).await;
        }
    }

    /// Close `channel` only if it is still the held one.
    pub async fn close_if_current(&self, channel: &Arc<dyn DataChannel>) -> bool {
        let taken = {
            let mut held = self.channel.lock();
            if held.as_ref().is_some_and(|c| Arc::ptr_eq(c, channel)) {
                held.take()
            } else {
                None
            }
        };
        match taken {
            Some(channel) => {
                self.shut(channel).await;
                true
            }
            None => false,
        }
    }

    async fn shut(&self, channel: Arc<dyn DataChannel>) {
        if let Err(e) = channel.close().await {
            self.reporter.warn(ErrorStage::Hangup, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransportEngine;
    use crate::mock::{MockEngine, MockFailure};
    use assert_matches::assert_matches;
    use parley_settings::TransportSettings;

    async fn setup(engine: &MockEngine) -> (ControlChannelManager, Reporter, Arc<dyn PeerConnection>) {
        let reporter = Reporter::new().quiet_milestones();
        let peer = engine.create(&TransportSettings::default()).await.unwrap();
        (ControlChannelManager::new(reporter.clone()), reporter, peer)
    }

    #[tokio::test]
    async fn creates_labelled_ordered_channel() {
        let engine = MockEngine::new();
        let (mgr, reporter, peer) = setup(&engine).await;
        let channel = mgr.create(&peer, "oai-events", true).await.unwrap();
        assert_eq!(channel.label(), "oai-events");
        assert_eq!(engine.handle().channel_options(), Some(ChannelOptions { ordered: true }));
        assert!(reporter.has_milestone(Milestone::ChannelCreated));
    }

    #[tokio::test]
    async fn create_failure_is_data_channel_stage() {
        let engine = MockEngine::new().fail_at(MockFailure::CreateChannel);
        let (mgr, _, peer) = setup(&engine).await;
        let err = mgr.create(&peer, "oai-events", true).await.err().unwrap();
        assert_eq!(err.stage, ErrorStage::DataChannel);
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let engine = MockEngine::new();
        let (mgr, _, peer) = setup(&engine).await;
        assert_matches!(
            mgr.send(&WireEvent::typed("x")),
            Err(TransportError::ChannelNotOpen)
        );

        let _ = mgr.create(&peer, "oai-events", true).await.unwrap();
        assert!(!mgr.is_open());
        engine.handle().open_channel();
        assert!(mgr.is_open());
        mgr.send(&WireEvent::typed("x")).unwrap();
        assert_eq!(engine.handle().sent_types(), vec!["x"]);
    }

    #[tokio::test]
    async fn decode_reports_malformed_text() {
        let engine = MockEngine::new();
        let (mgr, reporter, _) = setup(&engine).await;
        assert!(mgr.decode("{ not json").is_none());
        let errors = reporter.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, ErrorStage::DataChannel);
        assert!(errors[0].recoverable);
        assert!(errors[0].context.is_some());
    }

    #[tokio::test]
    async fn decode_accepts_object() {
        let engine = MockEngine::new();
        let (mgr, reporter, _) = setup(&engine).await;
        let event = mgr.decode(r#"{"type":"response.created"}"#).unwrap();
        assert_eq!(event.kind(), Some("response.created"));
        assert!(reporter.errors().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = MockEngine::new();
        let (mgr, _, peer) = setup(&engine).await;
        let _ = mgr.create(&peer, "oai-events", true).await.unwrap();
        mgr.close().await;
        mgr.close().await;
        assert_eq!(engine.handle().channel_close_count(), 1);
        assert!(mgr.channel().is_none());
    }

    #[tokio::test]
    async fn close_if_current_ignores_replaced_channel() {
        let engine = MockEngine::new();
        let (mgr, _, peer) = setup(&engine).await;
        let first = mgr.create(&peer, "oai-events", true).await.unwrap();
        let second = mgr.create(&peer, "oai-events", true).await.unwrap();
        assert_eq!(engine.handle().channel_close_count(), 1);

        assert!(!mgr.close_if_current(&first).await);
        assert!(mgr.close_if_current(&second).await);
        assert_eq!(engine.handle().channel_close_count(), 2);
        assert!(mgr.channel().is_none());
    }
}
