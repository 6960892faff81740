//! Transport Session Manager: owns the peer connection for one connection attempt.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parley_core::{ErrorStage, Milestone, Reporter};
use parley_settings::{OfferOptions, TransportSettings};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::engine::{
    IceGatheringState, PeerConnection, PeerEvent, SessionDescription, TransportEngine,
};
use crate::errors::{StageError, TransportError};

/// How the ICE gathering wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceOutcome {
    Complete,
    /// The timeout fired first; negotiation continues with what was gathered.
    TimedOut,
}

pub struct TransportSessionManager {
    engine: Arc<dyn TransportEngine>,
    reporter: Reporter,
    peer: Mutex<Option<Arc<dyn PeerConnection>>>,
}

impl TransportSessionManager {
    pub fn new(engine: Arc<dyn TransportEngine>, reporter: Reporter) -> Self {
        Self {
            engine,
            reporter,
            peer: Mutex::new(None),
        }
    }

    /// Create the peer connection. A previous one still held is closed.
    pub async fn open(
        &self,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn PeerConnection>, StageError> {
        let peer = self
            .engine
            .create(settings)
            .await
            .map_err(|e| StageError::new(ErrorStage::InitPeerConnection, e))?;
        let replaced = self.peer.lock().replace(Arc::clone(&peer));
        if let Some(replaced) = replaced {
            debug!("closing replaced peer connection");
            self.shut(replaced).await;
        }
        self.reporter.milestone(Milestone::TransportCreated);
        Ok(peer)
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer.lock().clone()
    }

    fn require_peer(&self, stage: ErrorStage) -> Result<Arc<dyn PeerConnection>, StageError> {
        self.peer().ok_or_else(|| {
            StageError::new(
                stage,
                TransportError::Engine("no peer connection".into()),
            )
        })
    }

    pub async fn create_offer(
        &self,
        options: &OfferOptions,
    ) -> Result<SessionDescription, StageError> {
        let peer = self.require_peer(ErrorStage::CreateOffer)?;
        let offer = peer
            .create_offer(options)
            .await
            .map_err(|e| StageError::new(ErrorStage::CreateOffer, e))?;
        self.reporter.milestone(Milestone::OfferCreated);
        Ok(offer)
    }

    pub async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), StageError> {
        let peer = self.require_peer(ErrorStage::SetLocalDescription)?;
        peer.set_local_description(description)
            .await
            .map_err(|e| StageError::new(ErrorStage::SetLocalDescription, e))?;
        self.reporter.milestone(Milestone::LocalDescriptionSet);
        Ok(())
    }

    /// Wait until gathering completes or `limit` elapses, whichever is first.
    ///
    /// A timeout is reported as a warning and is not an error.
    pub async fn wait_for_ice_gathering(&self, limit: Duration) -> Result<IceOutcome, StageError> {
        let peer = self.require_peer(ErrorStage::IceGathering)?;
        // subscribe before inspecting so a completion in between is not missed
        let mut events = peer.subscribe();
        if peer.ice_gathering_state() == IceGatheringState::Complete {
            self.reporter.milestone(Milestone::IceGatheringSettled);
            return Ok(IceOutcome::Complete);
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::IceGathering(IceGatheringState::Complete)) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "peer events lagged during ice wait");
                        if peer.ice_gathering_state() == IceGatheringState::Complete {
                            break;
                        }
                    }
                    // engine went away; let the timeout decide
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };

        let outcome = match tokio::time::timeout(limit, wait).await {
            Ok(()) => IceOutcome::Complete,
            Err(_) => {
                self.reporter.warn(
                    ErrorStage::IceGathering,
                    format!(
                        "ice gathering did not complete within {}ms, continuing",
                        limit.as_millis()
                    ),
                );
                IceOutcome::TimedOut
            }
        };
        self.reporter.milestone(Milestone::IceGatheringSettled);
        Ok(outcome)
    }

    /// The local description as it stands after gathering.
    pub fn local_description(&self) -> Result<SessionDescription, StageError> {
        let peer = self.require_peer(ErrorStage::SetLocalDescription)?;
        peer.local_description().ok_or_else(|| {
            StageError::new(
                ErrorStage::SetLocalDescription,
                TransportError::Engine("local description missing".into()),
            )
        })
    }

    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), StageError> {
        let peer = self.require_peer(ErrorStage::SetRemoteDescription)?;
        peer.set_remote_description(description)
            .await
            .map_err(|e| StageError::new(ErrorStage::SetRemoteDescription, e))?;
        self.reporter.milestone(Milestone::RemoteDescriptionSet);
        Ok(())
    }

    /// Close and forget the peer connection. Failures become `hangup` warnings.
    pub async fn close(&self) {
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            self.shut(peer).await;
        }
    }

    /// Close `peer` only if it is still the held connection. Returns whether
    /// it was.
    pub async fn close_if_current(&self, peer: &Arc<dyn PeerConnection>) -> bool {
        let taken = {
            let mut held = self.peer.lock();
            if held.as_ref().is_some_and(|p| Arc::ptr_eq(p, peer)) {
                held.take()
            } else {
                None
            }
        };
        match taken {
            Some(peer) => {
                self.shut(peer).await;
                true
            }
            None => false,
        }
    }

    async fn shut(&self, peer: Arc<dyn PeerConnection>) {
        if let Err(e) = peer.close().await {
            self.reporter.warn(ErrorStage::Hangup, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{IceBehavior, MockEngine, MockFailure};
    use assert_matches::assert_matches;
    use parley_core::ErrorSeverity;

    fn manager(engine: &MockEngine) -> (TransportSessionManager, Reporter) {
        let reporter = Reporter::new().quiet_milestones();
        let engine: Arc<dyn TransportEngine> = Arc::new(engine.clone());
        (TransportSessionManager::new(engine, reporter.clone()), reporter)
    }

    #[tokio::test]
    async fn open_records_milestone() {
        let engine = MockEngine::new();
        let (mgr, reporter) = manager(&engine);
        let _ = mgr.open(&TransportSettings::default()).await.unwrap();
        assert!(mgr.peer().is_some());
        assert!(reporter.has_milestone(Milestone::TransportCreated));
        assert_eq!(engine.handle().peers_created(), 1);
    }

    #[tokio::test]
    async fn open_failure_is_init_stage() {
        let engine = MockEngine::new().fail_at(MockFailure::CreatePeer);
        let (mgr, _) = manager(&engine);
        let err = mgr.open(&TransportSettings::default()).await.err().unwrap();
        assert_eq!(err.stage, ErrorStage::InitPeerConnection);
    }

    #[tokio::test]
    async fn offer_without_peer_fails() {
        let engine = MockEngine::new();
        let (mgr, _) = manager(&engine);
        let err = mgr.create_offer(&OfferOptions::default()).await.unwrap_err();
        assert_eq!(err.stage, ErrorStage::CreateOffer);
    }

    #[tokio::test]
    async fn ice_complete_on_local_description() {
        let engine = MockEngine::new().ice(IceBehavior::CompleteOnLocalDescription);
        let (mgr, _) = manager(&engine);
        let _ = mgr.open(&TransportSettings::default()).await.unwrap();
        let offer = mgr.create_offer(&OfferOptions::default()).await.unwrap();
        mgr.set_local_description(offer).await.unwrap();
        let outcome = mgr
            .wait_for_ice_gathering(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, IceOutcome::Complete);
    }

    #[tokio::test]
    async fn ice_completes_after_delay() {
        let engine = MockEngine::new().ice(IceBehavior::CompleteAfter(Duration::from_millis(20)));
        let (mgr, reporter) = manager(&engine);
        let _ = mgr.open(&TransportSettings::default()).await.unwrap();
        let offer = mgr.create_offer(&OfferOptions::default()).await.unwrap();
        mgr.set_local_description(offer).await.unwrap();
        let outcome = mgr
            .wait_for_ice_gathering(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, IceOutcome::Complete);
        assert!(reporter.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ice_timeout_is_a_warning_and_continues() {
        let engine = MockEngine::new().ice(IceBehavior::Never);
        let (mgr, reporter) = manager(&engine);
        let _ = mgr.open(&TransportSettings::default()).await.unwrap();
        let outcome = mgr
            .wait_for_ice_gathering(Duration::from_millis(2_000))
            .await
            .unwrap();
        assert_eq!(outcome, IceOutcome::TimedOut);

        let errors = reporter.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, ErrorStage::IceGathering);
        assert_eq!(errors[0].severity, ErrorSeverity::Warning);
        assert!(reporter.has_milestone(Milestone::IceGatheringSettled));
    }

    #[tokio::test]
    async fn remote_description_failure_stage() {
        let engine = MockEngine::new().fail_at(MockFailure::SetRemoteDescription);
        let (mgr, _) = manager(&engine);
        let _ = mgr.open(&TransportSettings::default()).await.unwrap();
        let err = mgr
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert_eq!(err.stage, ErrorStage::SetRemoteDescription);
        assert_matches!(err.source, TransportError::Engine(_));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = MockEngine::new();
        let (mgr, _) = manager(&engine);
        let _ = mgr.open(&TransportSettings::default()).await.unwrap();
        mgr.close().await;
        mgr.close().await;
        assert_eq!(engine.handle().peer_close_count(), 1);
        assert!(mgr.peer().is_none());
    }

    #[tokio::test]
    async fn close_failure_downgrades_to_hangup_warning() {
        let engine = MockEngine::new().fail_at(MockFailure::ClosePeer);
        let (mgr, reporter) = manager(&engine);
        let _ = mgr.open(&TransportSettings::default()).await.unwrap();
        mgr.close().await;
        let errors = reporter.errors();
        assert_eq!(errors[0].stage, ErrorStage::Hangup);
        assert!(errors[0].recoverable);
    }

    #[tokio::test]
    async fn reopening_closes_the_replaced_peer() {
        let engine = MockEngine::new();
        let (mgr, _) = manager(&engine);
        let first = mgr.open(&TransportSettings::default()).await.unwrap();
        let second = mgr.open(&TransportSettings::default()).await.unwrap();
        assert_eq!(engine.handle().peer_close_count(), 1);

        assert!(!mgr.close_if_current(&first).await);
        assert_eq!(engine.handle().peer_close_count(), 1);
        assert!(mgr.close_if_current(&second).await);
        assert_eq!(engine.handle().peer_close_count(), 2);
        assert!(mgr.peer().is_none());
    }
}
