//! Media Bridge: acquires local capture, attaches it, and tracks remote media.

use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::{ErrorStage, Milestone, Reporter};
use parley_settings::MediaConstraints;
use tracing::debug;

use crate::engine::{LocalMedia, MediaEngine, MediaKind, PeerConnection, RemoteTrack, TransceiverDirection};
use crate::errors::{StageError, TransportError};

pub struct MediaBridge {
    engine: Option<Arc<dyn MediaEngine>>,
    reporter: Reporter,
    local: Mutex<Option<Arc<dyn LocalMedia>>>,
    remote: Mutex<Vec<RemoteTrack>>,
}

impl MediaBridge {
    pub fn new(engine: Option<Arc<dyn MediaEngine>>, reporter: Reporter) -> Self {
        Self {
            engine,
            reporter,
            local: Mutex::new(None),
            remote: Mutex::new(Vec::new()),
        }
    }

    /// Acquire the microphone and attach it to `peer`, returning the capture
    /// that is now held.
    ///
    /// When capture is disabled, or fails while not required, a receive-only
    /// audio transceiver is added instead so remote audio still flows.
    pub async fn attach(
        &self,
        peer: &Arc<dyn PeerConnection>,
        constraints: &MediaConstraints,
    ) -> Result<Option<Arc<dyn LocalMedia>>, StageError> {
        if !constraints.audio {
            return self.receive_only(peer).await;
        }

        let acquired = match &self.engine {
            Some(engine) => engine.acquire(constraints).await,
            None => Err(TransportError::MediaUnavailable(
                "no media engine configured".into(),
            )),
        };

        let media = match acquired {
            Ok(media) => media,
            Err(e) => {
                let stage = match e {
                    TransportError::PermissionDenied(_) => ErrorStage::MicrophonePermission,
                    _ => ErrorStage::GetUserMedia,
                };
                if constraints.required {
                    return Err(StageError::new(stage, e));
                }
                self.reporter.warn(stage, &e);
                return self.receive_only(peer).await;
            }
        };

        for track in media.tracks() {
            if let Err(e) = peer.add_track(&track).await {
                media.stop();
                return Err(StageError::new(ErrorStage::LocalStream, e));
            }
            debug!(track = %track.id, "attached local track");
        }
        let replaced = self.local.lock().replace(Arc::clone(&media));
        if let Some(replaced) = replaced {
            replaced.stop();
        }
        self.reporter.milestone(Milestone::MediaAttached);
        Ok(Some(media))
    }

    async fn receive_only(
        &self,
        peer: &Arc<dyn PeerConnection>,
    ) -> Result<Option<Arc<dyn LocalMedia>>, StageError> {
        peer.add_transceiver(MediaKind::Audio, TransceiverDirection::RecvOnly)
            .await
            .map_err(|e| StageError::new(ErrorStage::IosTransceiver, e))?;
        debug!("added receive-only audio transceiver");
        self.reporter.milestone(Milestone::MediaAttached);
        Ok(None)
    }

    /// Record a track announced by the remote peer.
    pub fn record_remote_track(&self, track: RemoteTrack) {
        let mut remote = self.remote.lock();
        if !remote.iter().any(|t| t.id == track.id) {
            debug!(track = %track.id, "remote track");
            remote.push(track);
        }
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote.lock().clone()
    }

    pub fn local_media(&self) -> Option<Arc<dyn LocalMedia>> {
        self.local.lock().clone()
    }

    /// Stop local capture and forget remote tracks. Idempotent.
    pub fn release(&self) {
        if let Some(media) = self.local.lock().take() {
            media.stop();
        }
        self.remote.lock().clear();
    }

    /// Stop `media` if it is still the held capture. Returns whether it was.
    pub fn release_if_current(&self, media: &Arc<dyn LocalMedia>) -> bool {
        let taken = {
            let mut local = self.local.lock();
            if local.as_ref().is_some_and(|m| Arc::ptr_eq(m, media)) {
                local.take()
            } else {
                None
            }
        };
        match taken {
            Some(media) => {
                media.stop();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransportEngine;
    use crate::mock::{MediaOutcome, MockEngine, MockFailure, MockMediaEngine};
    use parley_settings::TransportSettings;

    async fn peer(engine: &MockEngine) -> Arc<dyn PeerConnection> {
        engine.create(&TransportSettings::default()).await.unwrap()
    }

    fn bridge(media: &MockMediaEngine) -> (MediaBridge, Reporter) {
        let reporter = Reporter::new().quiet_milestones();
        let engine: Arc<dyn MediaEngine> = Arc::new(media.clone());
        (MediaBridge::new(Some(engine), reporter.clone()), reporter)
    }

    #[tokio::test]
    async fn attaches_granted_microphone() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Grant);
        let (bridge, reporter) = bridge(&media);
        let peer = peer(&engine).await;

        bridge.attach(&peer, &MediaConstraints::default()).await.unwrap();
        assert!(bridge.local_media().is_some());
        assert_eq!(engine.handle().tracks_added(), 1);
        assert!(reporter.has_milestone(Milestone::MediaAttached));
    }

    #[tokio::test]
    async fn denied_permission_is_fatal_when_required() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Deny);
        let (bridge, _) = bridge(&media);
        let peer = peer(&engine).await;

        let err = bridge
            .attach(&peer, &MediaConstraints::default())
            .await
            .err().unwrap();
        assert_eq!(err.stage, ErrorStage::MicrophonePermission);
    }

    #[tokio::test]
    async fn unavailable_device_is_get_user_media_stage() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Unavailable);
        let (bridge, _) = bridge(&media);
        let peer = peer(&engine).await;

        let err = bridge
            .attach(&peer, &MediaConstraints::default())
            .await
            .err().unwrap();
        assert_eq!(err.stage, ErrorStage::GetUserMedia);
    }

    #[tokio::test]
    async fn optional_media_falls_back_to_receive_only() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Unavailable);
        let (bridge, reporter) = bridge(&media);
        let peer = peer(&engine).await;
        let constraints = MediaConstraints {
            required: false,
            ..MediaConstraints::default()
        };

        bridge.attach(&peer, &constraints).await.unwrap();
        assert!(bridge.local_media().is_none());
        assert_eq!(engine.handle().transceivers_added(), 1);
        assert_eq!(reporter.errors()[0].stage, ErrorStage::GetUserMedia);
    }

    #[tokio::test]
    async fn audio_disabled_adds_transceiver() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Grant);
        let (bridge, _) = bridge(&media);
        let peer = peer(&engine).await;
        let constraints = MediaConstraints {
            audio: false,
            ..MediaConstraints::default()
        };

        bridge.attach(&peer, &constraints).await.unwrap();
        assert_eq!(media.acquire_count(), 0);
        assert_eq!(engine.handle().transceivers_added(), 1);
    }

    #[tokio::test]
    async fn add_track_failure_stops_media() {
        let engine = MockEngine::new().fail_at(MockFailure::AddTrack);
        let media = MockMediaEngine::new(MediaOutcome::Grant);
        let (bridge, _) = bridge(&media);
        let peer = peer(&engine).await;

        let err = bridge
            .attach(&peer, &MediaConstraints::default())
            .await
            .err().unwrap();
        assert_eq!(err.stage, ErrorStage::LocalStream);
        assert_eq!(media.stop_count(), 1);
    }

    #[tokio::test]
    async fn release_stops_once_and_clears_remote() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Grant);
        let (bridge, _) = bridge(&media);
        let peer = peer(&engine).await;
        bridge.attach(&peer, &MediaConstraints::default()).await.unwrap();
        bridge.record_remote_track(RemoteTrack {
            id: "remote-audio".into(),
            kind: MediaKind::Audio,
            stream_id: None,
        });

        bridge.release();
        bridge.release();
        assert_eq!(media.stop_count(), 1);
        assert!(bridge.remote_tracks().is_empty());
    }

    #[tokio::test]
    async fn second_attach_stops_replaced_capture() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Grant);
        let (bridge, _) = bridge(&media);
        let peer = peer(&engine).await;

        let first = bridge
            .attach(&peer, &MediaConstraints::default())
            .await
            .unwrap()
            .unwrap();
        let _ = bridge.attach(&peer, &MediaConstraints::default()).await.unwrap();
        assert_eq!(media.stop_count(), 1);

        // the replaced capture is no longer ours to release
        assert!(!bridge.release_if_current(&first));
        assert_eq!(media.stop_count(), 1);
    }

    #[tokio::test]
    async fn release_if_current_stops_held_capture() {
        let engine = MockEngine::new();
        let media = MockMediaEngine::new(MediaOutcome::Grant);
        let (bridge, _) = bridge(&media);
        let peer = peer(&engine).await;

        let held = bridge
            .attach(&peer, &MediaConstraints::default())
            .await
            .unwrap()
            .unwrap();
        assert!(bridge.release_if_current(&held));
        assert!(bridge.local_media().is_none());
        assert!(!bridge.release_if_current(&held));
        assert_eq!(media.stop_count(), 1);
    }

    #[test]
    fn remote_tracks_dedup_by_id() {
        let (bridge, _) = bridge(&MockMediaEngine::new(MediaOutcome::Grant));
        let track = RemoteTrack {
            id: "a".into(),
            kind: MediaKind::Audio,
            stream_id: Some("s".into()),
        };
        bridge.record_remote_track(track.clone());
        bridge.record_remote_track(track);
        assert_eq!(bridge.remote_tracks().len(), 1);
    }
}
