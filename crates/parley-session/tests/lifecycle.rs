mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use common::{eventually, harness, settle, with_hooks, Setup};
use parking_lot::Mutex;
use parley_core::{ConnectionState, ErrorEvent, ErrorSeverity, ErrorStage, Milestone};
use parley_router::SessionHooks;
use parley_session::{RealtimeSession, SessionError, SessionOptions};
use parley_settings::{
    MediaConstraints, SessionSettings, TransportSettings, DEFAULT_GREETING_INSTRUCTIONS,
};
use parley_transport::mock::{
    ExchangeOutcome, IceBehavior, MediaOutcome, MockEngine, MockExchange, MockFailure,
    MockMediaEngine,
};
use parley_transport::{
    token_fn, LocalMedia, MediaEngine, MediaKind, PeerConnection, PeerConnectionState,
    RemoteTrack, StaticTokenProvider, TransportEngine,
};
use serde_json::json;
use tokio::sync::Notify;

fn record_states(session: &RealtimeSession) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = session.on_state_change(move |s| sink.lock().push(*s));
    seen
}

#[tokio::test]
async fn connect_negotiates_and_configures_on_open() {
    let h = harness();
    let states = record_states(&h.session);

    h.session.connect().await.unwrap();
    assert!(eventually(|| h.handle.sent_types().contains(&"session.update".to_string())).await);

    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert_eq!(
        *states.lock(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert_eq!(h.exchange.credentials(), vec!["ek_test".to_string()]);
    assert_eq!(h.handle.tracks_added(), 1);
    assert!(h.handle.channel_options().unwrap().ordered);

    let update = &h.handle.sent()[0];
    assert_eq!(update["type"], "session.update");
    assert_eq!(
        update["session"]["input_audio_transcription"]["model"],
        "whisper-1"
    );

    let milestones = h.session.reporter().milestones();
    let order = [
        Milestone::CredentialObtained,
        Milestone::TransportCreated,
        Milestone::MediaAttached,
        Milestone::ChannelCreated,
        Milestone::OfferCreated,
        Milestone::LocalDescriptionSet,
        Milestone::IceGatheringSettled,
        Milestone::RemoteDescriptionSet,
    ];
    let positions: Vec<usize> = order
        .iter()
        .map(|m| milestones.iter().position(|x| x == m).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{milestones:?}");
    assert!(h.errors.lock().is_empty());
}

#[tokio::test]
async fn greeting_follows_session_update() {
    let h = Setup {
        settings: json!({ "greeting": { "enabled": true } }),
        ..Setup::default()
    }
    .build();

    h.session.connect().await.unwrap();
    assert!(eventually(|| h.handle.sent().len() >= 2).await);

    let sent = h.handle.sent();
    assert_eq!(sent[0]["type"], "session.update");
    assert_eq!(sent[1]["type"], "response.create");
    assert_eq!(
        sent[1]["response"]["instructions"],
        DEFAULT_GREETING_INSTRUCTIONS
    );
}

#[tokio::test]
async fn auto_configure_off_sends_nothing() {
    let h = Setup {
        settings: json!({ "autoConfigure": false }),
        ..Setup::default()
    }
    .build();

    h.session.connect().await.unwrap();
    assert!(eventually(|| h.session.state() == ConnectionState::Connected).await);
    settle().await;
    assert!(h.handle.sent().is_empty());
}

#[tokio::test]
async fn empty_credential_fails_connect() {
    #[derive(Default)]
    struct ErrorHooks(Mutex<Vec<ErrorEvent>>);

    #[async_trait]
    impl SessionHooks for ErrorHooks {
        fn on_error(&self, error: &ErrorEvent) {
            self.0.lock().push(error.clone());
        }
    }

    let hooks = Arc::new(ErrorHooks::default());
    let h = Setup {
        token: "   ".into(),
        ..Setup::default()
    }
    .build_with({
        let hooks = Arc::clone(&hooks);
        |options| options.with_hooks(hooks)
    });

    let err = h.session.connect().await.unwrap_err();
    assert_matches!(
        err,
        SessionError::Connect {
            stage: ErrorStage::FetchToken,
            ..
        }
    );
    assert_eq!(h.session.state(), ConnectionState::Error);
    assert_eq!(h.handle.peers_created(), 0);

    let seen = hooks.0.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].stage, ErrorStage::FetchToken);
    assert_eq!(seen[0].severity, ErrorSeverity::Critical);
    assert!(!seen[0].recoverable);
    assert_eq!(h.errors.lock().len(), 1);
}

#[tokio::test]
async fn exchange_failure_is_openai_api_and_releases() {
    let h = Setup {
        exchange: MockExchange::new(ExchangeOutcome::Status(401)),
        ..Setup::default()
    }
    .build();

    let err = h.session.connect().await.unwrap_err();
    assert_eq!(err.stage(), Some(ErrorStage::OpenaiApi));
    assert_eq!(h.session.state(), ConnectionState::Error);
    assert_eq!(h.handle.peer_close_count(), 1);
    assert_eq!(h.handle.channel_close_count(), 1);
    assert_eq!(h.media.stop_count(), 1);
    assert!(h.session.peer_connection().is_none());
}

#[tokio::test]
async fn non_sdp_answer_is_openai_api() {
    let h = Setup {
        exchange: MockExchange::new(ExchangeOutcome::NotSdp),
        ..Setup::default()
    }
    .build();
    let err = h.session.connect().await.unwrap_err();
    assert_eq!(err.stage(), Some(ErrorStage::OpenaiApi));
}

#[tokio::test]
async fn denied_microphone_is_permission_stage() {
    let h = Setup {
        media: MockMediaEngine::new(MediaOutcome::Deny),
        ..Setup::default()
    }
    .build();
    let err = h.session.connect().await.unwrap_err();
    assert_eq!(err.stage(), Some(ErrorStage::MicrophonePermission));
    assert_eq!(h.session.state(), ConnectionState::Error);
}

#[tokio::test]
async fn optional_microphone_falls_back_to_receive_only() {
    let h = Setup {
        media: MockMediaEngine::new(MediaOutcome::Unavailable),
        settings: json!({ "media": { "required": false } }),
        ..Setup::default()
    }
    .build();
    h.session.connect().await.unwrap();
    assert_eq!(h.handle.transceivers_added(), 1);
    assert!(h.session.local_media().is_none());
    assert!(h
        .errors
        .lock()
        .iter()
        .any(|e| e.stage == ErrorStage::GetUserMedia && e.recoverable));
}

#[tokio::test]
async fn disconnect_twice_tears_down_once() {
    let h = harness();
    let states = record_states(&h.session);
    h.session.connect().await.unwrap();
    assert!(eventually(|| h.session.state() == ConnectionState::Connected).await);

    h.session.disconnect().await;
    h.session.disconnect().await;

    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.handle.peer_close_count(), 1);
    assert_eq!(h.handle.channel_close_count(), 1);
    assert_eq!(h.media.stop_count(), 1);
    let disconnects = states
        .lock()
        .iter()
        .filter(|s| **s == ConnectionState::Disconnected)
        .count();
    assert_eq!(disconnects, 1);
    assert!(h.session.data_channel().is_none());
}

#[tokio::test]
async fn disconnect_before_connect_is_harmless() {
    let h = harness();
    h.session.disconnect().await;
    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.handle.peer_close_count(), 0);
}

#[tokio::test]
async fn teardown_failures_are_hangup_warnings() {
    let h = Setup {
        engine: MockEngine::new()
            .fail_at(MockFailure::ClosePeer)
            .fail_at(MockFailure::CloseChannel),
        ..Setup::default()
    }
    .build();
    h.session.connect().await.unwrap();
    h.session.disconnect().await;

    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    let hangups: Vec<_> = h
        .errors
        .lock()
        .iter()
        .filter(|e| e.stage == ErrorStage::Hangup)
        .cloned()
        .collect();
    assert_eq!(hangups.len(), 2);
    assert!(hangups.iter().all(|e| e.recoverable));
}

#[tokio::test]
async fn reconnect_releases_previous_attempt() {
    let h = harness();
    h.session.connect().await.unwrap();
    h.session.connect().await.unwrap();

    assert_eq!(h.handle.peers_created(), 2);
    assert_eq!(h.handle.peer_close_count(), 1);
    assert_eq!(h.media.acquire_count(), 2);
    assert_eq!(h.media.stop_count(), 1);
}

#[tokio::test]
async fn token_provider_swap_applies_to_next_connect() {
    let h = harness();
    h.session.connect().await.unwrap();
    h.session
        .set_token_provider(Arc::new(StaticTokenProvider::new("ek_second")));
    h.session.connect().await.unwrap();
    assert_eq!(
        h.exchange.credentials(),
        vec!["ek_test".to_string(), "ek_second".to_string()]
    );
}

#[tokio::test]
async fn disconnect_mid_connect_aborts_attempt() {
    let gate = Arc::new(Notify::new());
    let engine = MockEngine::new();
    let handle = engine.handle();
    let options = SessionOptions::new(
        SessionSettings::default(),
        Arc::new(token_fn({
            let gate = Arc::clone(&gate);
            move || {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok("ek_late".to_string())
                }
            }
        })),
        Arc::new(engine),
    )
    .with_media_engine(Arc::new(MockMediaEngine::new(MediaOutcome::Grant)))
    .with_exchange(Arc::new(MockExchange::answering()));
    let session = Arc::new(RealtimeSession::new(options));

    let connecting = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.connect().await }
    });
    assert!(eventually(|| session.state() == ConnectionState::Connecting).await);

    session.disconnect().await;
    gate.notify_one();

    assert_matches!(connecting.await.unwrap(), Err(SessionError::Aborted));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(handle.peers_created(), 0);
}

/// Parks a call until released, so a disconnect can land in the middle of it.
#[derive(Clone, Default)]
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

struct ParkedEngine {
    inner: MockEngine,
    gate: Gate,
}

#[async_trait]
impl TransportEngine for ParkedEngine {
    async fn create(
        &self,
        settings: &TransportSettings,
    ) -> parley_transport::Result<Arc<dyn PeerConnection>> {
        self.gate.pass().await;
        self.inner.create(settings).await
    }
}

struct ParkedMedia {
    inner: MockMediaEngine,
    gate: Gate,
}

#[async_trait]
impl MediaEngine for ParkedMedia {
    async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> parley_transport::Result<Arc<dyn LocalMedia>> {
        self.gate.pass().await;
        self.inner.acquire(constraints).await
    }
}

fn parked_session(
    engine: Arc<dyn TransportEngine>,
    media: Arc<dyn MediaEngine>,
) -> Arc<RealtimeSession> {
    let options = SessionOptions::new(
        SessionSettings::default(),
        Arc::new(StaticTokenProvider::new("ek_test")),
        engine,
    )
    .with_media_engine(media)
    .with_exchange(Arc::new(MockExchange::answering()));
    Arc::new(RealtimeSession::new(options))
}

#[tokio::test]
async fn disconnect_during_transport_open_closes_late_peer() {
    let engine = MockEngine::new();
    let handle = engine.handle();
    let gate = Gate::default();
    let session = parked_session(
        Arc::new(ParkedEngine {
            inner: engine,
            gate: gate.clone(),
        }),
        Arc::new(MockMediaEngine::new(MediaOutcome::Grant)),
    );

    let connecting = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.connect().await }
    });
    gate.entered.notified().await;
    session.disconnect().await;
    gate.release.notify_one();

    assert_matches!(connecting.await.unwrap(), Err(SessionError::Aborted));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(handle.peers_created(), 1);
    assert_eq!(handle.peer_close_count(), 1);
    assert!(session.peer_connection().is_none());
    assert!(session.data_channel().is_none());
}

#[tokio::test]
async fn disconnect_during_media_capture_stops_late_capture() {
    let engine = MockEngine::new();
    let handle = engine.handle();
    let media = MockMediaEngine::new(MediaOutcome::Grant);
    let gate = Gate::default();
    let session = parked_session(
        Arc::new(engine),
        Arc::new(ParkedMedia {
            inner: media.clone(),
            gate: gate.clone(),
        }),
    );

    let connecting = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.connect().await }
    });
    gate.entered.notified().await;
    session.disconnect().await;
    gate.release.notify_one();

    assert_matches!(connecting.await.unwrap(), Err(SessionError::Aborted));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(media.acquire_count(), 1);
    assert_eq!(media.stop_count(), 1);
    assert!(session.local_media().is_none());
    assert_eq!(handle.peer_close_count(), 1);
    assert!(session.peer_connection().is_none());
}

#[tokio::test]
async fn channel_close_moves_to_disconnected() {
    let h = harness();
    h.session.connect().await.unwrap();
    assert!(eventually(|| h.session.state() == ConnectionState::Connected).await);

    h.handle.close_channel();
    assert!(eventually(|| h.session.state() == ConnectionState::Disconnected).await);
    assert!(h.session.reporter().has_milestone(Milestone::Disconnected));
}

#[tokio::test]
async fn transport_connected_promotes_without_channel_open() {
    let h = Setup {
        engine: MockEngine::new().manual_open(),
        ..Setup::default()
    }
    .build();
    h.session.connect().await.unwrap();
    assert!(eventually(|| h.session.state() == ConnectionState::Connected).await);
    // configuration waits for the channel itself
    settle().await;
    assert!(h.handle.sent().is_empty());

    h.handle.open_channel();
    assert!(eventually(|| !h.handle.sent().is_empty()).await);
}

#[tokio::test]
async fn state_waits_in_connecting_until_ready() {
    let h = Setup {
        engine: MockEngine::new().manual_open().manual_connect(),
        ..Setup::default()
    }
    .build();
    h.session.connect().await.unwrap();
    settle().await;
    assert_eq!(h.session.state(), ConnectionState::Connecting);

    h.handle.open_channel();
    assert!(eventually(|| h.session.state() == ConnectionState::Connected).await);
}

#[tokio::test]
async fn transport_failure_forces_error() {
    let h = harness();
    h.session.connect().await.unwrap();
    assert!(eventually(|| h.session.state() == ConnectionState::Connected).await);

    h.handle.set_peer_state(PeerConnectionState::Disconnected);
    settle().await;
    assert_eq!(h.session.state(), ConnectionState::Connected);

    h.handle.set_peer_state(PeerConnectionState::Failed);
    assert!(eventually(|| h.session.state() == ConnectionState::Error).await);

    let errors = h.errors.lock();
    assert!(errors
        .iter()
        .any(|e| e.stage == ErrorStage::PeerConnection && e.severity == ErrorSeverity::Warning));
    assert!(errors
        .iter()
        .any(|e| e.stage == ErrorStage::PeerConnection && e.severity == ErrorSeverity::Critical));
}

#[tokio::test]
async fn remote_tracks_are_recorded() {
    let h = harness();
    h.session.connect().await.unwrap();
    h.handle.announce_track(RemoteTrack {
        id: "remote-audio".into(),
        kind: MediaKind::Audio,
        stream_id: Some("stream-1".into()),
    });
    assert!(eventually(|| h.session.remote_tracks().len() == 1).await);

    h.session.disconnect().await;
    assert!(h.session.remote_tracks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ice_timeout_continues_with_warning() {
    let h = Setup {
        engine: MockEngine::new().ice(IceBehavior::Never),
        settings: json!({ "transport": { "iceGatheringTimeoutMs": 500 } }),
        ..Setup::default()
    }
    .build();

    h.session.connect().await.unwrap();
    assert!(h
        .errors
        .lock()
        .iter()
        .any(|e| e.stage == ErrorStage::IceGathering && e.recoverable));
    assert_eq!(h.exchange.call_count(), 1);
    assert!(h
        .session
        .reporter()
        .has_milestone(Milestone::IceGatheringSettled));
}

#[tokio::test]
async fn hooks_see_reported_warnings() {
    struct Counting(Mutex<usize>);

    #[async_trait]
    impl SessionHooks for Counting {
        fn on_error(&self, _error: &ErrorEvent) {
            *self.0.lock() += 1;
        }
    }

    let hooks = Arc::new(Counting(Mutex::new(0)));
    let h = with_hooks(hooks.clone());
    h.session.connect().await.unwrap();
    h.handle.inject("{oops");
    assert!(eventually(|| *hooks.0.lock() == 1).await);
}
