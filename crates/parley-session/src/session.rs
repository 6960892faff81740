//! Session Orchestrator.
//!
//! [`RealtimeSession`] drives `connect`/`disconnect`, wires the transport,
//! media, control channel, router, and chat store together, and is the only
//! writer of the connection state. Two background pumps per connection feed
//! it: one reads control-channel events and routes messages in arrival order,
//! the other follows the peer connection's state and remote tracks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use parley_chat::ChatStore;
use parley_core::{
    ChatMessage, ConnectionState, ErrorEvent, ErrorStage, Milestone, Reporter, SemanticEvent,
    SemanticKind, Subscription, WireEvent,
};
use parley_router::{
    EventRouter, IncomingMiddleware, MessageSender, SessionView, SpeechActivity,
    SpeechActivityMiddleware, SpeechSnapshot, StrictResponse,
};
use parley_settings::SessionSettings;
use parley_transport::{
    ChannelEvent, ControlChannelManager, DataChannel, DescriptionExchange, LocalMedia,
    MediaBridge, PeerConnection, PeerConnectionState, PeerEvent, RemoteTrack, StageError,
    TokenProvider, TransportError, TransportSessionManager,
};
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::errors::{Result, SessionError};
use crate::options::SessionOptions;
use crate::state::ConnectionStateMachine;

/// State shared with the background pumps.
struct Core {
    settings: SessionSettings,
    reporter: Reporter,
    state: ConnectionStateMachine,
    transport: TransportSessionManager,
    media: MediaBridge,
    channel: Arc<ControlChannelManager>,
    router: EventRouter,
    chat: Arc<ChatStore>,
    speech: Arc<SpeechActivity>,
}

impl Core {
    async fn channel_opened(&self) {
        self.reporter.milestone(Milestone::ChannelOpen);
        let _ = self
            .state
            .transition_if(|s| s == ConnectionState::Connecting, ConnectionState::Connected);

        let sender = self.router.sender();
        if self.settings.auto_configure {
            let _ = sender.update_session(self.settings.session.clone()).await;
        }
        if self.settings.greeting.enabled {
            if let Some(instructions) = self.settings.greeting.instructions.as_deref() {
                let _ = sender
                    .send_response_strict(StrictResponse::new(instructions))
                    .await;
            }
        }
    }

    fn peer_state_changed(&self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                self.reporter.milestone(Milestone::TransportConnected);
                let _ = self.state.transition_if(
                    |s| s == ConnectionState::Connecting,
                    ConnectionState::Connected,
                );
            }
            PeerConnectionState::Failed => {
                let _ = self
                    .reporter
                    .critical(ErrorStage::PeerConnection, "transport failed");
                let _ = self
                    .state
                    .transition_if(ConnectionState::is_active, ConnectionState::Error);
            }
            PeerConnectionState::Disconnected => self.reporter.warn(
                ErrorStage::PeerConnection,
                "transport disconnected, waiting for it to recover",
            ),
            PeerConnectionState::Closed => self.closed("transport closed"),
            PeerConnectionState::New | PeerConnectionState::Connecting => {
                debug!(%state, "transport state");
            }
        }
    }

    fn closed(&self, reason: &str) {
        if self
            .state
            .transition_if(ConnectionState::is_active, ConnectionState::Disconnected)
        {
            info!(reason, "session closed by remote side");
            self.reporter.milestone(Milestone::Disconnected);
        }
    }
}

impl SessionView for Core {
    fn state(&self) -> ConnectionState {
        self.state.current()
    }

    fn chat(&self) -> Arc<[ChatMessage]> {
        self.chat.messages()
    }

    fn speech(&self) -> SpeechSnapshot {
        self.speech.snapshot()
    }
}

async fn channel_pump(
    core: Arc<Core>,
    mut events: broadcast::Receiver<ChannelEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ChannelEvent::Open) => core.channel_opened().await,
            // routed inline so the next message waits for this one
            Ok(ChannelEvent::Message(text)) => core.router.route_text(&text).await,
            Ok(ChannelEvent::Close) => {
                core.closed("control channel closed");
                break;
            }
            Ok(ChannelEvent::Error(message)) => {
                core.reporter.warn(ErrorStage::DataChannel, message);
            }
            Err(RecvError::Lagged(skipped)) => core.reporter.warn(
                ErrorStage::DataChannel,
                format!("control channel lagged, {skipped} inbound messages dropped"),
            ),
            Err(RecvError::Closed) => break,
        }
    }
    debug!("control channel pump stopped");
}

async fn peer_pump(
    core: Arc<Core>,
    mut events: broadcast::Receiver<PeerEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(PeerEvent::ConnectionState(state)) => core.peer_state_changed(state),
            Ok(PeerEvent::Track(track)) => core.media.record_remote_track(track),
            Ok(PeerEvent::IceGathering(_)) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "peer events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    debug!("peer pump stopped");
}

struct Pumps {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Resources one `connect` call created. A superseded call closes these,
/// and only while the managers still hold them.
#[derive(Default)]
struct Attempt {
    peer: Option<Arc<dyn PeerConnection>>,
    media: Option<Arc<dyn LocalMedia>>,
    channel: Option<Arc<dyn DataChannel>>,
    pumps: Option<CancellationToken>,
}

impl Pumps {
    fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.abort();
        }
    }
}

/// One realtime conversation with the backend.
pub struct RealtimeSession {
    core: Arc<Core>,
    exchange: Arc<dyn DescriptionExchange>,
    token_provider: Mutex<Arc<dyn TokenProvider>>,
    /// Router subscriptions feeding the chat store; empty while unlinked.
    chat_links: Mutex<Vec<Subscription>>,
    pumps: Mutex<Option<Pumps>>,
    /// Bumped by every `connect` and `disconnect`; a connect that sees a
    /// newer value stops where it is.
    epoch: AtomicU64,
}

impl RealtimeSession {
    pub fn new(options: SessionOptions) -> Self {
        let SessionOptions {
            settings,
            token_provider,
            engine,
            media_engine,
            exchange,
            hooks,
            incoming,
            outgoing,
            meaningful,
            observer,
        } = options;

        let forward_to = Arc::clone(&hooks);
        let reporter = Reporter::with_observer(Arc::new(move |event: &ErrorEvent| {
            forward_to.on_error(event);
            if let Some(observer) = &observer {
                observer.on_error(event);
            }
        }));
        let reporter = if settings.logging.milestones {
            reporter
        } else {
            reporter.quiet_milestones()
        };

        let channel = Arc::new(ControlChannelManager::new(reporter.clone()));
        let sender = Arc::new(MessageSender::new(
            Arc::clone(&channel),
            reporter.clone(),
            outgoing,
        ));
        let speech = Arc::new(SpeechActivity::new());
        let mut stages: Vec<Arc<dyn IncomingMiddleware>> =
            vec![Arc::new(SpeechActivityMiddleware::new(Arc::clone(&speech)))];
        stages.extend(incoming);

        let core = Arc::new(Core {
            transport: TransportSessionManager::new(engine, reporter.clone()),
            media: MediaBridge::new(media_engine, reporter.clone()),
            router: EventRouter::new(sender, hooks, stages),
            chat: Arc::new(ChatStore::with_predicate(meaningful)),
            state: ConnectionStateMachine::new(),
            channel,
            speech,
            reporter,
            settings,
        });
        let view: Weak<dyn SessionView> = Arc::downgrade(&core) as Weak<Core>;
        core.router.set_client(view);

        let session = Self {
            core,
            exchange,
            token_provider: Mutex::new(token_provider),
            chat_links: Mutex::new(Vec::new()),
            pumps: Mutex::new(None),
            epoch: AtomicU64::new(0),
        };
        session.link_chat();
        session
    }

    /// Establish the session.
    ///
    /// Leftovers from a previous attempt are released first. On failure the
    /// error is reported with its stage, the state becomes `error`, and any
    /// partially created resources are released.
    #[instrument(skip_all)]
    pub async fn connect(&self) -> Result<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.release_resources().await;
        self.ensure_current(epoch)?;

        self.core.reporter.reset();
        self.link_chat();
        let _ = self.core.state.transition(ConnectionState::Connecting);

        let mut attempt = Attempt::default();
        match self.establish(epoch, &mut attempt).await {
            Ok(()) => {
                info!(state = %self.core.state.current(), "connect finished");
                Ok(())
            }
            Err(e) if matches!(e, SessionError::Aborted) || self.ensure_current(epoch).is_err() => {
                debug!(error = %e, "connect superseded");
                self.abandon(attempt).await;
                Err(SessionError::Aborted)
            }
            Err(e) => {
                if let SessionError::Connect { stage, source } = &e {
                    self.core.reporter.report(ErrorEvent::critical(*stage, source));
                }
                let _ = self.core.state.transition(ConnectionState::Error);
                self.release_resources().await;
                Err(e)
            }
        }
    }

    async fn establish(&self, epoch: u64, attempt: &mut Attempt) -> Result<()> {
        let core = &self.core;
        let settings = &core.settings;

        let provider = Arc::clone(&*self.token_provider.lock());
        let token = provider
            .fetch_token()
            .await
            .map_err(|e| StageError::new(ErrorStage::FetchToken, e))?;
        self.ensure_current(epoch)?;
        if token.expose_secret().trim().is_empty() {
            return Err(StageError::new(ErrorStage::FetchToken, TransportError::EmptyCredential).into());
        }
        core.reporter.milestone(Milestone::CredentialObtained);

        let peer = core.transport.open(&settings.transport).await?;
        attempt.peer = Some(Arc::clone(&peer));
        self.ensure_current(epoch)?;

        attempt.media = core.media.attach(&peer, &settings.media).await?;
        self.ensure_current(epoch)?;

        // the channel must exist before the offer so it is negotiated with it
        let channel = core
            .channel
            .create(
                &peer,
                &settings.transport.channel_label,
                settings.transport.ordered,
            )
            .await?;
        attempt.channel = Some(Arc::clone(&channel));
        self.ensure_current(epoch)?;
        attempt.pumps = Some(self.start_pumps(&peer, &channel));

        let offer = core.transport.create_offer(&settings.transport.offer).await?;
        self.ensure_current(epoch)?;
        core.transport.set_local_description(offer).await?;
        self.ensure_current(epoch)?;

        let limit = Duration::from_millis(settings.transport.ice_gathering_timeout_ms);
        let outcome = core.transport.wait_for_ice_gathering(limit).await?;
        debug!(?outcome, "ice gathering settled");
        self.ensure_current(epoch)?;

        let local = core.transport.local_description()?;
        let answer = self
            .exchange
            .exchange(&local, &token)
            .await
            .map_err(|e| StageError::new(ErrorStage::OpenaiApi, e))?;
        self.ensure_current(epoch)?;

        core.transport.set_remote_description(answer).await?;
        Ok(())
    }

    fn ensure_current(&self, epoch: u64) -> Result<()> {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            Ok(())
        } else {
            Err(SessionError::Aborted)
        }
    }

    fn start_pumps(
        &self,
        peer: &Arc<dyn PeerConnection>,
        channel: &Arc<dyn DataChannel>,
    ) -> CancellationToken {
        let cancel = CancellationToken::new();
        let handle = cancel.clone();
        let tasks = vec![
            tokio::spawn(channel_pump(
                Arc::clone(&self.core),
                channel.subscribe(),
                cancel.clone(),
            )),
            tokio::spawn(peer_pump(
                Arc::clone(&self.core),
                peer.subscribe(),
                cancel.clone(),
            )),
        ];
        let previous = self.pumps.lock().replace(Pumps { cancel, tasks });
        if let Some(previous) = previous {
            previous.stop();
        }
        handle
    }

    /// Close what a superseded attempt created and still holds.
    async fn abandon(&self, attempt: Attempt) {
        if let Some(cancel) = attempt.pumps {
            cancel.cancel();
        }
        let mut closed = 0usize;
        if let Some(channel) = &attempt.channel {
            closed += usize::from(self.core.channel.close_if_current(channel).await);
        }
        if let Some(media) = &attempt.media {
            closed += usize::from(self.core.media.release_if_current(media));
        }
        if let Some(peer) = &attempt.peer {
            closed += usize::from(self.core.transport.close_if_current(peer).await);
        }
        if closed > 0 {
            debug!(closed, "released resources of superseded connect");
        }
    }

    fn link_chat(&self) {
        if !self.core.settings.chat.enabled {
            return;
        }
        let mut links = self.chat_links.lock();
        if links.is_empty() {
            *links = self.core.chat.attach(&self.core.router);
        }
    }

    /// Stop the pumps, then close the channel, release media, and close the
    /// transport. Each step tolerates having nothing to do.
    async fn release_resources(&self) {
        let pumps = self.pumps.lock().take();
        if let Some(pumps) = pumps {
            pumps.stop();
        }
        self.core.channel.close().await;
        self.core.media.release();
        self.core.transport.close().await;
    }

    /// Tear everything down. Safe mid-connect, after an error, and repeatedly.
    ///
    /// Router listeners, the chat list, and speech-activity subscribers are
    /// discarded along with the transport.
    #[instrument(skip_all)]
    pub async fn disconnect(&self) {
        let _ = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.release_resources().await;
        self.core.router.cleanup();
        self.chat_links.lock().clear();
        self.core.chat.destroy();
        self.core.speech.dispose();
        if self.core.state.transition(ConnectionState::Disconnected) {
            self.core.reporter.milestone(Milestone::Disconnected);
        }
    }

    /// Used by the next `connect`; an attempt already running keeps its credential.
    pub fn set_token_provider(&self, provider: Arc<dyn TokenProvider>) {
        *self.token_provider.lock() = provider;
    }

    pub fn on(
        &self,
        kind: SemanticKind,
        handler: impl Fn(&SemanticEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.router.on(kind, handler)
    }

    fn sender(&self) -> &MessageSender {
        self.core.router.sender()
    }

    pub async fn send_raw(&self, event: WireEvent) -> bool {
        self.sender().send_raw(event).await
    }

    pub async fn send_response(&self, params: Option<Value>) -> bool {
        self.sender().send_response(params).await
    }

    pub async fn send_response_strict(&self, options: StrictResponse) -> bool {
        self.sender().send_response_strict(options).await
    }

    pub async fn update_session(&self, patch: Value) -> bool {
        self.sender().update_session(patch).await
    }

    pub async fn send_tool_output(&self, call_id: &str, output: &Value) -> bool {
        self.sender().send_tool_output(call_id, output).await
    }

    pub async fn send_user_text(&self, text: &str) -> bool {
        self.sender().send_user_text(text).await
    }

    pub async fn cancel_response(&self) -> bool {
        self.sender().cancel_response().await
    }

    pub async fn commit_audio_buffer(&self) -> bool {
        self.sender().commit_audio_buffer().await
    }

    pub async fn clear_audio_buffer(&self) -> bool {
        self.sender().clear_audio_buffer().await
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state.current()
    }

    pub fn on_state_change(
        &self,
        f: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.state.subscribe(f)
    }

    pub fn chat(&self) -> Arc<[ChatMessage]> {
        self.core.chat.messages()
    }

    pub fn on_chat_change(
        &self,
        f: impl Fn(&Arc<[ChatMessage]>) + Send + Sync + 'static,
    ) -> Subscription {
        self.core.chat.subscribe(f)
    }

    pub fn local_media(&self) -> Option<Arc<dyn LocalMedia>> {
        self.core.media.local_media()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.core.media.remote_tracks()
    }

    pub fn peer_connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.core.transport.peer()
    }

    pub fn data_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.core.channel.channel()
    }

    pub fn speech_activity(&self) -> &Arc<SpeechActivity> {
        &self.core.speech
    }

    /// Milestones and errors recorded since the last `connect`.
    pub fn reporter(&self) -> &Reporter {
        &self.core.reporter
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.core.settings
    }

    /// Wait for every tool hook started so far.
    pub async fn drain_tool_calls(&self) {
        self.core.router.drain_tool_calls().await;
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        if let Some(pumps) = self.pumps.get_mut().take() {
            pumps.stop();
        }
    }
}
