//! Scripted in-memory collaborators for deterministic tests without a network.
//!
//! [`MockEngine`] records every outbound channel write and lets a test inject
//! inbound messages, open or close the control channel, and fail chosen
//! operations. [`MockMediaEngine`] and [`MockExchange`] cover capture and the
//! description exchange.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_settings::{MediaConstraints, OfferOptions, TransportSettings};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::engine::{
    ChannelEvent, ChannelOptions, ChannelState, DataChannel, IceGatheringState, LocalMedia,
    LocalTrack, MediaEngine, MediaKind, PeerConnection, PeerConnectionState, PeerEvent,
    RemoteTrack, SessionDescription, TransceiverDirection, TransportEngine,
};
use crate::errors::{Result, TransportError};
use crate::exchange::DescriptionExchange;

const EVENT_CAPACITY: usize = 256;

/// When the mock peer reports ICE gathering as complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceBehavior {
    /// Synchronously, inside `set_local_description`.
    CompleteOnLocalDescription,
    /// On a background task, this long after `set_local_description`.
    CompleteAfter(Duration),
    Never,
}

/// An operation the mock should fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MockFailure {
    CreatePeer,
    CreateOffer,
    SetLocalDescription,
    SetRemoteDescription,
    CreateChannel,
    AddTrack,
    AddTransceiver,
    Send,
    ClosePeer,
    CloseChannel,
}

#[derive(Clone, Debug)]
struct Script {
    ice: IceBehavior,
    failures: Vec<MockFailure>,
    open_on_remote: bool,
    connect_on_remote: bool,
}

impl Script {
    fn fails(&self, op: MockFailure) -> Result<()> {
        if self.failures.contains(&op) {
            return Err(TransportError::Engine(format!("scripted failure: {op:?}")));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Log {
    peers_created: AtomicUsize,
    peer_closes: AtomicUsize,
    channel_closes: AtomicUsize,
    tracks_added: AtomicUsize,
    transceivers_added: AtomicUsize,
    sent: Mutex<Vec<String>>,
    channel_options: Mutex<Option<ChannelOptions>>,
}

#[derive(Default)]
struct Registry {
    log: Arc<Log>,
    peer: Mutex<Option<Arc<MockPeer>>>,
    channel: Mutex<Option<Arc<MockChannel>>>,
}

/// Scripted [`TransportEngine`].
///
/// By default ICE completes as soon as the local description is set, and
/// setting the remote description opens the control channel and then reports
/// the transport as connected.
#[derive(Clone)]
pub struct MockEngine {
    script: Script,
    registry: Arc<Registry>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            script: Script {
                ice: IceBehavior::CompleteOnLocalDescription,
                failures: Vec::new(),
                open_on_remote: true,
                connect_on_remote: true,
            },
            registry: Arc::new(Registry::default()),
        }
    }

    #[must_use]
    pub fn ice(mut self, behavior: IceBehavior) -> Self {
        self.script.ice = behavior;
        self
    }

    #[must_use]
    pub fn fail_at(mut self, op: MockFailure) -> Self {
        self.script.failures.push(op);
        self
    }

    /// Leave the channel in `connecting` after the remote description is set.
    #[must_use]
    pub fn manual_open(mut self) -> Self {
        self.script.open_on_remote = false;
        self
    }

    /// Do not report transport `connected` after the remote description is set.
    #[must_use]
    pub fn manual_connect(mut self) -> Self {
        self.script.connect_on_remote = false;
        self
    }

    /// A handle for driving and inspecting the engine from a test.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportEngine for MockEngine {
    async fn create(&self, _settings: &TransportSettings) -> Result<Arc<dyn PeerConnection>> {
        self.script.fails(MockFailure::CreatePeer)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let peer = Arc::new(MockPeer {
            script: self.script.clone(),
            log: Arc::clone(&self.registry.log),
            registry: Arc::downgrade(&self.registry),
            events,
            gathering: Arc::new(Mutex::new(IceGatheringState::New)),
            state: Mutex::new(PeerConnectionState::New),
            local: Arc::new(Mutex::new(None)),
        });
        let _ = self.registry.log.peers_created.fetch_add(1, Ordering::SeqCst);
        *self.registry.peer.lock() = Some(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Drives and inspects a [`MockEngine`].
#[derive(Clone)]
pub struct MockHandle {
    registry: Arc<Registry>,
}

impl MockHandle {
    /// Every text written to any control channel, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.registry.log.sent.lock().clone()
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent_texts()
            .iter()
            .filter_map(|t| serde_json::from_str(t).ok())
            .collect()
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|v| v.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    pub fn clear_sent(&self) {
        self.registry.log.sent.lock().clear();
    }

    /// Deliver raw inbound text on the current channel.
    pub fn inject(&self, text: &str) {
        if let Some(channel) = self.channel() {
            let _ = channel.events.send(ChannelEvent::Message(text.to_string()));
        }
    }

    pub fn inject_event(&self, event: &Value) {
        self.inject(&event.to_string());
    }

    pub fn open_channel(&self) {
        if let Some(channel) = self.channel() {
            channel.open();
        }
    }

    pub fn close_channel(&self) {
        if let Some(channel) = self.channel() {
            *channel.state.lock() = ChannelState::Closed;
            let _ = channel.events.send(ChannelEvent::Close);
        }
    }

    pub fn channel_error(&self, message: &str) {
        if let Some(channel) = self.channel() {
            let _ = channel.events.send(ChannelEvent::Error(message.to_string()));
        }
    }

    pub fn set_peer_state(&self, state: PeerConnectionState) {
        if let Some(peer) = self.registry.peer.lock().clone() {
            peer.set_state(state);
        }
    }

    pub fn announce_track(&self, track: RemoteTrack) {
        if let Some(peer) = self.registry.peer.lock().clone() {
            let _ = peer.events.send(PeerEvent::Track(track));
        }
    }

    pub fn peers_created(&self) -> usize {
        self.registry.log.peers_created.load(Ordering::SeqCst)
    }

    pub fn peer_close_count(&self) -> usize {
        self.registry.log.peer_closes.load(Ordering::SeqCst)
    }

    pub fn channel_close_count(&self) -> usize {
        self.registry.log.channel_closes.load(Ordering::SeqCst)
    }

    pub fn tracks_added(&self) -> usize {
        self.registry.log.tracks_added.load(Ordering::SeqCst)
    }

    pub fn transceivers_added(&self) -> usize {
        self.registry.log.transceivers_added.load(Ordering::SeqCst)
    }

    pub fn channel_options(&self) -> Option<ChannelOptions> {
        *self.registry.log.channel_options.lock()
    }

    pub fn channel_state(&self) -> Option<ChannelState> {
        self.channel().map(|c| *c.state.lock())
    }

    fn channel(&self) -> Option<Arc<MockChannel>> {
        self.registry.channel.lock().clone()
    }
}

struct MockPeer {
    script: Script,
    log: Arc<Log>,
    registry: Weak<Registry>,
    events: broadcast::Sender<PeerEvent>,
    gathering: Arc<Mutex<IceGatheringState>>,
    state: Mutex<PeerConnectionState>,
    local: Arc<Mutex<Option<SessionDescription>>>,
}

impl MockPeer {
    fn set_state(&self, state: PeerConnectionState) {
        *self.state.lock() = state;
        let _ = self.events.send(PeerEvent::ConnectionState(state));
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self, _options: &OfferOptions) -> Result<SessionDescription> {
        self.script.fails(MockFailure::CreateOffer)?;
        Ok(SessionDescription::offer("v=0\r\no=mock-offer 1 1 IN IP4 127.0.0.1\r\n"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.script.fails(MockFailure::SetLocalDescription)?;
        *self.local.lock() = Some(description);
        *self.gathering.lock() = IceGatheringState::Gathering;
        let _ = self
            .events
            .send(PeerEvent::IceGathering(IceGatheringState::Gathering));

        match self.script.ice {
            IceBehavior::CompleteOnLocalDescription => {
                complete_gathering(&self.gathering, &self.local, &self.events);
            }
            IceBehavior::CompleteAfter(delay) => {
                let gathering = Arc::clone(&self.gathering);
                let local = Arc::clone(&self.local);
                let events = self.events.clone();
                drop(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    complete_gathering(&gathering, &local, &events);
                }));
            }
            IceBehavior::Never => {}
        }
        Ok(())
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<()> {
        self.script.fails(MockFailure::SetRemoteDescription)?;
        if self.script.open_on_remote {
            let channel = self
                .registry
                .upgrade()
                .and_then(|registry| registry.channel.lock().clone());
            if let Some(channel) = channel {
                channel.open();
            }
        }
        if self.script.connect_on_remote {
            self.set_state(PeerConnectionState::Connected);
        }
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    fn ice_gathering_state(&self) -> IceGatheringState {
        *self.gathering.lock()
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        self.script.fails(MockFailure::CreateChannel)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let channel = Arc::new(MockChannel {
            label: label.to_string(),
            state: Mutex::new(ChannelState::Connecting),
            events,
            log: Arc::clone(&self.log),
            fail_send: self.script.failures.contains(&MockFailure::Send),
            fail_close: self.script.failures.contains(&MockFailure::CloseChannel),
        });
        *self.log.channel_options.lock() = Some(options);
        if let Some(registry) = self.registry.upgrade() {
            *registry.channel.lock() = Some(Arc::clone(&channel));
        }
        Ok(channel)
    }

    async fn add_track(&self, _track: &LocalTrack) -> Result<()> {
        self.script.fails(MockFailure::AddTrack)?;
        let _ = self.log.tracks_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_transceiver(
        &self,
        _kind: MediaKind,
        _direction: TransceiverDirection,
    ) -> Result<()> {
        self.script.fails(MockFailure::AddTransceiver)?;
        let _ = self.log.transceivers_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.log.peer_closes.fetch_add(1, Ordering::SeqCst);
        self.script.fails(MockFailure::ClosePeer)?;
        self.set_state(PeerConnectionState::Closed);
        Ok(())
    }
}

fn complete_gathering(
    gathering: &Mutex<IceGatheringState>,
    local: &Mutex<Option<SessionDescription>>,
    events: &broadcast::Sender<PeerEvent>,
) {
    if let Some(description) = local.lock().as_mut() {
        description
            .sdp
            .push_str("a=candidate:1 1 udp 2122260223 127.0.0.1 9 typ host\r\n");
    }
    *gathering.lock() = IceGatheringState::Complete;
    let _ = events.send(PeerEvent::IceGathering(IceGatheringState::Complete));
}

struct MockChannel {
    label: String,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    log: Arc<Log>,
    fail_send: bool,
    fail_close: bool,
}

impl MockChannel {
    fn open(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Open {
                return;
            }
            *state = ChannelState::Open;
        }
        let _ = self.events.send(ChannelEvent::Open);
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn send(&self, text: &str) -> Result<()> {
        if *self.state.lock() != ChannelState::Open {
            return Err(TransportError::ChannelNotOpen);
        }
        if self.fail_send {
            return Err(TransportError::Engine("scripted failure: Send".into()));
        }
        self.log.sent.lock().push(text.to_string());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        let _ = self.log.channel_closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::Engine("scripted failure: CloseChannel".into()));
        }
        *self.state.lock() = ChannelState::Closed;
        Ok(())
    }
}

/// How [`MockMediaEngine`] answers capture requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaOutcome {
    Grant,
    Deny,
    Unavailable,
}

#[derive(Default)]
struct MediaLog {
    acquires: AtomicUsize,
    stops: AtomicUsize,
}

#[derive(Clone)]
pub struct MockMediaEngine {
    outcome: MediaOutcome,
    log: Arc<MediaLog>,
}

impl MockMediaEngine {
    pub fn new(outcome: MediaOutcome) -> Self {
        Self {
            outcome,
            log: Arc::new(MediaLog::default()),
        }
    }

    pub fn acquire_count(&self) -> usize {
        self.log.acquires.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.log.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<Arc<dyn LocalMedia>> {
        let _ = self.log.acquires.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            MediaOutcome::Grant => Ok(Arc::new(MockLocalMedia {
                log: Arc::clone(&self.log),
                stopped: AtomicBool::new(false),
            })),
            MediaOutcome::Deny => Err(TransportError::PermissionDenied(
                "user dismissed the prompt".into(),
            )),
            MediaOutcome::Unavailable => Err(TransportError::MediaUnavailable(
                "no input device".into(),
            )),
        }
    }
}

struct MockLocalMedia {
    log: Arc<MediaLog>,
    stopped: AtomicBool,
}

impl LocalMedia for MockLocalMedia {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![LocalTrack {
            id: "mic-0".into(),
            kind: MediaKind::Audio,
        }]
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.log.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// How [`MockExchange`] answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Answer,
    Status(u16),
    NotSdp,
}

/// Scripted [`DescriptionExchange`] that records the credentials it was given.
#[derive(Clone)]
pub struct MockExchange {
    outcome: ExchangeOutcome,
    credentials: Arc<Mutex<Vec<String>>>,
}

impl MockExchange {
    pub fn new(outcome: ExchangeOutcome) -> Self {
        Self {
            outcome,
            credentials: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn answering() -> Self {
        Self::new(ExchangeOutcome::Answer)
    }

    pub fn credentials(&self) -> Vec<String> {
        self.credentials.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.credentials.lock().len()
    }
}

#[async_trait]
impl DescriptionExchange for MockExchange {
    async fn exchange(
        &self,
        _offer: &SessionDescription,
        credential: &SecretString,
    ) -> Result<SessionDescription> {
        self.credentials
            .lock()
            .push(credential.expose_secret().to_string());
        match &self.outcome {
            ExchangeOutcome::Answer => Ok(SessionDescription::answer(
                "v=0\r\no=mock-answer 1 1 IN IP4 127.0.0.1\r\n",
            )),
            ExchangeOutcome::Status(status) => Err(TransportError::Exchange {
                status: *status,
                body: "scripted".into(),
            }),
            ExchangeOutcome::NotSdp => Err(TransportError::InvalidAnswer),
        }
    }
}
