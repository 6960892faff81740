//! Collaborator traits for the peer-to-peer transport and local media.
//!
//! The session never implements negotiation itself. It drives an engine
//! through these traits and observes it through broadcast event streams.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parley_settings::{MediaConstraints, OfferOptions, TransportSettings};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::Result;

/// Which side of the negotiation produced a description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A negotiated media/transport capability document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceGatheringState {
    #[default]
    New,
    Gathering,
    Complete,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    /// Transient loss of connectivity; may recover.
    Disconnected,
    /// Terminal failure.
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    #[default]
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransceiverDirection {
    RecvOnly,
    SendRecv,
}

/// A local capture track handed to the peer connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// A track announced by the remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: Option<String>,
}

/// Events observed on a peer connection.
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    IceGathering(IceGatheringState),
    Track(RemoteTrack),
}

/// Events observed on a data channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Close,
    Error(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self { ordered: true }
    }
}

/// Creates peer connections.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn create(&self, settings: &TransportSettings) -> Result<Arc<dyn PeerConnection>>;
}

/// A single peer-to-peer transport session.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// The local description including candidates gathered so far.
    fn local_description(&self) -> Option<SessionDescription>;

    fn ice_gathering_state(&self) -> IceGatheringState;

    fn connection_state(&self) -> PeerConnectionState;

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    async fn add_transceiver(&self, kind: MediaKind, direction: TransceiverDirection)
        -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// An ordered, message-oriented side channel over a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn ready_state(&self) -> ChannelState;

    fn send(&self, text: &str) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    async fn close(&self) -> Result<()>;
}

/// Acquires local capture devices.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Returns [`TransportError::PermissionDenied`](crate::TransportError::PermissionDenied)
    /// when access is refused and `MediaUnavailable` when no device can be opened.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<Arc<dyn LocalMedia>>;
}

/// Acquired local capture.
pub trait LocalMedia: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;

    /// Release the underlying devices. Safe to call more than once.
    fn stop(&self);
}
