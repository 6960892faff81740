//! # parley-transport
//!
//! External collaborators and the managers that own them for one connection:
//!
//! - [`engine`]: traits for the transport engine, peer connection, data channel, and local media
//! - [`session::TransportSessionManager`]: creates the peer connection, negotiates, waits for ICE
//! - [`media::MediaBridge`]: acquires and attaches local capture, tracks remote media
//! - [`channel::ControlChannelManager`]: the ordered control channel and its wire codec
//! - [`credential`] and [`exchange`]: the ephemeral credential and description-exchange HTTP clients
//! - [`mock`]: scripted in-memory implementations for tests

#![deny(unsafe_code)]

pub mod channel;
pub mod credential;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod media;
pub mod mock;
pub mod session;

pub use channel::ControlChannelManager;
pub use credential::{token_fn, HttpTokenProvider, StaticTokenProvider, TokenProvider};
pub use engine::{
    ChannelEvent, ChannelOptions, ChannelState, DataChannel, IceGatheringState, LocalMedia,
    LocalTrack, MediaEngine, MediaKind, PeerConnection, PeerConnectionState, PeerEvent,
    RemoteTrack, SdpKind, SessionDescription, TransceiverDirection, TransportEngine,
};
pub use errors::{Result, StageError, TransportError};
pub use exchange::{DescriptionExchange, HttpDescriptionExchange};
pub use media::MediaBridge;
pub use session::{IceOutcome, TransportSessionManager};
