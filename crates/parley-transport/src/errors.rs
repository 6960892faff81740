//! Transport error types.

use parley_core::ErrorStage;
use thiserror::Error;

/// Failures raised by transport collaborators and the HTTP exchanges.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport engine rejected an operation.
    #[error("transport engine error: {0}")]
    Engine(String),

    /// The user or platform refused microphone access.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Local media could not be acquired or attached.
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("control channel is not open")]
    ChannelNotOpen,

    /// The credential supplier produced nothing usable.
    #[error("credential supplier returned an empty token")]
    EmptyCredential,

    #[error("credential endpoint returned {status}: {body}")]
    Credential { status: u16, body: String },

    /// The description-exchange endpoint answered with a non-2xx status.
    #[error("description exchange failed with {status}: {body}")]
    Exchange { status: u16, body: String },

    /// The description-exchange endpoint answered with something other than SDP.
    #[error("description exchange returned a body that is not a session description")]
    InvalidAnswer,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A [`TransportError`] tagged with the connection stage it happened in.
#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct StageError {
    pub stage: ErrorStage,
    #[source]
    pub source: TransportError,
}

impl StageError {
    pub fn new(stage: ErrorStage, source: TransportError) -> Self {
        Self { stage, source }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
