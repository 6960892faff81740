//! Error taxonomy for session failures.
//!
//! Every failure the client observes is described by an [`ErrorEvent`]: the
//! [`ErrorStage`] it happened in, a [`ErrorSeverity`], and whether the session
//! can keep running. Events are handed to the
//! [`Reporter`](crate::reporter::Reporter), which logs them and forwards them to
//! the caller's observer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where in the session lifecycle an error was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    PeerConnection,
    InitPeerConnection,
    CreateOffer,
    SetLocalDescription,
    SetRemoteDescription,
    IceGathering,
    DataChannel,
    GetUserMedia,
    LocalStream,
    RemoteStream,
    MicrophonePermission,
    IosTransceiver,
    FetchToken,
    OpenaiApi,
    Hangup,
}

impl ErrorStage {
    /// Wire name of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerConnection => "peer_connection",
            Self::InitPeerConnection => "init_peer_connection",
            Self::CreateOffer => "create_offer",
            Self::SetLocalDescription => "set_local_description",
            Self::SetRemoteDescription => "set_remote_description",
            Self::IceGathering => "ice_gathering",
            Self::DataChannel => "data_channel",
            Self::GetUserMedia => "get_user_media",
            Self::LocalStream => "local_stream",
            Self::RemoteStream => "remote_stream",
            Self::MicrophonePermission => "microphone_permission",
            Self::IosTransceiver => "ios_transceiver",
            Self::FetchToken => "fetch_token",
            Self::OpenaiApi => "openai_api",
            Self::Hangup => "hangup",
        }
    }

    /// All stages, in lifecycle order.
    pub fn all() -> &'static [ErrorStage] {
        &[
            Self::FetchToken,
            Self::InitPeerConnection,
            Self::PeerConnection,
            Self::GetUserMedia,
            Self::MicrophonePermission,
            Self::LocalStream,
            Self::IosTransceiver,
            Self::RemoteStream,
            Self::DataChannel,
            Self::CreateOffer,
            Self::SetLocalDescription,
            Self::IceGathering,
            Self::OpenaiApi,
            Self::SetRemoteDescription,
            Self::Hangup,
        ]
    }
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious a reported error is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// The session cannot continue; forces the `error` connection state.
    Critical,
    Warning,
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => f.write_str("critical"),
            Self::Warning => f.write_str("warning"),
            Self::Info => f.write_str("info"),
        }
    }
}

/// A classified failure, as delivered to the error observer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub stage: ErrorStage,
    pub error: String,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorEvent {
    /// Build an event with an explicit severity and recoverability.
    pub fn new(
        stage: ErrorStage,
        error: impl fmt::Display,
        severity: ErrorSeverity,
        recoverable: bool,
    ) -> Self {
        Self {
            stage,
            error: error.to_string(),
            severity,
            recoverable,
            timestamp: Utc::now(),
            context: None,
        }
    }

    /// Non-recoverable failure.
    pub fn critical(stage: ErrorStage, error: impl fmt::Display) -> Self {
        Self::new(stage, error, ErrorSeverity::Critical, false)
    }

    /// Recoverable failure; the session keeps running.
    pub fn warning(stage: ErrorStage, error: impl fmt::Display) -> Self {
        Self::new(stage, error, ErrorSeverity::Warning, true)
    }

    pub fn info(stage: ErrorStage, message: impl fmt::Display) -> Self {
        Self::new(stage, message, ErrorSeverity::Info, true)
    }

    /// Attach structured context for programmatic handling.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == ErrorSeverity::Critical
    }
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.stage, self.severity, self.error)
    }
}
