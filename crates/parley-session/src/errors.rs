//! Session error types.

use parley_core::ErrorStage;
use parley_transport::{StageError, TransportError};
use thiserror::Error;

/// Why `connect` failed.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A connection step failed; `stage` names the most specific step reached.
    #[error("connect failed at {stage}: {source}")]
    Connect {
        stage: ErrorStage,
        #[source]
        source: TransportError,
    },

    /// `disconnect` or a newer `connect` superseded this attempt.
    #[error("connect superseded before it finished")]
    Aborted,
}

impl SessionError {
    pub fn stage(&self) -> Option<ErrorStage> {
        match self {
            Self::Connect { stage, .. } => Some(*stage),
            Self::Aborted => None,
        }
    }
}

impl From<StageError> for SessionError {
    fn from(e: StageError) -> Self {
        Self::Connect {
            stage: e.stage,
            source: e.source,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
