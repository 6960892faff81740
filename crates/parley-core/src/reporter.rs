//! Error/outcome reporter.
//!
//! Every component reports failures here instead of deciding on its own how
//! to surface them. The reporter logs each [`ErrorEvent`] at a level matching
//! its severity and forwards it to the caller's [`ErrorObserver`]. Connection
//! milestones are logged and kept for inspection until the next `reset`.
//! Recorded history is capped at [`HISTORY_LIMIT`] entries per kind; the
//! oldest entries go first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::errors::{ErrorEvent, ErrorSeverity, ErrorStage};

/// Most errors and milestones each kept in the reporter's history.
pub const HISTORY_LIMIT: usize = 256;

fn record<T>(history: &Mutex<VecDeque<T>>, item: T) {
    let mut history = history.lock();
    if history.len() == HISTORY_LIMIT {
        let _ = history.pop_front();
    }
    history.push_back(item);
}

/// Receives every reported error event.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, event: &ErrorEvent);
}

impl<F> ErrorObserver for F
where
    F: Fn(&ErrorEvent) + Send + Sync,
{
    fn on_error(&self, event: &ErrorEvent) {
        self(event);
    }
}

/// Steps reached while establishing a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Milestone {
    CredentialObtained,
    TransportCreated,
    MediaAttached,
    ChannelCreated,
    OfferCreated,
    LocalDescriptionSet,
    IceGatheringSettled,
    RemoteDescriptionSet,
    ChannelOpen,
    TransportConnected,
    Disconnected,
}

impl Milestone {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CredentialObtained => "credential obtained",
            Self::TransportCreated => "transport session created",
            Self::MediaAttached => "media attached",
            Self::ChannelCreated => "control channel created",
            Self::OfferCreated => "offer created",
            Self::LocalDescriptionSet => "local description set",
            Self::IceGatheringSettled => "ice gathering settled",
            Self::RemoteDescriptionSet => "remote description set",
            Self::ChannelOpen => "control channel open",
            Self::TransportConnected => "transport connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    observer: Option<Arc<dyn ErrorObserver>>,
    verbose_milestones: bool,
    milestones: Mutex<VecDeque<Milestone>>,
    errors: Mutex<VecDeque<ErrorEvent>>,
}

/// Shared, cheaply cloneable reporter handle.
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Inner>,
}

impl Reporter {
    /// Reporter without an observer; events are only logged.
    pub fn new() -> Self {
        Self::build(None, true)
    }

    pub fn with_observer(observer: Arc<dyn ErrorObserver>) -> Self {
        Self::build(Some(observer), true)
    }

    /// Log milestones at `debug` instead of `info`.
    #[must_use]
    pub fn quiet_milestones(self) -> Self {
        Self::build(self.inner.observer.clone(), false)
    }

    fn build(observer: Option<Arc<dyn ErrorObserver>>, verbose_milestones: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                observer,
                verbose_milestones,
                milestones: Mutex::new(VecDeque::new()),
                errors: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Log the event and forward it to the observer.
    pub fn report(&self, event: ErrorEvent) {
        match event.severity {
            ErrorSeverity::Critical => error!(
                stage = %event.stage,
                recoverable = event.recoverable,
                error = %event.error,
                "session error"
            ),
            ErrorSeverity::Warning => warn!(
                stage = %event.stage,
                recoverable = event.recoverable,
                error = %event.error,
                "session warning"
            ),
            ErrorSeverity::Info => info!(stage = %event.stage, message = %event.error, "session notice"),
        }
        record(&self.inner.errors, event.clone());
        if let Some(observer) = &self.inner.observer {
            observer.on_error(&event);
        }
    }

    /// Report a recoverable warning.
    pub fn warn(&self, stage: ErrorStage, error: impl fmt::Display) {
        self.report(ErrorEvent::warning(stage, error));
    }

    /// Report a critical error and hand the event back to the caller.
    pub fn critical(&self, stage: ErrorStage, error: impl fmt::Display) -> ErrorEvent {
        let event = ErrorEvent::critical(stage, error);
        self.report(event.clone());
        event
    }

    pub fn milestone(&self, milestone: Milestone) {
        if self.inner.verbose_milestones {
            info!(milestone = %milestone, "session milestone");
        } else {
            debug!(milestone = %milestone, "session milestone");
        }
        record(&self.inner.milestones, milestone);
    }

    /// Milestones reached since the last reset, in order.
    pub fn milestones(&self) -> Vec<Milestone> {
        self.inner.milestones.lock().iter().copied().collect()
    }

    pub fn has_milestone(&self, milestone: Milestone) -> bool {
        self.inner.milestones.lock().contains(&milestone)
    }

    /// Errors reported since the last reset, in order.
    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.inner.errors.lock().iter().cloned().collect()
    }

    /// Forget recorded milestones and errors; called at the start of each connect.
    pub fn reset(&self) {
        self.inner.milestones.lock().clear();
        self.inner.errors.lock().clear();
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("has_observer", &self.inner.observer.is_some())
            .field("milestones", &self.inner.milestones.lock().len())
            .finish()
    }
}
