use crate::events::WireEvent;

/// Outcome of a middleware stage.
#[derive(Clone, Debug, PartialEq)]
pub enum Flow {
    /// Pass the current event on unchanged.
    Continue,
    /// Later stages (and the final consumer) see this event instead.
    Replace(WireEvent),
    /// End processing of this event immediately.
    Stop,
}

impl Flow {
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop)
    }
}

/// Outcome of a per-delta observer hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HookVerdict {
    /// Emit the semantic event as usual.
    #[default]
    Pass,
    /// Suppress the semantic event; side effects already done by the hook stand.
    Consume,
}

impl HookVerdict {
    pub fn is_consumed(self) -> bool {
        self == Self::Consume
    }
}
