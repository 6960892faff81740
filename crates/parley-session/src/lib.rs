//! # parley-session
//!
//! The session orchestrator and public surface of parley.
//!
//! Build [`SessionOptions`] from [`SessionSettings`](parley_settings::SessionSettings)
//! plus the runtime collaborators, create a [`RealtimeSession`], and call
//! [`connect`](RealtimeSession::connect). Inbound events arrive through
//! [`on`](RealtimeSession::on) listeners and the reconciled
//! [`chat`](RealtimeSession::chat); commands go out through the `send_*` helpers.

#![deny(unsafe_code)]

pub mod errors;
pub mod options;
pub mod session;
pub mod state;

pub use errors::{Result, SessionError};
pub use options::SessionOptions;
pub use session::RealtimeSession;
pub use state::ConnectionStateMachine;
