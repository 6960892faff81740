//! # parley-router
//!
//! Event routing between the control channel and the application.
//!
//! - [`EventRouter`]: incoming middleware, classification into [`SemanticEvent`](parley_core::SemanticEvent)s,
//!   per-kind listeners, tool-call argument buffering, and tool hook dispatch
//! - [`MessageSender`]: outgoing middleware and typed command helpers
//! - [`SessionHooks`]: the caller's hook capability set
//! - [`SpeechActivity`]: per-session speaking state fed by an incoming middleware

#![deny(unsafe_code)]

pub mod activity;
pub mod hooks;
pub mod middleware;
pub mod router;
pub mod sender;

pub use activity::{SpeechActivity, SpeechActivityMiddleware, SpeechSnapshot};
pub use hooks::{NoHooks, SessionHooks, ToolCall};
pub use middleware::{
    block_empty_user_text, incoming_fn, outgoing_fn, IncomingContext, IncomingMiddleware,
    OutgoingMiddleware, SessionView,
};
pub use router::EventRouter;
pub use sender::{MessageSender, StrictResponse};
