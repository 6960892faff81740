//! # parley-core
//!
//! Shared vocabulary for the parley realtime session client.
//!
//! - **Wire events**: [`WireEvent`](events::WireEvent), the JSON records exchanged on the control channel
//! - **Semantic events**: [`SemanticEvent`](events::SemanticEvent), the normalized events the router emits
//! - **Errors**: the stage taxonomy and [`ErrorEvent`](errors::ErrorEvent) value type
//! - **Reporter**: [`Reporter`](reporter::Reporter), which logs failures and milestones and forwards them to an observer
//! - **Listener sets**: copy-on-emit callback registries used by every component that fans out

#![deny(unsafe_code)]

pub mod chat;
pub mod errors;
pub mod events;
pub mod flow;
pub mod ids;
pub mod listeners;
pub mod reporter;
pub mod state;

pub use chat::{ChatMessage, MessageStatus, Role, TerminalStatus};
pub use errors::{ErrorEvent, ErrorSeverity, ErrorStage};
pub use events::{AssistantChannel, ErrorScope, SemanticEvent, SemanticKind, WireEvent};
pub use flow::{Flow, HookVerdict};
pub use listeners::{ListenerSet, Subscription};
pub use reporter::{ErrorObserver, Milestone, Reporter, HISTORY_LIMIT};
pub use state::ConnectionState;
