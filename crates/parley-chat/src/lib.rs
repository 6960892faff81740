//! # parley-chat
//!
//! Reconciles streamed user and assistant events into one ordered list of
//! chat messages. Feed it from an [`EventRouter`](parley_router::EventRouter)
//! with [`ChatStore::attach`].

#![deny(unsafe_code)]

pub mod store;

pub use store::{default_meaningful, ChatStore, MeaningfulFn, CHAT_EVENTS};
