//! # parley-settings
//!
//! Session configuration for parley.
//!
//! Settings are resolved once, when a session is constructed, from three
//! layers (in priority order):
//! 1. **Compiled defaults**: [`SessionSettings::default()`]
//! 2. **Caller overrides**: a JSON patch or settings file, deep-merged over defaults
//! 3. **Environment variables**: `PARLEY_*` overrides (highest priority)
//!
//! Derived rules (see [`SessionSettings::finalize`]) run after merging.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings_from_path, parse_bool, parse_u64_range};
pub use types::*;
