//! Settings error types.

use thiserror::Error;

/// Errors that can occur when resolving session settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read a settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Overrides were not valid JSON or did not fit the settings schema.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was out of range or inconsistent.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
