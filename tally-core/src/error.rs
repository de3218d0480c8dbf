//! Error types for tally-core

use thiserror::Error;

/// Main error type for the tally-core library
///
/// Tracking calls never surface these to the caller; they are logged and the
/// call becomes a no-op. Construction and the explicit waiting helpers on
/// [`crate::Tally`] return them.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected input (empty identifier, non-finite number, ...)
    #[error("validation error: {0}")]
    Validation(String),

    /// Transport/API error
    #[error("transport error: {0}")]
    Transport(String),

    /// Snapshot could not be written or read back
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The background worker is gone or did not answer in time
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Result type alias for tally-core
pub type Result<T> = std::result::Result<T, Error>;
