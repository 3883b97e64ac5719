//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when reading or writing events.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The record does not match the outcome contract.
    #[error("invalid outcome record: {0}")]
    InvalidRecord(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
