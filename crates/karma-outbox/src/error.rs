//! Outbox error types.

use karma_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Store error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Collector rejected or failed the event
    #[error("Send failed: {0}")]
    Send(String),

    /// Send did not complete in time
    #[error("Send timed out after {0:?}")]
    Timeout(Duration),

    /// Background worker already running
    #[error("Event queue worker already started")]
    AlreadyStarted,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
