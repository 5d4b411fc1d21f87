//! Durable key-value storage and the bounded cache in front of it.
//!
//! This crate provides:
//! - [`PersistentStore`]: async key to JSON value store with chunked batch writes
//! - [`MemoryStore`]: in-process backend with fault injection for tests
//! - [`SqliteStore`]: SQLite backend on a dedicated executor thread
//! - [`CacheLayer`]: bounded TTL cache, oldest-inserted entries evicted first

mod cache;
mod keys;
mod memory;
mod sqlite;
mod traits;

pub use cache::{CacheConfig, CacheLayer};
pub use keys::StorageKeys;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{PersistentStore, SharedStore, Snapshot, DEFAULT_BATCH_SIZE};

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying read or write failed
    #[error("Storage IO error: {0}")]
    Io(String),

    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Executor thread or connection unavailable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stored value is not valid JSON
    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Operation did not complete in time
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// A batched write failed part-way; the first `committed` entries are durable
    #[error("Batch write failed after {committed} committed entries: {source}")]
    PartialBatch {
        committed: usize,
        #[source]
        source: Box<StorageError>,
    },
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Run a storage future with a deadline, reporting expiry as [`StorageError::Timeout`].
pub async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(op, timeout_ms = after.as_millis() as u64, "storage call timed out");
            Err(StorageError::Timeout { op, after })
        }
    }
}
