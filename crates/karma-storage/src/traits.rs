//! Storage trait definitions.

use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Entries per underlying write when batching.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Full key/value contents of a store.
pub type Snapshot = BTreeMap<String, Value>;

/// Thread-safe store handle shared across components.
pub type SharedStore = Arc<dyn PersistentStore>;

/// Durable key to JSON value store.
///
/// Implementations never retry; every failure surfaces to the caller.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Insert or overwrite a value.
    async fn set(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Remove a value. Returns whether it existed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Write several entries as one atomic unit.
    async fn write_chunk(&self, entries: Vec<(String, Value)>) -> StorageResult<()>;

    /// Read every key/value pair.
    async fn get_all(&self) -> StorageResult<Snapshot>;

    /// Remove every key.
    async fn clear(&self) -> StorageResult<()>;

    /// Check if a key exists.
    async fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Write `entries` in chunks of `batch_size`, one underlying write per chunk.
    ///
    /// Each chunk is atomic; the batch as a whole is not. If a chunk fails,
    /// earlier chunks stay committed and the error reports how many entries
    /// made it.
    async fn batch_set(&self, entries: Vec<(String, Value)>, batch_size: usize) -> StorageResult<usize> {
        let batch_size = batch_size.max(1);
        let total = entries.len();
        let mut committed = 0;
        let mut iter = entries.into_iter().peekable();

        while iter.peek().is_some() {
            let chunk: Vec<_> = iter.by_ref().take(batch_size).collect();
            let len = chunk.len();
            if let Err(e) = self.write_chunk(chunk).await {
                warn!(committed, total, error = %e, "batch write failed part-way");
                return Err(StorageError::PartialBatch {
                    committed,
                    source: Box::new(e),
                });
            }
            committed += len;
        }

        debug!(entries = total, batch_size, "batch write committed");
        Ok(committed)
    }
}
