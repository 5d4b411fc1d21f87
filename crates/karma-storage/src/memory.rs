//! In-process store.
//!
//! Backs tests and the in-memory remote replica. Write faults and latency can
//! be injected to exercise partial batches and timeouts.

use crate::{PersistentStore, Snapshot, StorageError, StorageResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Default)]
struct Faults {
    /// Underlying writes allowed before every further write fails.
    fail_after_writes: Option<usize>,
    /// Underlying writes performed so far.
    writes: usize,
    /// Delay applied before every operation.
    latency: Option<Duration>,
}

/// Map-backed [`PersistentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<Snapshot>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            data: Mutex::new(entries.into_iter().collect()),
            faults: Mutex::default(),
        }
    }

    /// Let `n` more underlying writes succeed, then fail every write after.
    pub fn fail_after_writes(&self, n: usize) {
        let mut faults = self.faults.lock();
        faults.fail_after_writes = Some(faults.writes + n);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Remove injected faults.
    pub fn heal(&self) {
        let mut faults = self.faults.lock();
        faults.fail_after_writes = None;
        faults.latency = None;
    }

    /// Underlying writes performed so far, failed ones included.
    pub fn write_count(&self) -> usize {
        self.faults.lock().writes
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Snapshot {
        self.data.lock().clone()
    }

    async fn delay(&self) {
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn begin_write(&self) -> StorageResult<()> {
        let mut faults = self.faults.lock();
        faults.writes += 1;
        match faults.fail_after_writes {
            Some(limit) if faults.writes > limit => Err(StorageError::Io(format!(
                "injected write failure (write #{})",
                faults.writes
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.delay().await;
        Ok(self.data.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.delay().await;
        self.begin_write()?;
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.delay().await;
        self.begin_write()?;
        Ok(self.data.lock().remove(key).is_some())
    }

    async fn write_chunk(&self, entries: Vec<(String, Value)>) -> StorageResult<()> {
        self.delay().await;
        self.begin_write()?;
        let mut data = self.data.lock();
        data.extend(entries);
        Ok(())
    }

    async fn get_all(&self) -> StorageResult<Snapshot> {
        self.delay().await;
        Ok(self.data.lock().clone())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.delay().await;
        self.begin_write()?;
        self.data.lock().clear();
        Ok(())
    }
}
