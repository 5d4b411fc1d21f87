//! Remote replica contract.

use crate::{SyncError, SyncResult};
use async_trait::async_trait;
use karma_storage::{SharedStore, Snapshot, DEFAULT_BATCH_SIZE};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// A key change made on the remote side. `None` means the key was removed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub key: String,
    pub new_value: Option<Value>,
}

/// The remote side of sync.
#[async_trait]
pub trait RemoteReplica: Send + Sync {
    async fn get_all(&self) -> SyncResult<Snapshot>;

    /// Upsert every entry of `snapshot`. Keys not in it are left alone.
    async fn set_all(&self, snapshot: Snapshot) -> SyncResult<()>;

    /// Changes made to the replica by other writers.
    fn subscribe(&self) -> broadcast::Receiver<RemoteChange>;
}

/// Remote replica backed by a [`PersistentStore`](karma_storage::PersistentStore).
///
/// Writes through [`RemoteReplica::set_all`] are this device's own and are
/// not broadcast. [`StoreReplica::write_external`] models another device.
pub struct StoreReplica {
    store: SharedStore,
    changes: broadcast::Sender<RemoteChange>,
}

impl StoreReplica {
    pub fn new(store: SharedStore) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { store, changes }
    }

    /// Write `key` as another device would, notifying subscribers.
    pub async fn write_external(&self, key: &str, value: Option<Value>) -> SyncResult<()> {
        match &value {
            Some(v) => self.store.set(key, v.clone()).await.map_err(remote)?,
            None => {
                self.store.delete(key).await.map_err(remote)?;
            }
        }
        let receivers = self
            .changes
            .send(RemoteChange {
                key: key.to_string(),
                new_value: value,
            })
            .unwrap_or(0);
        debug!(key, receivers, "Remote change published");
        Ok(())
    }
}

fn remote(err: karma_storage::StorageError) -> SyncError {
    SyncError::Remote(err.to_string())
}

#[async_trait]
impl RemoteReplica for StoreReplica {
    async fn get_all(&self) -> SyncResult<Snapshot> {
        self.store.get_all().await.map_err(remote)
    }

    async fn set_all(&self, snapshot: Snapshot) -> SyncResult<()> {
        self.store
            .batch_set(snapshot.into_iter().collect(), DEFAULT_BATCH_SIZE)
            .await
            .map_err(remote)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RemoteChange> {
        self.changes.subscribe()
    }
}
