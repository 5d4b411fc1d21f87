//! Sync coordinator.
//!
//! Callers must hold the runtime's ledger lock around [`SyncCoordinator::force_sync`],
//! [`SyncCoordinator::push`] and [`SyncCoordinator::apply_remote_changes`];
//! the coordinator writes the local store directly.

use crate::merge::{bound_days, check_remote};
use crate::{reconcile_detailed, RemoteChange, RemoteReplica, SyncError, SyncResult};
use chrono::{DateTime, Utc};
use karma_config_and_utils::SharedClock;
use karma_storage::{with_timeout, SharedStore, Snapshot, StorageKeys, DEFAULT_BATCH_SIZE};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Deadline for every store and replica call.
    pub io_timeout: Duration,
    pub batch_size: usize,
    /// Days of archive and history kept after a merge.
    pub history_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(10),
            batch_size: DEFAULT_BATCH_SIZE,
            history_capacity: 30,
        }
    }
}

/// Sync lifecycle. Terminal states hold until the next cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Success,
    Error,
    /// Completed, but some remote values were rejected and local kept.
    Conflict,
}

/// Observable sync state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub offline: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            offline: false,
            last_synced_at: None,
            last_error: None,
        }
    }
}

/// What a sync cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Local data was copied to an uninitialized remote first.
    pub migrated: bool,
    /// Keys written to both replicas.
    pub written: usize,
    pub conflicted: Vec<String>,
    pub unresolvable: Vec<String>,
}

pub struct SyncCoordinator {
    config: SyncConfig,
    local: SharedStore,
    remote: Arc<dyn RemoteReplica>,
    clock: SharedClock,
    state: watch::Sender<SyncState>,
    initialized: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        local: SharedStore,
        remote: Arc<dyn RemoteReplica>,
        clock: SharedClock,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::default());
        Self {
            config,
            local,
            remote,
            clock,
            state,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn remote(&self) -> &Arc<dyn RemoteReplica> {
        &self.remote
    }

    pub fn is_online(&self) -> bool {
        !self.state.borrow().offline
    }

    /// Update connectivity. Returns true when connectivity was just restored,
    /// in which case the caller should force a sync.
    pub fn set_online(&self, online: bool) -> bool {
        let mut restored = false;
        self.state.send_if_modified(|state| {
            if state.offline != online {
                return false;
            }
            state.offline = !online;
            restored = online;
            true
        });

        if restored {
            info!("Connectivity restored");
        } else if !online {
            info!("Working offline");
        }
        restored
    }

    /// Copy local data to the remote if it has never been initialized.
    ///
    /// Returns whether a migration happened.
    pub async fn initialize(&self) -> SyncResult<bool> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let remote = self.remote_call("get_all", self.remote.get_all()).await?;
        let marked = remote
            .get(StorageKeys::SYNC_INITIALIZED)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !marked {
            let local = self.local_snapshot().await?;
            let count = local.len();
            self.remote_call("set_all", self.remote.set_all(local)).await?;

            let mut marker = Snapshot::new();
            marker.insert(StorageKeys::SYNC_INITIALIZED.to_string(), Value::Bool(true));
            self.remote_call("set_all", self.remote.set_all(marker)).await?;
            info!(keys = count, "Migrated local data to remote replica");
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(!marked)
    }

    /// Read both replicas, reconcile, and push the result to both.
    pub async fn force_sync(&self) -> SyncResult<SyncReport> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }

        self.set_status(SyncStatus::Syncing);
        let result = self.sync_once().await;
        self.finish(&result, |report| report.unresolvable.is_empty());
        result
    }

    /// Write `resolved` to the local store and the remote replica.
    ///
    /// Local is written first. If either write fails, local is restored to
    /// what it held before the push and the remote is left untouched or
    /// failed, never half-applied by this call.
    pub async fn push(&self, resolved: &Snapshot) -> SyncResult<()> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }

        self.set_status(SyncStatus::Syncing);
        let result = self.push_inner(resolved).await;
        self.finish(&result, |_| true);
        result
    }

    /// Write remote deltas into the local store.
    ///
    /// Removals and device-local keys are ignored. Typed values that fail
    /// validation are skipped. Returns the number of keys written.
    pub async fn apply_remote_changes(&self, changes: Vec<RemoteChange>) -> SyncResult<usize> {
        let mut updates: BTreeMap<String, Value> = BTreeMap::new();

        for change in changes {
            if StorageKeys::is_local_only(&change.key) {
                continue;
            }
            let Some(value) = change.new_value else {
                debug!(key = %change.key, "Ignoring remote removal");
                continue;
            };
            if let Err(reason) = check_remote(&change.key, &value) {
                warn!(key = %change.key, reason = %reason, "SyncConflictUnresolvable: skipping remote change");
                continue;
            }
            updates.insert(change.key, value);
        }

        if updates.is_empty() {
            return Ok(0);
        }
        bound_days(&mut updates, self.config.history_capacity);

        let keys: Vec<String> = updates.keys().cloned().collect();
        let written = with_timeout(
            "apply_remote_changes",
            self.config.io_timeout,
            self.local
                .batch_set(updates.into_iter().collect(), self.config.batch_size),
        )
        .await?;
        info!(keys = ?keys, "Applied remote changes");
        Ok(written)
    }

    async fn sync_once(&self) -> SyncResult<SyncReport> {
        let migrated = self.initialize().await?;

        let local = self.local_snapshot().await?;
        let mut remote = self.remote_call("get_all", self.remote.get_all()).await?;
        remote.retain(|key, _| !StorageKeys::is_local_only(key));

        let reconciliation = reconcile_detailed(&local, &remote);
        let conflicted: Vec<String> = reconciliation
            .conflicted()
            .into_iter()
            .map(String::from)
            .collect();
        let unresolvable: Vec<String> = reconciliation
            .unresolvable()
            .into_iter()
            .map(String::from)
            .collect();
        if !conflicted.is_empty() {
            info!(keys = ?conflicted, "Resolving conflicts");
        }

        let mut resolved = reconciliation.resolved;
        let trimmed = bound_days(&mut resolved, self.config.history_capacity);
        if !trimmed.is_empty() {
            debug!(keys = ?trimmed, "Trimmed merged days to capacity");
        }
        self.push_inner(&resolved).await?;

        Ok(SyncReport {
            migrated,
            written: resolved.len(),
            conflicted,
            unresolvable,
        })
    }

    async fn push_inner(&self, resolved: &Snapshot) -> SyncResult<()> {
        let mut resolved = resolved.clone();
        resolved.retain(|key, _| !StorageKeys::is_local_only(key));
        if resolved.is_empty() {
            return Ok(());
        }

        let before = with_timeout("sync_local_read", self.config.io_timeout, self.local.get_all()).await?;

        let entries: Vec<(String, Value)> = resolved
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Err(err) = with_timeout(
            "sync_local_write",
            self.config.io_timeout,
            self.local.batch_set(entries, self.config.batch_size),
        )
        .await
        {
            self.restore_local(&before, &resolved).await;
            return Err(err.into());
        }

        if let Err(err) = self
            .remote_call("set_all", self.remote.set_all(resolved.clone()))
            .await
        {
            self.restore_local(&before, &resolved).await;
            return Err(err);
        }

        debug!(keys = resolved.len(), "Pushed resolved snapshot");
        Ok(())
    }

    /// Put every key touched by a failed push back to its pre-push value.
    async fn restore_local(&self, before: &Snapshot, touched: &Snapshot) {
        let restore: Vec<(String, Value)> = touched
            .keys()
            .filter_map(|k| before.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let added: Vec<&String> = touched.keys().filter(|k| !before.contains_key(*k)).collect();

        if let Err(err) = with_timeout(
            "sync_local_restore",
            self.config.io_timeout,
            self.local.batch_set(restore, self.config.batch_size),
        )
        .await
        {
            error!(error = %err, "Failed to restore local store after push failure");
            return;
        }
        for key in added {
            if let Err(err) =
                with_timeout("sync_local_restore", self.config.io_timeout, self.local.delete(key)).await
            {
                error!(key = %key, error = %err, "Failed to remove key after push failure");
            }
        }
        warn!(keys = touched.len(), "Restored local store after failed push");
    }

    async fn local_snapshot(&self) -> SyncResult<Snapshot> {
        let mut local = with_timeout("sync_local_read", self.config.io_timeout, self.local.get_all()).await?;
        local.retain(|key, _| !StorageKeys::is_local_only(key));
        Ok(local)
    }

    async fn remote_call<T, F>(&self, op: &'static str, fut: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.config.io_timeout.as_millis() as u64, "remote call timed out");
                Err(SyncError::Timeout {
                    op,
                    after: self.config.io_timeout,
                })
            }
        }
    }

    fn set_status(&self, status: SyncStatus) {
        self.state.send_modify(|state| state.status = status);
    }

    fn finish<T>(&self, result: &SyncResult<T>, clean: impl FnOnce(&T) -> bool) {
        let now = self.clock.now();
        self.state.send_modify(|state| match result {
            Ok(value) => {
                state.status = if clean(value) {
                    SyncStatus::Success
                } else {
                    SyncStatus::Conflict
                };
                state.last_synced_at = Some(now);
                state.last_error = None;
            }
            Err(err) => {
                state.status = SyncStatus::Error;
                state.last_error = Some(err.to_string());
            }
        });

        match result {
            Ok(_) => info!(status = ?self.state.borrow().status, "Sync finished"),
            Err(err) => warn!(error = %err, "Sync failed"),
        }
    }
}
