//! The engine state object.
//!
//! Constructed once by [`Engine::start`]; every component is reachable from
//! it and nothing lives in process globals.

use crate::backup::{self, BackupEnvelope};
use crate::{Ledger, ResourceSignal, RuntimeError, RuntimeResult, Scheduler, TickOutcome};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use karma_config_and_utils::{Config, SharedClock};
use karma_outbox::{EventQueue, EventSender, QueueConfig};
use karma_stats::{Settings, StatsConfig};
use karma_storage::{with_timeout, CacheConfig, CacheLayer, SharedStore, StorageKeys};
use karma_sync::{RemoteChange, RemoteReplica, SyncConfig, SyncCoordinator, SyncError, SyncReport, SyncState};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tab_accounting::{EngineConfig, TabStats};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

const SIGNAL_BUFFER: usize = 256;

/// Externally supplied pieces the engine is built from.
pub struct EngineParts {
    pub config: Config,
    pub store: SharedStore,
    pub remote: Arc<dyn RemoteReplica>,
    pub sender: Arc<dyn EventSender>,
    pub clock: SharedClock,
}

/// Point-in-time summary for the CLI and hosts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub total_accrued: f64,
    pub goal: f64,
    pub progress: Option<f64>,
    pub streak_count: u32,
    pub longest_streak: u32,
    pub weekly_change: Option<f64>,
    pub tabs: TabStats,
    pub badges: Vec<String>,
    pub queue_depth: usize,
    pub sync: SyncState,
}

pub struct Engine {
    config: Arc<Config>,
    store: SharedStore,
    cache: CacheLayer,
    ledger: Mutex<Ledger>,
    queue: Arc<EventQueue>,
    sync: SyncCoordinator,
    clock: SharedClock,
    signals: mpsc::Sender<ResourceSignal>,
    scheduler: parking_lot::Mutex<Option<Scheduler>>,
}

fn engine_config(config: &Config) -> EngineConfig {
    EngineConfig {
        base_rate_per_minute: config.base_rate_per_minute,
        max_sessions: config.max_tracked_resources,
        max_accrual_per_session: config.max_accrual_per_resource,
    }
}

fn cache_config(config: &Config) -> CacheConfig {
    CacheConfig {
        capacity: config.cache_capacity,
        default_ttl: config.cache_ttl(),
        ttl_overrides: config
            .cache_ttl_overrides
            .iter()
            .map(|(prefix, secs)| (prefix.clone(), Duration::from_secs(*secs)))
            .collect(),
    }
}

fn stats_config(config: &Config) -> StatsConfig {
    StatsConfig {
        archive_capacity: config.history_days,
        history_capacity: config.history_days,
    }
}

fn queue_config(config: &Config) -> QueueConfig {
    QueueConfig {
        max_retries: config.max_event_retries,
        backoff_base: Duration::from_millis(config.retry_base_delay_ms),
        backoff_max: Duration::from_millis(config.retry_max_delay_ms),
        io_timeout: config.io_timeout(),
    }
}

fn sync_config(config: &Config) -> SyncConfig {
    SyncConfig {
        io_timeout: config.io_timeout(),
        batch_size: config.batch_size,
        history_capacity: config.history_days,
    }
}

impl Engine {
    /// Load state, spawn background tasks and run the startup sync.
    ///
    /// A failed startup sync is logged, not returned; the engine keeps
    /// working locally.
    pub async fn start(parts: EngineParts) -> RuntimeResult<Arc<Self>> {
        let EngineParts {
            config,
            store,
            remote,
            sender,
            clock,
        } = parts;
        config.validate()?;

        let ledger = Ledger::load(
            store.as_ref(),
            engine_config(&config),
            stats_config(&config),
            clock.clone(),
        )
        .await?;

        let queue = Arc::new(EventQueue::new(
            queue_config(&config),
            store.clone(),
            sender,
            clock.clone(),
        ));
        let recovered = queue.recover().await?;

        let sync = SyncCoordinator::new(sync_config(&config), store.clone(), remote, clock.clone());
        let remote_changes = sync.remote().subscribe();
        let (signals, signal_rx) = mpsc::channel(SIGNAL_BUFFER);

        let engine = Arc::new(Self {
            cache: CacheLayer::new(cache_config(&config), clock.clone()),
            config: Arc::new(config),
            store,
            ledger: Mutex::new(ledger),
            queue,
            sync,
            clock,
            signals,
            scheduler: parking_lot::Mutex::new(None),
        });

        let scheduler = engine.spawn_tasks(signal_rx, remote_changes)?;
        *engine.scheduler.lock() = Some(scheduler);

        if let Err(err) = engine.run_cleanup_if_due().await {
            warn!(error = %err, "Startup cleanup failed");
        }
        match engine.force_sync().await {
            Ok(report) => debug!(written = report.written, "Startup sync complete"),
            Err(RuntimeError::Sync(SyncError::Offline)) => {}
            Err(err) => warn!(error = %err, "Startup sync failed, continuing locally"),
        }

        info!(recovered_events = recovered, "Engine started");
        Ok(engine)
    }

    fn spawn_tasks(
        self: &Arc<Self>,
        mut signal_rx: mpsc::Receiver<ResourceSignal>,
        mut remote_changes: broadcast::Receiver<RemoteChange>,
    ) -> RuntimeResult<Scheduler> {
        let mut scheduler = Scheduler::new();
        scheduler.adopt("analytics_queue", self.queue.start(scheduler.subscribe())?);

        let weak = Arc::downgrade(self);
        scheduler.every("tick", self.config.tick_interval(), periodic(&weak, |engine| async move {
            if let Err(err) = engine.tick().await {
                warn!(error = %err, "Tick failed");
            }
        }));
        scheduler.every("cleanup", self.config.cleanup_interval(), periodic(&weak, |engine| async move {
            if let Err(err) = engine.run_cleanup_if_due().await {
                warn!(error = %err, "Cleanup failed");
            }
        }));

        let intake = weak.clone();
        scheduler.spawn("signals", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    signal = signal_rx.recv() => {
                        let (Some(signal), Some(engine)) = (signal, intake.upgrade()) else {
                            break;
                        };
                        engine.process_signal(signal).await;
                    }
                }
            }
            debug!("Signal intake stopped");
        });

        let listener = weak;
        scheduler.spawn("remote_changes", move |mut shutdown| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    change = remote_changes.recv() => {
                        let Some(engine) = listener.upgrade() else {
                            break;
                        };
                        match change {
                            Ok(change) => {
                                if let Err(err) = engine.apply_remote_changes(vec![change]).await {
                                    warn!(error = %err, "Failed to apply remote change");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "Remote change feed lagged, resyncing");
                                if let Err(err) = engine.force_sync().await {
                                    warn!(error = %err, "Resync after lag failed");
                                }
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("Remote change listener stopped");
        });

        Ok(scheduler)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync.subscribe()
    }

    /// Sender for resource lifecycle signals, processed in arrival order.
    pub fn signal_sender(&self) -> mpsc::Sender<ResourceSignal> {
        self.signals.clone()
    }

    pub async fn send_signal(&self, signal: ResourceSignal) -> RuntimeResult<()> {
        self.signals.send(signal).await.map_err(|_| RuntimeError::Stopped)
    }

    /// Accrue active time, persist, and announce what happened.
    pub async fn tick(&self) -> RuntimeResult<TickOutcome> {
        let outcome = {
            let mut ledger = self.ledger.lock().await;
            let outcome = ledger.tick()?;
            self.persist(&ledger).await?;
            outcome
        };
        self.announce(&outcome).await;
        Ok(outcome)
    }

    /// Apply one lifecycle signal directly, bypassing the channel.
    pub async fn handle_signal(&self, signal: &ResourceSignal) -> RuntimeResult<TickOutcome> {
        let outcome = {
            let mut ledger = self.ledger.lock().await;
            let outcome = ledger.apply(signal)?;
            self.persist(&ledger).await?;
            outcome
        };
        self.announce(&outcome).await;
        Ok(outcome)
    }

    async fn process_signal(&self, signal: ResourceSignal) {
        if let Err(err) = self.handle_signal(&signal).await {
            warn!(?signal, error = %err, "Rejected resource signal");
            self.track_error("resource_signal", &err).await;
        }
    }

    /// Update connectivity for sync and analytics delivery.
    ///
    /// Restoring connectivity forces a sync; the queue drains on its own.
    pub async fn set_online(&self, online: bool) {
        self.queue.set_online(online);
        if self.sync.set_online(online) {
            if let Err(err) = self.force_sync().await {
                warn!(error = %err, "Sync after reconnect failed");
            }
        }
    }

    /// Reconcile with the remote replica and reload the ledger from the result.
    pub async fn force_sync(&self) -> RuntimeResult<SyncReport> {
        let result = self.sync_locked().await;
        match &result {
            Ok(report) => {
                let payload = json!({
                    "written": report.written,
                    "conflicted": report.conflicted.len(),
                    "unresolvable": report.unresolvable.len(),
                    "migrated": report.migrated,
                });
                self.enqueue("force_sync_completed", payload).await;
            }
            Err(RuntimeError::Sync(SyncError::Offline)) => {}
            Err(err) => self.track_error("force_sync", err).await,
        }
        result
    }

    async fn sync_locked(&self) -> RuntimeResult<SyncReport> {
        let mut ledger = self.ledger.lock().await;
        self.persist(&ledger).await?;
        let report = self.sync.force_sync().await?;
        self.invalidate_sections();
        ledger.reload(self.store.as_ref()).await?;
        Ok(report)
    }

    /// Write remote deltas locally and reload the ledger if anything landed.
    pub async fn apply_remote_changes(&self, changes: Vec<RemoteChange>) -> RuntimeResult<usize> {
        let mut ledger = self.ledger.lock().await;
        let written = self.sync.apply_remote_changes(changes).await?;
        if written > 0 {
            self.invalidate_sections();
            ledger.reload(self.store.as_ref()).await?;
        }
        Ok(written)
    }

    pub async fn update_settings(&self, settings: Settings) -> RuntimeResult<()> {
        {
            let mut ledger = self.ledger.lock().await;
            ledger.update_settings(settings)?;
            self.persist(&ledger).await?;
        }
        self.track_feature("settings", "update").await;
        Ok(())
    }

    pub async fn export_backup(&self) -> RuntimeResult<BackupEnvelope> {
        let envelope = {
            let ledger = self.ledger.lock().await;
            self.persist(&ledger).await?;
            backup::export(self.store.as_ref(), self.clock.now()).await?
        };
        self.track_feature("backup", "export").await;
        Ok(envelope)
    }

    /// Replace local data with `raw`. Nothing changes if validation fails.
    pub async fn import_backup(&self, raw: &Value) -> RuntimeResult<usize> {
        let written = {
            let mut ledger = self.ledger.lock().await;
            let written = backup::import(self.store.as_ref(), raw, self.config.batch_size).await?;
            self.cache.clear();
            ledger.reload(self.store.as_ref()).await?;
            // Imported days may exceed what the ledger keeps
            self.persist(&ledger).await?;
            written
        };
        self.track_feature("backup", "import").await;
        Ok(written)
    }

    pub async fn status(&self) -> EngineStatus {
        let ledger = self.ledger.lock().await;
        let stats = ledger.stats();
        let record = stats.record();
        EngineStatus {
            total_accrued: record.total_accrued,
            goal: record.goal,
            progress: stats.compute_progress(),
            streak_count: record.streak_count,
            longest_streak: record.longest_streak,
            weekly_change: stats.weekly_change(),
            tabs: ledger.tabs().stats(),
            badges: ledger.badges().iter().map(|b| b.id.clone()).collect(),
            queue_depth: self.queue.len().await,
            sync: self.sync.state(),
        }
    }

    /// Read `key` through the cache, filling it from the store on a miss.
    pub async fn read_through(&self, key: &str) -> RuntimeResult<Option<Value>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit));
        }
        let value = with_timeout("read_through", self.config.io_timeout(), self.store.get(key)).await?;
        if let Some(value) = &value {
            self.cache.put(key, value.clone());
        }
        Ok(value)
    }

    /// Archival sweep. Returns the number of archive and history days dropped.
    pub async fn cleanup(&self) -> RuntimeResult<usize> {
        let removed = {
            let mut ledger = self.ledger.lock().await;
            let removed = ledger.cleanup();
            self.persist(&ledger).await?;
            removed
        };
        let expired = self.cache.purge_expired();

        let now = Value::String(self.clock.now().to_rfc3339());
        with_timeout(
            "record_cleanup",
            self.config.io_timeout(),
            self.store.set(StorageKeys::LAST_CLEANUP, now),
        )
        .await?;
        info!(removed, expired_cache_entries = expired, "Cleanup complete");
        Ok(removed)
    }

    /// Run [`cleanup`](Self::cleanup) unless one ran within the cleanup interval.
    pub async fn run_cleanup_if_due(&self) -> RuntimeResult<Option<usize>> {
        let last = with_timeout(
            "read_last_cleanup",
            self.config.io_timeout(),
            self.store.get(StorageKeys::LAST_CLEANUP),
        )
        .await?
        .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
        .map(|t| t.with_timezone(&Utc));

        let due = match last {
            Some(last) => (self.clock.now() - last)
                .to_std()
                .map(|elapsed| elapsed >= self.config.cleanup_interval())
                .unwrap_or(false),
            None => true,
        };
        if !due {
            return Ok(None);
        }
        self.cleanup().await.map(Some)
    }

    /// Stop background tasks, let in-flight work finish, and persist once more.
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        info!("Shutting down engine");
        self.queue.stop();
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        let ledger = self.ledger.lock().await;
        self.persist(&ledger).await?;
        info!("Engine stopped");
        Ok(())
    }

    /// Write the ledger to the store and refresh the cache with what was written.
    async fn persist(&self, ledger: &Ledger) -> RuntimeResult<()> {
        let entries = ledger.persisted_entries()?;
        with_timeout(
            "persist",
            self.config.io_timeout(),
            self.store.batch_set(entries.clone(), self.config.batch_size),
        )
        .await?;
        for (key, value) in entries {
            self.cache.put(&key, value);
        }
        Ok(())
    }

    fn invalidate_sections(&self) {
        for section in StorageKeys::BACKUP_SECTIONS {
            self.cache.invalidate(section);
        }
    }

    async fn announce(&self, outcome: &TickOutcome) {
        for badge in &outcome.new_badges {
            let payload = json!({ "badgeId": badge.id, "earnedAt": badge.earned_at });
            self.enqueue("badge_earned", payload).await;
        }
        if let Some(day) = &outcome.rolled {
            let payload = json!({ "date": day.date, "value": day.value, "goalMet": day.goal_met });
            self.enqueue("day_completed", payload).await;
        }
    }

    async fn enqueue(&self, name: &str, payload: Value) {
        if let Err(err) = self.queue.enqueue(name, payload).await {
            warn!(event = name, error = %err, "Failed to enqueue analytics event");
        }
    }

    async fn track_error(&self, context: &str, err: &RuntimeError) {
        if let Err(queue_err) = self.queue.track_error(context, &err.to_string()).await {
            warn!(context, error = %queue_err, "Failed to record error event");
        }
    }

    async fn track_feature(&self, feature: &str, action: &str) {
        if let Err(err) = self.queue.track_feature_usage(feature, action).await {
            warn!(feature, action, error = %err, "Failed to record feature usage");
        }
    }
}

/// Periodic task body that runs `f` while the engine is alive.
fn periodic<F, Fut>(
    weak: &Weak<Engine>,
    f: F,
) -> impl FnMut() -> BoxFuture<'static, ()> + Send + 'static
where
    F: Fn(Arc<Engine>) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let weak = weak.clone();
    move || {
        let weak = weak.clone();
        let f = f.clone();
        Box::pin(async move {
            if let Some(engine) = weak.upgrade() {
                f(engine).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackupError, BACKUP_TYPE};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use karma_config_and_utils::ManualClock;
    use karma_outbox::{AnalyticsEvent, OutboxResult};
    use karma_storage::{MemoryStore, PersistentStore, SqliteStore};
    use karma_sync::{StoreReplica, SyncStatus};
    use tab_accounting::{EmissionProfile, ResourceId};

    // =========================================================================
    // Fixtures
    // =========================================================================

    #[derive(Default)]
    struct RecordingSender {
        sent: parking_lot::Mutex<Vec<String>>,
    }

    impl RecordingSender {
        fn names(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl EventSender for RecordingSender {
        async fn send(&self, event: &AnalyticsEvent) -> OutboxResult<()> {
            self.sent.lock().push(event.name.clone());
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        local: Arc<MemoryStore>,
        replica: Arc<StoreReplica>,
        replica_store: Arc<MemoryStore>,
        sender: Arc<RecordingSender>,
        clock: Arc<ManualClock>,
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    async fn harness_with(local: Arc<MemoryStore>) -> Harness {
        let clock = ManualClock::shared(start_time());
        let replica_store = Arc::new(MemoryStore::new());
        let replica = Arc::new(StoreReplica::new(replica_store.clone()));
        let sender = Arc::new(RecordingSender::default());

        let engine = Engine::start(EngineParts {
            config: Config::default(),
            store: local.clone(),
            remote: replica.clone(),
            sender: sender.clone(),
            clock: clock.clone(),
        })
        .await
        .unwrap();

        Harness {
            engine,
            local,
            replica,
            replica_store,
            sender,
            clock,
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::new())).await
    }

    async fn eventually<F>(mut check: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn opened(id: u64) -> ResourceSignal {
        ResourceSignal::Opened {
            id: ResourceId(id),
            profile: None,
        }
    }

    // =========================================================================
    // Accrual and signals
    // =========================================================================

    #[tokio::test]
    async fn tick_accrues_and_persists() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(2));

        let outcome = h.engine.tick().await.unwrap();
        assert_eq!(outcome.accrued, 12.0);

        let status = h.engine.status().await;
        assert_eq!(status.total_accrued, 12.0);
        assert_eq!(status.tabs.tracked, 1);
        assert_eq!(status.badges, vec!["tab_master".to_string()]);

        let stored = h.local.snapshot();
        assert_eq!(stored["stats"]["totalAccrued"], json!(12.0));
        assert_eq!(h.engine.cache().get("stats"), Some(stored["stats"].clone()));
    }

    #[tokio::test]
    async fn signals_flow_through_channel_in_order() {
        let h = harness().await;
        let profile = EmissionProfile::for_domain("youtube.com");
        h.engine
            .send_signal(ResourceSignal::Opened {
                id: ResourceId(1),
                profile: Some(profile),
            })
            .await
            .unwrap();
        h.engine.send_signal(opened(2)).await.unwrap();
        h.engine.send_signal(ResourceSignal::Closed(ResourceId(2))).await.unwrap();

        let engine = h.engine.clone();
        for _ in 0..200 {
            if engine.status().await.tabs.tracked == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.status().await.tabs.tracked, 1);
        h.engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_signal_is_tracked_as_error() {
        let h = harness().await;
        h.engine
            .send_signal(ResourceSignal::Closed(ResourceId(42)))
            .await
            .unwrap();

        let sender = h.sender.clone();
        eventually(move || sender.names().iter().any(|n| n == "error")).await;
    }

    #[tokio::test]
    async fn new_badge_is_announced() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();

        let sender = h.sender.clone();
        eventually(move || sender.names().iter().any(|n| n == "badge_earned")).await;
    }

    #[tokio::test]
    async fn day_rollover_is_announced() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(5));
        h.engine.tick().await.unwrap();

        h.clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap());
        let outcome = h.engine.tick().await.unwrap();
        assert_eq!(outcome.rolled.unwrap().value, 30.0);

        let sender = h.sender.clone();
        eventually(move || sender.names().iter().any(|n| n == "day_completed")).await;
    }

    #[tokio::test]
    async fn rejected_close_at_day_boundary_still_announces_rollover() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(5));
        h.engine.tick().await.unwrap();

        h.clock.set(Utc.with_ymd_and_hms(2024, 5, 2, 0, 1, 0).unwrap());
        assert!(h
            .engine
            .handle_signal(&ResourceSignal::Closed(ResourceId(99)))
            .await
            .is_err());
        let outcome = h.engine.tick().await.unwrap();
        assert_eq!(outcome.rolled.unwrap().value, 30.0);
        assert!(h.engine.tick().await.unwrap().rolled.is_none());

        let completed = |sender: &RecordingSender| {
            sender.names().iter().filter(|n| *n == "day_completed").count()
        };
        let sender = h.sender.clone();
        eventually(move || completed(&sender) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(completed(&h.sender), 1);
    }

    // =========================================================================
    // Sync
    // =========================================================================

    #[tokio::test]
    async fn startup_sync_migrates_local_data() {
        let local = Arc::new(MemoryStore::with_entries([(
            "settings".to_string(),
            json!({"dailyGoal": 1500.0, "theme": "dark"}),
        )]));
        let h = harness_with(local).await;

        let remote = h.replica_store.snapshot();
        assert_eq!(remote["initialized"], json!(true));
        assert_eq!(remote["settings"]["dailyGoal"], json!(1500.0));
        assert_eq!(h.engine.status().await.sync.status, SyncStatus::Success);
        assert_eq!(h.engine.status().await.goal, 1500.0);
    }

    #[tokio::test]
    async fn offline_sync_is_refused_and_reconnect_resyncs() {
        let h = harness().await;
        h.engine.set_online(false).await;
        assert!(h.engine.sync_state().borrow().offline);

        h.engine.handle_signal(&opened(1)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(1));
        h.engine.tick().await.unwrap();

        let err = h.engine.force_sync().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Sync(SyncError::Offline)));

        h.engine.set_online(true).await;
        let state = h.engine.sync_state().borrow().clone();
        assert!(!state.offline);
        assert_eq!(state.status, SyncStatus::Success);
        assert_eq!(h.replica_store.snapshot()["stats"]["totalAccrued"], json!(6.0));
    }

    #[tokio::test]
    async fn remote_change_reloads_ledger() {
        let h = harness().await;
        h.replica
            .write_external("settings", Some(json!({"dailyGoal": 2000.0, "lastModified": 10})))
            .await
            .unwrap();

        let engine = h.engine.clone();
        for _ in 0..200 {
            if engine.status().await.goal == 2000.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(engine.status().await.goal, 2000.0);
        assert_eq!(h.local.snapshot()["settings"]["dailyGoal"], json!(2000.0));
    }

    #[tokio::test]
    async fn invalid_remote_change_is_ignored() {
        let h = harness().await;
        let changes = vec![RemoteChange {
            key: "settings".to_string(),
            new_value: Some(json!({"dailyGoal": 1.0})),
        }];
        assert_eq!(h.engine.apply_remote_changes(changes).await.unwrap(), 0);
        assert_eq!(h.engine.status().await.goal, 1000.0);
    }

    // =========================================================================
    // Settings, backup, cleanup
    // =========================================================================

    #[tokio::test]
    async fn settings_update_validates_and_persists() {
        let h = harness().await;
        let bad = Settings {
            data_retention_days: 1,
            ..Settings::default()
        };
        assert!(h.engine.update_settings(bad).await.is_err());

        let good = Settings {
            daily_goal: 750.0,
            ..Settings::default()
        };
        h.engine.update_settings(good).await.unwrap();
        assert_eq!(h.engine.status().await.goal, 750.0);
        assert_eq!(h.local.snapshot()["settings"]["dailyGoal"], json!(750.0));
    }

    #[tokio::test]
    async fn backup_round_trip_through_engine() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(3));
        h.engine.tick().await.unwrap();

        let envelope = h.engine.export_backup().await.unwrap();
        assert_eq!(envelope.metadata.kind, BACKUP_TYPE);
        let raw = serde_json::to_value(&envelope).unwrap();

        let other = harness().await;
        assert_eq!(other.engine.import_backup(&raw).await.unwrap(), 5);
        let status = other.engine.status().await;
        assert_eq!(status.total_accrued, 18.0);
        assert_eq!(status.badges, vec!["tab_master".to_string()]);
    }

    #[tokio::test]
    async fn imported_archive_is_trimmed_to_history_days() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();
        h.engine.tick().await.unwrap();
        let mut raw = serde_json::to_value(h.engine.export_backup().await.unwrap()).unwrap();
        let first = chrono::NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let days: serde_json::Map<String, Value> = (0..60)
            .map(|i| {
                let date = first + chrono::Duration::days(i);
                (
                    date.to_string(),
                    json!({"date": date, "value": 1.0, "goalMet": true}),
                )
            })
            .collect();
        raw["data"]["dailyStats"] = Value::Object(days);

        h.engine.import_backup(&raw).await.unwrap();

        let stored = h.local.snapshot();
        let archive = stored["dailyStats"].as_object().unwrap();
        assert_eq!(archive.len(), 30);
        assert!(!archive.contains_key("2024-03-01"));
        assert!(archive.contains_key("2024-03-02"));
    }

    #[tokio::test]
    async fn newer_backup_leaves_state_untouched() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();
        let mut raw = serde_json::to_value(h.engine.export_backup().await.unwrap()).unwrap();
        raw["metadata"]["version"] = json!(2);

        let before = h.local.snapshot();
        let err = h.engine.import_backup(&raw).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Backup(BackupError::UnsupportedVersion { .. })
        ));
        let after = h.local.snapshot();
        for section in StorageKeys::BACKUP_SECTIONS {
            assert_eq!(before.get(section), after.get(section), "{}", section);
        }
    }

    #[tokio::test]
    async fn cleanup_runs_at_startup_then_waits_for_interval() {
        let h = harness().await;
        assert!(h.local.snapshot().contains_key("lastCleanup"));
        assert_eq!(h.engine.run_cleanup_if_due().await.unwrap(), None);

        h.clock.advance(chrono::Duration::hours(25));
        assert_eq!(h.engine.run_cleanup_if_due().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn read_through_fills_cache() {
        let h = harness().await;
        h.local
            .set("electricity_map:intensity-IN-KL", json!({"carbonIntensity": 512}))
            .await
            .unwrap();

        assert!(h.engine.cache().get("electricity_map:intensity-IN-KL").is_none());
        let value = h
            .engine
            .read_through("electricity_map:intensity-IN-KL")
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"carbonIntensity": 512})));
        assert!(h.engine.cache().get("electricity_map:intensity-IN-KL").is_some());
        assert_eq!(h.engine.read_through("missing").await.unwrap(), None);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn shutdown_persists_and_stops_intake() {
        let h = harness().await;
        h.engine.handle_signal(&opened(1)).await.unwrap();
        h.engine.shutdown().await.unwrap();

        assert!(h.local.snapshot().contains_key("stats"));
        tokio::time::timeout(Duration::from_secs(1), h.engine.signal_sender().closed())
            .await
            .expect("signal intake still running");
    }

    #[tokio::test]
    async fn state_survives_restart_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("karma.sqlite");
        let clock = ManualClock::shared(start_time());

        let start = |store: SharedStore| {
            let clock = clock.clone();
            async move {
                Engine::start(EngineParts {
                    config: Config::default(),
                    store,
                    remote: Arc::new(StoreReplica::new(Arc::new(MemoryStore::new()))),
                    sender: Arc::new(RecordingSender::default()),
                    clock,
                })
                .await
                .unwrap()
            }
        };

        let engine = start(Arc::new(SqliteStore::open(&path).await.unwrap())).await;
        engine.handle_signal(&opened(1)).await.unwrap();
        clock.advance(chrono::Duration::minutes(4));
        engine.tick().await.unwrap();
        engine.shutdown().await.unwrap();
        drop(engine);

        let store: SharedStore = Arc::new(SqliteStore::open(&path).await.unwrap());
        let restarted = start(store.clone()).await;
        let status = restarted.status().await;
        assert_eq!(status.total_accrued, 24.0);
        assert_eq!(status.tabs.tracked, 0);
        assert!(store.has("badges").await.unwrap());
        restarted.shutdown().await.unwrap();
    }
}
