//! Persistent analytics event queue.
//!
//! The queue is written through to the store on every change, so an event
//! is durable before [`EventQueue::enqueue`] returns. Draining is strictly
//! FIFO: the head is retried with exponential backoff until it is sent or
//! exceeds the retry budget, and nothing behind it is attempted meanwhile.

use crate::{AnalyticsEvent, EventSender, OutboxError, OutboxResult};
use karma_config_and_utils::SharedClock;
use karma_storage::{with_timeout, SharedStore, StorageKeys};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Queue retry and timeout behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failed attempts tolerated before an event is dropped.
    pub max_retries: u32,
    /// Delay after the first failure. Doubles per further failure.
    pub backoff_base: Duration,
    /// Upper bound on the delay between attempts.
    pub backoff_max: Duration,
    /// Deadline for each store write and each send.
    pub io_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(60),
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub dropped: usize,
    pub remaining: usize,
    /// True when the pass did nothing because the queue was offline or
    /// another pass was already running.
    pub skipped: bool,
}

/// Durable FIFO of outbound events.
pub struct EventQueue {
    config: QueueConfig,
    store: SharedStore,
    sender: Arc<dyn EventSender>,
    clock: SharedClock,
    pending: Mutex<VecDeque<AnalyticsEvent>>,
    /// Held for the duration of a drain pass.
    processing: Mutex<()>,
    online: AtomicBool,
    shutdown: watch::Sender<bool>,
    trigger: mpsc::Sender<()>,
    trigger_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl EventQueue {
    pub fn new(
        config: QueueConfig,
        store: SharedStore,
        sender: Arc<dyn EventSender>,
        clock: SharedClock,
    ) -> Self {
        let (trigger, trigger_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            sender,
            clock,
            pending: Mutex::new(VecDeque::new()),
            processing: Mutex::new(()),
            online: AtomicBool::new(true),
            shutdown,
            trigger,
            trigger_rx: std::sync::Mutex::new(Some(trigger_rx)),
        }
    }

    /// Load persisted events. A malformed queue is reset to empty.
    pub async fn recover(&self) -> OutboxResult<usize> {
        let raw = with_timeout(
            "load_queue",
            self.config.io_timeout,
            self.store.get(StorageKeys::ANALYTICS_QUEUE),
        )
        .await?;

        let mut queue = self.pending.lock().await;
        let loaded = match raw {
            None => Vec::new(),
            Some(value) => match serde_json::from_value::<Vec<AnalyticsEvent>>(value) {
                Ok(events) => events,
                Err(err) => {
                    warn!(error = %err, "persisted analytics queue malformed, resetting");
                    queue.clear();
                    self.persist(&queue).await?;
                    return Ok(0);
                }
            },
        };

        let max_retries = self.config.max_retries;
        queue.clear();
        queue.extend(loaded.into_iter().filter(|e| e.retry_count <= max_retries));
        info!(count = queue.len(), "Recovered analytics queue");
        Ok(queue.len())
    }

    /// Append an event and persist the queue.
    ///
    /// If the write fails the event is removed again and the error returned,
    /// so the in-memory queue never holds events the store does not.
    pub async fn enqueue(&self, name: &str, payload: Value) -> OutboxResult<String> {
        let event = AnalyticsEvent::new(name, payload, self.clock.now());
        let id = event.id.clone();

        {
            let mut queue = self.pending.lock().await;
            queue.push_back(event);
            if let Err(err) = self.persist(&queue).await {
                queue.pop_back();
                warn!(event = name, error = %err, "Failed to persist analytics event");
                return Err(err);
            }
            debug!(event = name, event_id = %id, depth = queue.len(), "Enqueued event");
        }

        self.notify();
        Ok(id)
    }

    /// Record an error for later delivery.
    pub async fn track_error(&self, context: &str, message: &str) -> OutboxResult<String> {
        self.enqueue("error", json!({ "context": context, "message": message }))
            .await
    }

    /// Record use of a feature for later delivery.
    pub async fn track_feature_usage(&self, feature: &str, action: &str) -> OutboxResult<String> {
        self.enqueue("feature_usage", json!({ "feature": feature, "action": action }))
            .await
    }

    /// Drain the queue head-first until empty, offline, or stopped.
    pub async fn process_queue(&self) -> OutboxResult<DrainReport> {
        let mut report = DrainReport::default();

        if !self.is_online() {
            debug!("Offline, not processing analytics queue");
            report.skipped = true;
            report.remaining = self.len().await;
            return Ok(report);
        }

        let Ok(_guard) = self.processing.try_lock() else {
            debug!("Analytics queue already processing");
            report.skipped = true;
            report.remaining = self.len().await;
            return Ok(report);
        };

        loop {
            if self.is_stopping() || !self.is_online() {
                break;
            }

            let Some(head) = self.pending.lock().await.front().cloned() else {
                break;
            };

            let outcome = match tokio::time::timeout(self.config.io_timeout, self.sender.send(&head)).await {
                Ok(result) => result,
                Err(_) => Err(OutboxError::Timeout(self.config.io_timeout)),
            };

            match outcome {
                Ok(()) => {
                    let mut queue = self.pending.lock().await;
                    if queue.front().map(|e| e.id == head.id).unwrap_or(false) {
                        queue.pop_front();
                    }
                    self.persist(&queue).await?;
                    report.sent += 1;
                    debug!(event_id = %head.id, name = %head.name, "Event delivered");
                }
                Err(err) => {
                    let retry_count = {
                        let mut queue = self.pending.lock().await;
                        let Some(front) = queue.front_mut() else {
                            break;
                        };
                        front.retry_count += 1;
                        let retry_count = front.retry_count;

                        if retry_count > self.config.max_retries {
                            queue.pop_front();
                            error!(
                                event_id = %head.id,
                                name = %head.name,
                                retry_count,
                                error = %err,
                                "Dropping analytics event, retries exhausted"
                            );
                            report.dropped += 1;
                        } else {
                            warn!(
                                event_id = %head.id,
                                name = %head.name,
                                retry_count,
                                error = %err,
                                "Event send failed"
                            );
                        }
                        self.persist(&queue).await?;
                        retry_count
                    };

                    if retry_count <= self.config.max_retries {
                        let delay = compute_backoff(retry_count, &self.config);
                        if !self.sleep_unless_stopped(delay).await {
                            break;
                        }
                    }
                }
            }
        }

        report.remaining = self.len().await;
        Ok(report)
    }

    /// Spawn the worker that drains the queue whenever it is poked.
    ///
    /// Enqueues and connectivity restoration poke the worker. It exits when
    /// `shutdown` fires, after the pass in progress finishes.
    pub fn start(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> OutboxResult<JoinHandle<()>> {
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(OutboxError::AlreadyStarted)?;

        let queue = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        debug!("Analytics queue worker shutting down");
                        break;
                    }
                    poke = trigger_rx.recv() => {
                        if poke.is_none() {
                            break;
                        }
                        if let Err(err) = queue.process_queue().await {
                            warn!(error = %err, "Analytics queue pass failed");
                        }
                    }
                }
            }
        }))
    }

    /// Update connectivity. Going online pokes the worker.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if online && !was {
            info!("Connectivity restored, draining analytics queue");
            self.notify();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Interrupt any backoff wait and stop draining.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Copy of the pending events, head first.
    pub async fn pending(&self) -> Vec<AnalyticsEvent> {
        self.pending.lock().await.iter().cloned().collect()
    }

    fn notify(&self) {
        // A full channel already has a pass queued.
        let _ = self.trigger.try_send(());
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`. Returns false if stopped first.
    async fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let mut rx = self.shutdown.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = rx.wait_for(|stopped| *stopped) => false,
        }
    }

    async fn persist(&self, queue: &VecDeque<AnalyticsEvent>) -> OutboxResult<()> {
        let value = serde_json::to_value(queue)?;
        with_timeout(
            "persist_queue",
            self.config.io_timeout,
            self.store.set(StorageKeys::ANALYTICS_QUEUE, value),
        )
        .await?;
        Ok(())
    }
}

/// Delay before the next attempt: `base * 2^(retry_count - 1)`, capped at the max.
pub fn compute_backoff(retry_count: u32, config: &QueueConfig) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }

    let base_ms = config.backoff_base.as_millis() as u64;
    let max_ms = config.backoff_max.as_millis() as u64;
    let multiplier = 1u64.checked_shl(retry_count - 1).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}
