//! Running totals and daily rollover.

use crate::{
    load_or_reset, BadgeInputs, DailyArchive, DailyStat, HistoryEntry, StatRecord, StatsError,
    StatsResult,
};
use chrono::{Duration, NaiveDate};
use karma_config_and_utils::SharedClock;
use karma_storage::{PersistentStore, StorageKeys};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Archive and history bounds.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Days kept in the archive; the oldest is dropped beyond this.
    pub archive_capacity: usize,
    /// Days kept in the most-recent-first history list.
    pub history_capacity: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            archive_capacity: 30,
            history_capacity: 30,
        }
    }
}

/// Owns the live [`StatRecord`] together with its archive and history.
///
/// Streaks change only in [`roll_day`](Self::roll_day), never on accrual.
#[derive(Debug)]
pub struct StatsAggregator {
    config: StatsConfig,
    clock: SharedClock,
    record: StatRecord,
    archive: DailyArchive,
    history: Vec<HistoryEntry>,
}

impl StatsAggregator {
    /// Fresh aggregator starting today with `goal`.
    pub fn new(config: StatsConfig, clock: SharedClock, goal: f64) -> Self {
        let record = StatRecord::new(clock.today(), goal);
        Self::from_parts(config, clock, record, DailyArchive::default(), Vec::new())
    }

    /// Assemble from stored parts, trimming archive and history to capacity.
    ///
    /// Merged or imported entities may carry more days than one device keeps.
    pub fn from_parts(
        config: StatsConfig,
        clock: SharedClock,
        record: StatRecord,
        mut archive: DailyArchive,
        mut history: Vec<HistoryEntry>,
    ) -> Self {
        let dropped = archive.truncate_to(config.archive_capacity);
        history.sort_by(|a, b| b.date.cmp(&a.date));
        history.dedup_by_key(|entry| entry.date);
        let history_before = history.len();
        history.truncate(config.history_capacity);
        if dropped > 0 || history.len() < history_before {
            debug!(
                archive_dropped = dropped,
                history_dropped = history_before - history.len(),
                "trimmed stats to capacity"
            );
        }
        Self {
            config,
            clock,
            record,
            archive,
            history,
        }
    }

    /// Load stats, archive and history from `store`.
    ///
    /// Malformed entities are reset to their defaults and persisted.
    pub async fn load(
        store: &dyn PersistentStore,
        config: StatsConfig,
        clock: SharedClock,
        goal: f64,
    ) -> StatsResult<Self> {
        let today = clock.today();
        let record = load_or_reset(store, StorageKeys::STATS, || StatRecord::new(today, goal))
            .await?
            .value;
        let archive = load_or_reset(store, StorageKeys::DAILY_STATS, DailyArchive::default)
            .await?
            .value;
        let history: Vec<HistoryEntry> = load_or_reset(store, StorageKeys::HISTORY, Vec::new)
            .await?
            .value;

        debug!(
            total = record.total_accrued,
            streak = record.streak_count,
            archived_days = archive.len(),
            "stats loaded"
        );
        Ok(Self::from_parts(config, clock, record, archive, history))
    }

    pub fn record(&self) -> &StatRecord {
        &self.record
    }

    pub fn archive(&self) -> &DailyArchive {
        &self.archive
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Add `delta` grams to today's and the session's totals.
    pub fn record_accrual(&mut self, delta: f64) -> StatsResult<()> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(StatsError::validation(
                "accrual",
                format!("delta must be a non-negative number, got {}", delta),
            ));
        }
        if delta == 0.0 {
            return Ok(());
        }
        self.record.total_accrued += delta;
        self.record.session_accrued += delta;
        self.record.last_modified = Some(self.clock.now());
        Ok(())
    }

    /// Conclude the previous day if `today` is past it.
    ///
    /// Appends the concluded day to the archive and history, moves the streak
    /// based on that day's total against the goal, and resets the daily total.
    /// Returns the archived day, or `None` when already rolled for `today`.
    pub fn roll_day(&mut self, today: NaiveDate) -> Option<DailyStat> {
        let concluded = self.record.last_reset_date;
        if today == concluded {
            return None;
        }
        if today < concluded {
            warn!(%today, last_reset = %concluded, "clock is behind last rollover, skipping");
            return None;
        }

        let value = self.record.total_accrued;
        let goal_met = value <= self.record.goal;
        let stat = DailyStat {
            date: concluded,
            value,
            goal_met,
        };
        self.archive.push(stat.clone(), self.config.archive_capacity);

        self.history.retain(|entry| entry.date != concluded);
        self.history.insert(0, HistoryEntry { date: concluded, value });
        self.history.truncate(self.config.history_capacity);

        if goal_met {
            self.record.streak_count += 1;
            self.record.longest_streak = self.record.longest_streak.max(self.record.streak_count);
        } else {
            self.record.streak_count = 0;
        }
        self.record.total_accrued = 0.0;
        self.record.last_reset_date = today;
        self.record.last_modified = Some(self.clock.now());

        info!(
            date = %concluded,
            value,
            goal_met,
            streak = self.record.streak_count,
            "day rolled over"
        );
        Some(stat)
    }

    /// Today's total as a fraction of the goal. `None` without a usable goal.
    pub fn compute_progress(&self) -> Option<f64> {
        if self.record.goal > 0.0 && self.record.goal.is_finite() {
            Some(self.record.total_accrued / self.record.goal)
        } else {
            None
        }
    }

    /// Apply a validated goal. Takes effect for the day in progress.
    pub fn set_goal(&mut self, goal: f64) {
        if (self.record.goal - goal).abs() > f64::EPSILON {
            self.record.goal = goal;
            self.record.last_modified = Some(self.clock.now());
        }
    }

    /// Drop archive and history days older than `retention_days` before `today`.
    pub fn cleanup(&mut self, today: NaiveDate, retention_days: u32) -> usize {
        let cutoff = today - Duration::days(i64::from(retention_days));
        let archived = self.archive.prune_before(cutoff);
        let before = self.history.len();
        self.history.retain(|entry| entry.date >= cutoff);
        let removed = archived + (before - self.history.len());
        if removed > 0 {
            info!(%cutoff, removed, "old stats pruned");
        }
        removed
    }

    /// Percent drop of the last 7 archived days' average against the 7 before.
    ///
    /// Positive means emissions went down. `None` without a previous week.
    pub fn weekly_change(&self) -> Option<f64> {
        let values: Vec<f64> = self.archive.iter().map(|d| d.value).collect();
        let split = values.len().saturating_sub(7);
        let (older, recent) = values.split_at(split);
        let previous = &older[older.len().saturating_sub(7)..];
        if previous.is_empty() || recent.is_empty() {
            return None;
        }

        let avg = |xs: &[f64]| xs.iter().sum::<f64>() / xs.len() as f64;
        let previous_avg = avg(previous);
        if previous_avg <= 0.0 {
            return None;
        }
        Some((previous_avg - avg(recent)) / previous_avg * 100.0)
    }

    /// Facts for badge evaluation.
    pub fn badge_inputs(&self, tracked_resources: Option<usize>) -> BadgeInputs {
        BadgeInputs {
            streak_count: self.record.streak_count,
            longest_streak: self.record.longest_streak,
            goals_met: self.archive.goals_met(),
            tracked_resources,
            weekly_reduction: self.weekly_change(),
        }
    }

    /// Store entries for the live record, archive and history.
    pub fn persisted_entries(&self) -> StatsResult<Vec<(String, Value)>> {
        Ok(vec![
            (
                StorageKeys::STATS.to_string(),
                serde_json::to_value(&self.record)?,
            ),
            (
                StorageKeys::DAILY_STATS.to_string(),
                serde_json::to_value(&self.archive)?,
            ),
            (
                StorageKeys::HISTORY.to_string(),
                serde_json::to_value(&self.history)?,
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use karma_config_and_utils::ManualClock;
    use karma_storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn aggregator(goal: f64) -> (StatsAggregator, Arc<ManualClock>) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        (
            StatsAggregator::new(StatsConfig::default(), clock.clone(), goal),
            clock,
        )
    }

    // ========================================================================
    // Accrual
    // ========================================================================

    #[test]
    fn test_record_accrual_adds_to_totals_not_streak() {
        let (mut stats, _clock) = aggregator(100.0);
        stats.record_accrual(30.0).unwrap();
        stats.record_accrual(90.0).unwrap();

        assert_eq!(stats.record().total_accrued, 120.0);
        assert_eq!(stats.record().session_accrued, 120.0);
        assert_eq!(stats.record().streak_count, 0);
        assert!(stats.record().last_modified.is_some());
    }

    #[test]
    fn test_record_accrual_rejects_negative_and_nan() {
        let (mut stats, _clock) = aggregator(100.0);
        assert!(stats.record_accrual(-1.0).is_err());
        assert!(stats.record_accrual(f64::NAN).is_err());
        assert_eq!(stats.record().total_accrued, 0.0);
    }

    // ========================================================================
    // Rollover
    // ========================================================================

    #[test]
    fn test_roll_day_is_idempotent() {
        let (mut stats, _clock) = aggregator(100.0);
        stats.record_accrual(40.0).unwrap();

        let archived = stats.roll_day(day(2)).unwrap();
        assert_eq!(archived.date, day(1));
        assert_eq!(archived.value, 40.0);
        let after_first = stats.record().clone();

        assert!(stats.roll_day(day(2)).is_none());
        assert_eq!(stats.record(), &after_first);
        assert_eq!(stats.archive().len(), 1);
        assert_eq!(stats.history().len(), 1);
    }

    /// Streak moves once per rollover no matter how many accruals happened.
    #[test]
    fn test_streak_increments_when_goal_met() {
        let (mut stats, _clock) = aggregator(100.0);
        for _ in 0..50 {
            stats.record_accrual(1.0).unwrap();
        }
        stats.roll_day(day(2));
        assert_eq!(stats.record().streak_count, 1);
        assert_eq!(stats.record().longest_streak, 1);
        assert_eq!(stats.record().total_accrued, 0.0);
        assert_eq!(stats.record().last_reset_date, day(2));

        // Exactly at the goal still counts as met
        stats.record_accrual(100.0).unwrap();
        stats.roll_day(day(3));
        assert_eq!(stats.record().streak_count, 2);
    }

    #[test]
    fn test_streak_resets_when_goal_exceeded() {
        let (mut stats, _clock) = aggregator(100.0);
        stats.roll_day(day(2));
        stats.roll_day(day(3));
        assert_eq!(stats.record().streak_count, 2);

        stats.record_accrual(100.5).unwrap();
        let archived = stats.roll_day(day(4)).unwrap();
        assert!(!archived.goal_met);
        assert_eq!(stats.record().streak_count, 0);
        assert_eq!(stats.record().longest_streak, 2);
    }

    #[test]
    fn test_roll_day_ignores_earlier_date() {
        let (mut stats, _clock) = aggregator(100.0);
        stats.roll_day(day(5));
        assert!(stats.roll_day(day(4)).is_none());
        assert_eq!(stats.record().last_reset_date, day(5));
    }

    #[test]
    fn test_archive_and_history_bounded() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        let mut stats = StatsAggregator::new(
            StatsConfig {
                archive_capacity: 3,
                history_capacity: 2,
            },
            clock,
            100.0,
        );
        for d in 2..=6 {
            stats.roll_day(day(d));
        }

        assert_eq!(stats.archive().len(), 3);
        assert!(stats.archive().get(day(2)).is_none());
        assert_eq!(stats.history().len(), 2);
        assert_eq!(stats.history()[0].date, day(5));
        assert_eq!(stats.history()[1].date, day(4));
    }

    // ========================================================================
    // Derived values
    // ========================================================================

    #[test]
    fn test_compute_progress() {
        let (mut stats, _clock) = aggregator(200.0);
        stats.record_accrual(50.0).unwrap();
        assert_eq!(stats.compute_progress(), Some(0.25));

        stats.set_goal(0.0);
        assert_eq!(stats.compute_progress(), None);
    }

    #[test]
    fn test_cleanup_prunes_outside_retention() {
        let (mut stats, _clock) = aggregator(100.0);
        for d in 2..=20 {
            stats.roll_day(day(d));
        }
        // Archived days 1..=19, keep 10 days before the 20th
        let removed_archive_and_history = stats.cleanup(day(20), 10);
        assert!(removed_archive_and_history > 0);
        assert!(stats.archive().iter().all(|d| d.date >= day(10)));
        assert!(stats.history().iter().all(|h| h.date >= day(10)));
    }

    #[test]
    fn test_weekly_change() {
        let (mut stats, _clock) = aggregator(1000.0);
        assert_eq!(stats.weekly_change(), None);

        for d in 1..=14u32 {
            let value = if d <= 7 { 200.0 } else { 80.0 };
            stats.record_accrual(value).unwrap();
            stats.roll_day(day(d + 1));
        }
        let change = stats.weekly_change().unwrap();
        assert!((change - 60.0).abs() < 1e-9);

        let inputs = stats.badge_inputs(Some(2));
        assert_eq!(inputs.goals_met, 14);
        assert_eq!(inputs.streak_count, 14);
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    #[tokio::test]
    async fn test_load_round_trips_persisted_entries() {
        let (mut stats, clock) = aggregator(100.0);
        stats.record_accrual(20.0).unwrap();
        stats.roll_day(day(2));
        stats.record_accrual(5.0).unwrap();

        let store = MemoryStore::new();
        store
            .batch_set(stats.persisted_entries().unwrap(), 100)
            .await
            .unwrap();

        let loaded = StatsAggregator::load(&store, StatsConfig::default(), clock, 100.0)
            .await
            .unwrap();
        assert_eq!(loaded.record(), stats.record());
        assert_eq!(loaded.archive(), stats.archive());
        assert_eq!(loaded.history(), stats.history());
    }

    /// Two devices with 30 distinct days each merge into 60; loading keeps the newest 30.
    #[tokio::test]
    async fn test_load_trims_merged_archive_and_history() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let days: Vec<NaiveDate> = (0..60).map(|i| start + chrono::Duration::days(i)).collect();
        let archive: serde_json::Map<String, serde_json::Value> = days
            .iter()
            .map(|d| {
                (
                    d.to_string(),
                    json!({ "date": d, "value": 10.0, "goalMet": true }),
                )
            })
            .collect();
        let history: Vec<serde_json::Value> = days
            .iter()
            .rev()
            .map(|d| json!({ "date": d, "value": 10.0 }))
            .collect();
        let store = MemoryStore::with_entries([
            ("dailyStats".to_string(), serde_json::Value::Object(archive)),
            ("history".to_string(), json!(history)),
        ]);
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());

        let loaded = StatsAggregator::load(&store, StatsConfig::default(), clock, 100.0)
            .await
            .unwrap();
        assert_eq!(loaded.archive().len(), 30);
        assert!(loaded.archive().get(days[29]).is_none());
        assert!(loaded.archive().get(days[30]).is_some());
        assert!(loaded.archive().get(days[59]).is_some());
        assert_eq!(loaded.history().len(), 30);
        assert_eq!(loaded.history()[0].date, days[59]);
        assert_eq!(loaded.history()[29].date, days[30]);
    }

    #[tokio::test]
    async fn test_load_resets_malformed_archive() {
        let store = MemoryStore::with_entries([("dailyStats".to_string(), json!("garbage"))]);
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());

        let loaded = StatsAggregator::load(&store, StatsConfig::default(), clock, 100.0)
            .await
            .unwrap();
        assert!(loaded.archive().is_empty());
        assert_eq!(store.get("dailyStats").await.unwrap(), Some(json!({})));
    }
}
