//! Persisted stats entities.

use crate::Validate;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The live running totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatRecord {
    /// Grams accrued since the last rollover.
    pub total_accrued: f64,
    /// Grams accrued since the engine started.
    #[serde(default)]
    pub session_accrued: f64,
    /// Daily goal in grams.
    pub goal: f64,
    #[serde(default)]
    pub streak_count: u32,
    #[serde(default)]
    pub longest_streak: u32,
    /// Calendar day `total_accrued` belongs to.
    pub last_reset_date: NaiveDate,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl StatRecord {
    pub fn new(today: NaiveDate, goal: f64) -> Self {
        Self {
            total_accrued: 0.0,
            session_accrued: 0.0,
            goal,
            streak_count: 0,
            longest_streak: 0,
            last_reset_date: today,
            last_modified: None,
        }
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(format!("{} must be a non-negative number, got {}", name, value))
    }
}

impl Validate for StatRecord {
    fn validate(&self) -> Result<(), String> {
        non_negative("totalAccrued", self.total_accrued)?;
        non_negative("sessionAccrued", self.session_accrued)?;
        if !(self.goal.is_finite() && self.goal > 0.0) {
            return Err(format!("goal must be positive, got {}", self.goal));
        }
        if self.longest_streak < self.streak_count {
            return Err(format!(
                "longestStreak {} is below streakCount {}",
                self.longest_streak, self.streak_count
            ));
        }
        Ok(())
    }
}

/// One concluded day in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub date: NaiveDate,
    pub value: f64,
    pub goal_met: bool,
}

/// Bounded archive of concluded days, keyed by date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DailyArchive {
    entries: BTreeMap<NaiveDate, DailyStat>,
}

impl DailyArchive {
    /// Append `stat`, then drop the oldest days beyond `capacity`.
    pub fn push(&mut self, stat: DailyStat, capacity: usize) {
        self.entries.insert(stat.date, stat);
        self.truncate_to(capacity);
    }

    /// Keep only the newest `capacity` days. Returns how many were dropped.
    pub fn truncate_to(&mut self, capacity: usize) -> usize {
        let before = self.entries.len();
        while self.entries.len() > capacity {
            self.entries.pop_first();
        }
        before - self.entries.len()
    }

    /// Drop days before `cutoff`. Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: NaiveDate) -> usize {
        let before = self.entries.len();
        self.entries = self.entries.split_off(&cutoff);
        before - self.entries.len()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&DailyStat> {
        self.entries.get(&date)
    }

    /// Days in chronological order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &DailyStat> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn goals_met(&self) -> usize {
        self.entries.values().filter(|d| d.goal_met).count()
    }
}

impl Validate for DailyArchive {
    fn validate(&self) -> Result<(), String> {
        for (date, stat) in &self.entries {
            if *date != stat.date {
                return Err(format!("entry keyed {} carries date {}", date, stat.date));
            }
            non_negative("value", stat.value)?;
        }
        Ok(())
    }
}

/// One day in the most-recent-first history list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub date: NaiveDate,
    pub value: f64,
}

impl Validate for Vec<HistoryEntry> {
    fn validate(&self) -> Result<(), String> {
        for entry in self {
            non_negative("value", entry.value)?;
        }
        if self.windows(2).any(|pair| pair[0].date <= pair[1].date) {
            return Err("history must be strictly most-recent first".to_string());
        }
        Ok(())
    }
}
