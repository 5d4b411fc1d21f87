//! Everything the single-writer lock protects.

use crate::RuntimeResult;
use karma_config_and_utils::SharedClock;
use karma_stats::{
    load_or_reset, Badge, BadgeEngine, DailyStat, Settings, StatsAggregator, StatsConfig, StatsError,
    Validate,
};
use karma_storage::{PersistentStore, StorageKeys};
use serde_json::Value;
use tab_accounting::{
    AccountingError, EmissionProfile, EngineConfig, ResourceId, TabAccountingEngine,
};
use tracing::{debug, info};

/// Resource lifecycle signal from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSignal {
    Opened {
        id: ResourceId,
        profile: Option<EmissionProfile>,
    },
    Activated(ResourceId),
    Closed(ResourceId),
}

/// What a mutation of the ledger produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// Day concluded by a rollover, if one happened.
    pub rolled: Option<DailyStat>,
    /// Grams added to the running total.
    pub accrued: f64,
    pub new_badges: Vec<Badge>,
}

/// Tab sessions, stats, badges and settings.
///
/// The runtime keeps exactly one behind a `tokio::sync::Mutex`; every
/// accrual, rollover and sync happens while holding it.
#[derive(Debug)]
pub struct Ledger {
    clock: SharedClock,
    stats_config: StatsConfig,
    tabs: TabAccountingEngine,
    stats: StatsAggregator,
    badge_engine: BadgeEngine,
    badges: Vec<Badge>,
    settings: Settings,
}

impl Ledger {
    /// Load persisted state. Malformed entities are reset and persisted.
    pub async fn load(
        store: &dyn PersistentStore,
        engine_config: EngineConfig,
        stats_config: StatsConfig,
        clock: SharedClock,
    ) -> RuntimeResult<Self> {
        let tabs = TabAccountingEngine::new(engine_config, clock.clone());
        let (stats, badges, settings) = load_persisted(store, &stats_config, &clock).await?;

        Ok(Self {
            clock,
            stats_config,
            tabs,
            stats,
            badge_engine: BadgeEngine::default(),
            badges,
            settings,
        })
    }

    /// Re-read stats, badges and settings after the store changed underneath.
    /// Tab sessions are kept.
    pub async fn reload(&mut self, store: &dyn PersistentStore) -> RuntimeResult<()> {
        let (stats, badges, settings) = load_persisted(store, &self.stats_config, &self.clock).await?;
        self.stats = stats;
        self.badges = badges;
        self.settings = settings;
        debug!("Ledger reloaded from store");
        Ok(())
    }

    pub fn tabs(&self) -> &TabAccountingEngine {
        &self.tabs
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn badges(&self) -> &[Badge] {
        &self.badges
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Periodic accrual. Rolls the day over first, so accrual always lands
    /// on the current day.
    pub fn tick(&mut self) -> RuntimeResult<TickOutcome> {
        let rolled = self.stats.roll_day(self.clock.today());
        let accrued = self.tabs.tick();
        self.stats.record_accrual(accrued)?;
        let new_badges = self.evaluate_badges();
        Ok(TickOutcome {
            rolled,
            accrued,
            new_badges,
        })
    }

    pub fn apply(&mut self, signal: &ResourceSignal) -> RuntimeResult<TickOutcome> {
        match signal {
            ResourceSignal::Opened { id, profile } => {
                match profile {
                    Some(profile) => self.tabs.open_with_profile(*id, profile)?,
                    None => self.tabs.open(*id)?,
                }
                Ok(TickOutcome {
                    new_badges: self.evaluate_badges(),
                    ..TickOutcome::default()
                })
            }
            ResourceSignal::Activated(id) => {
                self.tabs.set_active(*id)?;
                Ok(TickOutcome::default())
            }
            ResourceSignal::Closed(id) => {
                // A rejected close must not consume the rollover
                if !self.tabs.contains(*id) {
                    return Err(AccountingError::NotFound(*id).into());
                }
                let rolled = self.stats.roll_day(self.clock.today());
                let accrued = self.tabs.close(*id)?;
                self.stats.record_accrual(accrued)?;
                Ok(TickOutcome {
                    rolled,
                    accrued,
                    new_badges: self.evaluate_badges(),
                })
            }
        }
    }

    /// Replace settings after validation. The goal applies to the day in progress.
    pub fn update_settings(&mut self, settings: Settings) -> RuntimeResult<()> {
        settings
            .validate()
            .map_err(|reason| StatsError::validation(StorageKeys::SETTINGS, reason))?;
        self.stats.set_goal(settings.daily_goal);
        self.settings = settings;
        Ok(())
    }

    /// Archival sweep using the configured retention window.
    pub fn cleanup(&mut self) -> usize {
        let today = self.clock.today();
        let retention = self.settings.data_retention_days;
        self.stats.cleanup(today, retention)
    }

    /// Earn every badge whose requirement now holds.
    pub fn evaluate_badges(&mut self) -> Vec<Badge> {
        let inputs = self.stats.badge_inputs(Some(self.tabs.tracked_count()));
        let now = self.clock.now();
        let earned: Vec<Badge> = self
            .badge_engine
            .evaluate(&inputs, &self.badges)
            .iter()
            .map(|def| def.earn(now))
            .collect();

        for badge in &earned {
            info!(badge = %badge.id, "Badge earned");
        }
        self.badges.extend(earned.iter().cloned());
        earned
    }

    /// Store entries for everything the ledger persists.
    pub fn persisted_entries(&self) -> RuntimeResult<Vec<(String, Value)>> {
        let mut entries = self.stats.persisted_entries()?;
        entries.push((
            StorageKeys::BADGES.to_string(),
            serde_json::to_value(&self.badges).map_err(StatsError::from)?,
        ));
        entries.push((
            StorageKeys::SETTINGS.to_string(),
            serde_json::to_value(&self.settings).map_err(StatsError::from)?,
        ));
        Ok(entries)
    }
}

async fn load_persisted(
    store: &dyn PersistentStore,
    stats_config: &StatsConfig,
    clock: &SharedClock,
) -> RuntimeResult<(StatsAggregator, Vec<Badge>, Settings)> {
    let settings: Settings = load_or_reset(store, StorageKeys::SETTINGS, Settings::default)
        .await?
        .value;
    let badges: Vec<Badge> = load_or_reset(store, StorageKeys::BADGES, Vec::new).await?.value;
    let mut stats =
        StatsAggregator::load(store, stats_config.clone(), clock.clone(), settings.daily_goal).await?;
    // The goal follows settings, which may have changed on another device.
    stats.set_goal(settings.daily_goal);
    Ok((stats, badges, settings))
}
