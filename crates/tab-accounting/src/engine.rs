//! Session table and per-tick accrual.

use crate::{AccountingError, AccountingResult, EmissionProfile};
use chrono::{DateTime, Utc};
use karma_config_and_utils::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Identifier of a browsing context as reported by the lifecycle source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Accounting limits and rates.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Grams per active minute before the resource multiplier.
    pub base_rate_per_minute: f64,
    /// Maximum number of tracked resources.
    pub max_sessions: usize,
    /// Cap on one session's cumulative accrual in grams.
    pub max_accrual_per_session: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_rate_per_minute: 6.0,
            max_sessions: 100,
            max_accrual_per_session: 1000.0,
        }
    }
}

/// Accounting state for one tracked resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSession {
    pub id: ResourceId,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub is_active: bool,
    /// Cumulative grams, never negative, never above the per-session cap.
    pub accrued: f64,
    pub multiplier: f64,
    pub domain: Option<String>,
}

/// Read-only summary of the session table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabStats {
    pub tracked: usize,
    pub active: usize,
    pub inactive: usize,
    pub session_total: f64,
    pub emission_rate: f64,
}

/// Owns every [`TabSession`] and converts active time into grams.
#[derive(Debug)]
pub struct TabAccountingEngine {
    config: EngineConfig,
    clock: SharedClock,
    sessions: HashMap<ResourceId, TabSession>,
}

impl TabAccountingEngine {
    pub fn new(config: EngineConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start tracking `id` as an active plain-browsing resource.
    pub fn open(&mut self, id: ResourceId) -> AccountingResult<()> {
        self.open_with_profile(id, &EmissionProfile::default())
    }

    /// Start tracking `id` with a multiplier derived from `profile`.
    pub fn open_with_profile(
        &mut self,
        id: ResourceId,
        profile: &EmissionProfile,
    ) -> AccountingResult<()> {
        let multiplier = profile.multiplier();
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(AccountingError::InvalidMultiplier { id, multiplier });
        }
        if self.sessions.contains_key(&id) {
            return Err(AccountingError::AlreadyTracked(id));
        }
        if self.sessions.len() >= self.config.max_sessions {
            warn!(
                resource_id = %id,
                limit = self.config.max_sessions,
                "tracked resource limit reached"
            );
            return Err(AccountingError::CapacityExceeded {
                id,
                limit: self.config.max_sessions,
            });
        }

        let now = self.clock.now();
        self.sessions.insert(
            id,
            TabSession {
                id,
                started_at: now,
                last_active_at: now,
                is_active: true,
                accrued: 0.0,
                multiplier,
                domain: profile.domain.clone(),
            },
        );
        debug!(resource_id = %id, multiplier, tracked = self.sessions.len(), "resource opened");
        Ok(())
    }

    /// Make `id` the only active resource.
    ///
    /// A resource moving from inactive to active restarts its accrual window
    /// at now, so time spent in the background is never billed.
    pub fn set_active(&mut self, id: ResourceId) -> AccountingResult<()> {
        if !self.sessions.contains_key(&id) {
            return Err(AccountingError::NotFound(id));
        }

        let now = self.clock.now();
        for (session_id, session) in self.sessions.iter_mut() {
            let becomes_active = *session_id == id;
            if becomes_active && !session.is_active {
                session.last_active_at = now;
            }
            session.is_active = becomes_active;
        }
        debug!(resource_id = %id, "resource activated");
        Ok(())
    }

    /// Accrue every active session up to now and return the grams to forward.
    ///
    /// Inactive sessions contribute nothing. A tick with nothing active
    /// returns zero.
    pub fn tick(&mut self) -> f64 {
        let now = self.clock.now();
        let config = &self.config;

        let total: f64 = self
            .sessions
            .values_mut()
            .filter(|session| session.is_active)
            .map(|session| accrue(session, now, config))
            .sum();

        if total > 0.0 {
            debug!(delta = total, active = self.active_count(), "accrual tick");
        }
        total
    }

    /// Stop tracking `id`, returning its final accrual delta.
    pub fn close(&mut self, id: ResourceId) -> AccountingResult<f64> {
        let now = self.clock.now();
        let mut session = self
            .sessions
            .remove(&id)
            .ok_or(AccountingError::NotFound(id))?;

        let delta = if session.is_active {
            accrue(&mut session, now, &self.config)
        } else {
            0.0
        };
        info!(
            resource_id = %id,
            final_delta = delta,
            accrued = session.accrued,
            "resource closed"
        );
        Ok(delta)
    }

    /// Whether `id` is currently tracked.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn session(&self, id: ResourceId) -> Option<&TabSession> {
        self.sessions.get(&id)
    }

    /// Sum of accrual over the sessions tracked right now.
    pub fn session_total(&self) -> f64 {
        self.sessions.values().map(|s| s.accrued).sum()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active).count()
    }

    pub fn inactive_count(&self) -> usize {
        self.sessions.len() - self.active_count()
    }

    pub fn tracked_count(&self) -> usize {
        self.sessions.len()
    }

    /// Grams per minute at the current activity level, capped at the per-session maximum.
    pub fn emission_rate(&self) -> f64 {
        let rate = self.active_count() as f64 * self.config.base_rate_per_minute;
        rate.min(self.config.max_accrual_per_session)
    }

    pub fn stats(&self) -> TabStats {
        let active = self.active_count();
        TabStats {
            tracked: self.sessions.len(),
            active,
            inactive: self.inactive_count(),
            session_total: self.session_total(),
            emission_rate: self.emission_rate(),
        }
    }
}

/// Advance one session to `now`, returning the grams actually applied.
fn accrue(session: &mut TabSession, now: DateTime<Utc>, config: &EngineConfig) -> f64 {
    let elapsed_ms = (now - session.last_active_at).num_milliseconds().max(0);
    let minutes = elapsed_ms as f64 / 60_000.0;
    let raw = minutes * config.base_rate_per_minute * session.multiplier;

    let before = session.accrued;
    session.accrued = (before + raw).clamp(0.0, config.max_accrual_per_session);
    session.last_active_at = now;
    session.accrued - before
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use karma_config_and_utils::ManualClock;
    use std::sync::Arc;

    fn engine() -> (TabAccountingEngine, Arc<ManualClock>) {
        engine_with(EngineConfig::default())
    }

    fn engine_with(config: EngineConfig) -> (TabAccountingEngine, Arc<ManualClock>) {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap());
        (TabAccountingEngine::new(config, clock.clone()), clock)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    #[test]
    fn test_open_creates_active_session() {
        let (mut engine, _clock) = engine();
        engine.open(ResourceId(7)).unwrap();

        let session = engine.session(ResourceId(7)).unwrap();
        assert!(session.is_active);
        assert_eq!(session.accrued, 0.0);
        assert_eq!(session.multiplier, 1.0);
        assert_eq!(engine.tracked_count(), 1);
    }

    #[test]
    fn test_open_rejects_duplicate() {
        let (mut engine, _clock) = engine();
        engine.open(ResourceId(1)).unwrap();
        assert_eq!(
            engine.open(ResourceId(1)),
            Err(AccountingError::AlreadyTracked(ResourceId(1)))
        );
    }

    #[test]
    fn test_open_at_capacity_fails() {
        let (mut engine, _clock) = engine_with(EngineConfig {
            max_sessions: 2,
            ..EngineConfig::default()
        });
        engine.open(ResourceId(1)).unwrap();
        engine.open(ResourceId(2)).unwrap();

        assert_eq!(
            engine.open(ResourceId(3)),
            Err(AccountingError::CapacityExceeded {
                id: ResourceId(3),
                limit: 2
            })
        );
        assert_eq!(engine.tracked_count(), 2);

        // Closing frees a slot
        engine.close(ResourceId(1)).unwrap();
        engine.open(ResourceId(3)).unwrap();
    }

    #[test]
    fn test_set_active_unknown_is_not_found() {
        let (mut engine, _clock) = engine();
        assert_eq!(
            engine.set_active(ResourceId(9)),
            Err(AccountingError::NotFound(ResourceId(9)))
        );
    }

    #[test]
    fn test_close_twice_is_not_found() {
        let (mut engine, _clock) = engine();
        engine.open(ResourceId(4)).unwrap();
        engine.close(ResourceId(4)).unwrap();
        assert_eq!(
            engine.close(ResourceId(4)),
            Err(AccountingError::NotFound(ResourceId(4)))
        );
        assert_eq!(
            engine.close(ResourceId(5)),
            Err(AccountingError::NotFound(ResourceId(5)))
        );
    }

    // ========================================================================
    // Accrual
    // ========================================================================

    /// N active sessions over m minutes forward N * m * rate * multiplier,
    /// each clamped at the per-session cap.
    #[test]
    fn test_tick_sums_active_sessions_with_clamp() {
        let (mut engine, clock) = engine_with(EngineConfig {
            base_rate_per_minute: 6.0,
            max_sessions: 10,
            max_accrual_per_session: 100.0,
        });
        engine.open(ResourceId(1)).unwrap();
        engine
            .open_with_profile(ResourceId(2), &EmissionProfile::for_domain("www.youtube.com"))
            .unwrap();

        clock.advance(Duration::minutes(5));
        let delta = engine.tick();
        // 5 * 6 * 1.0 + min(5 * 6 * 3.0, 100)
        assert!(approx(delta, 30.0 + 90.0));

        clock.advance(Duration::minutes(5));
        let delta = engine.tick();
        // Session 2 hits the cap: only 10 more grams fit
        assert!(approx(delta, 30.0 + 10.0));
        assert!(approx(engine.session(ResourceId(2)).unwrap().accrued, 100.0));

        clock.advance(Duration::minutes(5));
        assert!(approx(engine.tick(), 30.0));
    }

    #[test]
    fn test_inactive_sessions_accrue_zero() {
        let (mut engine, clock) = engine();
        engine.open(ResourceId(1)).unwrap();
        engine.open(ResourceId(2)).unwrap();
        engine.set_active(ResourceId(1)).unwrap();

        clock.advance(Duration::minutes(2));
        assert!(approx(engine.tick(), 12.0));
        assert_eq!(engine.session(ResourceId(2)).unwrap().accrued, 0.0);
        assert_eq!(engine.stats().inactive, 1);
        assert_eq!(engine.inactive_count(), 1);
    }

    #[test]
    fn test_tick_with_no_active_sessions_is_zero() {
        let (mut engine, clock) = engine();
        clock.advance(Duration::minutes(10));
        assert_eq!(engine.tick(), 0.0);
    }

    #[test]
    fn test_reactivation_refreshes_window() {
        let (mut engine, clock) = engine();
        engine.open(ResourceId(1)).unwrap();
        engine.open(ResourceId(2)).unwrap();
        engine.set_active(ResourceId(2)).unwrap();

        // Background time on resource 1 is not billed when it comes back
        clock.advance(Duration::minutes(30));
        engine.set_active(ResourceId(1)).unwrap();
        clock.advance(Duration::minutes(1));

        assert!(approx(engine.tick(), 6.0));
        assert!(approx(engine.session(ResourceId(1)).unwrap().accrued, 6.0));
    }

    #[test]
    fn test_close_returns_final_delta() {
        let (mut engine, clock) = engine();
        engine.open(ResourceId(1)).unwrap();
        clock.advance(Duration::seconds(90));

        let delta = engine.close(ResourceId(1)).unwrap();
        assert!(approx(delta, 9.0));
        assert!(!engine.contains(ResourceId(1)));
    }

    #[test]
    fn test_close_inactive_returns_zero() {
        let (mut engine, clock) = engine();
        engine.open(ResourceId(1)).unwrap();
        engine.open(ResourceId(2)).unwrap();
        engine.set_active(ResourceId(2)).unwrap();
        clock.advance(Duration::minutes(3));

        assert_eq!(engine.close(ResourceId(1)).unwrap(), 0.0);
    }

    #[test]
    fn test_stats_and_rate() {
        let (mut engine, clock) = engine();
        engine.open(ResourceId(1)).unwrap();
        engine.open(ResourceId(2)).unwrap();
        clock.advance(Duration::minutes(1));
        engine.tick();

        let stats = engine.stats();
        assert_eq!(stats.tracked, 2);
        assert_eq!(stats.active, 2);
        assert!(approx(stats.session_total, 12.0));
        assert!(approx(stats.emission_rate, 12.0));
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let (mut engine, _clock) = engine();
        engine.open(ResourceId(3)).unwrap();
        let json = serde_json::to_value(engine.session(ResourceId(3)).unwrap()).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["isActive"], true);
        assert!(json.get("lastActiveAt").is_some());
    }
}
