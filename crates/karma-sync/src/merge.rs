//! Deterministic merge of local and remote snapshots.
//!
//! Resolution depends only on the two inputs and the `lastModified` stamps
//! they carry. Nothing here reads the clock or the store.

use crate::entity::{Origin, SyncEntity, SyncEnvelope};
use karma_stats::{decode_entity, Badge, DailyArchive, HistoryEntry, Settings, StatRecord, Validate};
use karma_storage::Snapshot;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// How one key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Only one side had the key.
    OneSided(Origin),
    /// Both sides were stamped and one was strictly later.
    Newer(Origin),
    /// Values were merged structurally or by entity rule.
    Merged,
    /// Both sides held the same value.
    Unchanged,
    /// The remote value failed validation and local was kept.
    KeptLocal { reason: String },
}

/// Full result of a reconcile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    pub resolved: Snapshot,
    pub resolutions: BTreeMap<String, Resolution>,
}

impl Reconciliation {
    /// Keys whose remote value was rejected.
    pub fn unresolvable(&self) -> Vec<&str> {
        self.resolutions
            .iter()
            .filter(|(_, r)| matches!(r, Resolution::KeptLocal { .. }))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Keys where both sides differed.
    pub fn conflicted(&self) -> Vec<&str> {
        self.resolutions
            .iter()
            .filter(|(_, r)| {
                matches!(
                    r,
                    Resolution::Newer(_) | Resolution::Merged | Resolution::KeptLocal { .. }
                )
            })
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// Merge two snapshots into one.
pub fn reconcile(local: &Snapshot, remote: &Snapshot) -> Snapshot {
    reconcile_detailed(local, remote).resolved
}

/// Merge two snapshots, reporting how each key was resolved.
pub fn reconcile_detailed(local: &Snapshot, remote: &Snapshot) -> Reconciliation {
    let keys: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    let mut out = Reconciliation::default();

    for key in keys {
        let l = local.get(key).map(|v| SyncEnvelope::new(key, v.clone(), Origin::Local));
        let r = remote.get(key).map(|v| SyncEnvelope::new(key, v.clone(), Origin::Remote));

        let (value, resolution) = match (l, r) {
            (Some(l), None) => (Some(l.value), Resolution::OneSided(Origin::Local)),
            (None, Some(r)) => match check_remote(key, &r.value) {
                Ok(()) => (Some(r.value), Resolution::OneSided(Origin::Remote)),
                Err(reason) => {
                    warn!(key = %key, reason = %reason, "SyncConflictUnresolvable: rejecting remote-only value");
                    (None, Resolution::KeptLocal { reason })
                }
            },
            (Some(l), Some(r)) => {
                let (value, resolution) = resolve_pair(l, r);
                (Some(value), resolution)
            }
            (None, None) => continue,
        };

        if let Some(value) = value {
            out.resolved.insert(key.clone(), value);
        }
        out.resolutions.insert(key.clone(), resolution);
    }

    out
}

fn resolve_pair(local: SyncEnvelope, remote: SyncEnvelope) -> (Value, Resolution) {
    if local.value == remote.value {
        return (local.value, Resolution::Unchanged);
    }

    let entity = SyncEntity::for_key(&local.key);

    // Badges are immutable once earned, so a union is always correct.
    if entity == SyncEntity::Badges {
        return keep_local_on_err(&local, merge_badges(&local.value, &remote.value));
    }

    match (local.last_modified, remote.last_modified) {
        (Some(lt), Some(rt)) if lt > rt => (local.value, Resolution::Newer(Origin::Local)),
        (Some(lt), Some(rt)) if rt > lt => match check_remote(&local.key, &remote.value) {
            Ok(()) => (remote.value, Resolution::Newer(Origin::Remote)),
            Err(reason) => kept_local(local, reason),
        },
        _ => {
            let merged = match entity {
                SyncEntity::History => merge_history(&local.value, &remote.value),
                _ => Ok(merge_values(&local.value, &remote.value)),
            };
            let merged = merged.and_then(|value| check_remote(&local.key, &value).map(|_| value));
            keep_local_on_err(&local, merged)
        }
    }
}

fn keep_local_on_err(local: &SyncEnvelope, merged: Result<Value, String>) -> (Value, Resolution) {
    match merged {
        Ok(value) => (value, Resolution::Merged),
        Err(reason) => kept_local(local.clone(), reason),
    }
}

fn kept_local(local: SyncEnvelope, reason: String) -> (Value, Resolution) {
    warn!(key = %local.key, reason = %reason, "SyncConflictUnresolvable: keeping local value");
    (local.value, Resolution::KeptLocal { reason })
}

/// Validate a value that came from, or was merged with, the remote side.
pub(crate) fn check_remote(key: &str, value: &Value) -> Result<(), String> {
    fn check<T: DeserializeOwned + Validate>(key: &str, value: &Value) -> Result<(), String> {
        decode_entity::<T>(key, value.clone())
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    match SyncEntity::for_key(key) {
        SyncEntity::Settings => check::<Settings>(key, value),
        SyncEntity::Stats => check::<StatRecord>(key, value),
        SyncEntity::DailyStats => check::<DailyArchive>(key, value),
        SyncEntity::History => check::<Vec<HistoryEntry>>(key, value),
        SyncEntity::Badges => check::<Vec<Badge>>(key, value),
        SyncEntity::Generic => Ok(()),
    }
}

/// Structural merge.
///
/// Objects merge key by key, recursing where both sides have the key.
/// Arrays become a deduplicated union, local elements first. Any other
/// pairing keeps the local value.
pub fn merge_values(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut out = r.clone();
            for (key, lv) in l {
                let merged = match r.get(key) {
                    Some(rv) => merge_values(lv, rv),
                    None => lv.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(l), Value::Array(r)) => {
            let mut out: Vec<Value> = Vec::with_capacity(l.len() + r.len());
            for item in l.iter().chain(r) {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Value::Array(out)
        }
        _ => local.clone(),
    }
}

/// Union by badge id, keeping the earliest `earnedAt`.
fn merge_badges(local: &Value, remote: &Value) -> Result<Value, String> {
    let local: Vec<Badge> = serde_json::from_value(local.clone()).map_err(|e| e.to_string())?;
    let remote: Vec<Badge> = serde_json::from_value(remote.clone()).map_err(|e| e.to_string())?;

    let mut by_id: BTreeMap<String, Badge> = BTreeMap::new();
    for badge in local.into_iter().chain(remote) {
        match by_id.get(&badge.id) {
            Some(existing) if existing.earned_at <= badge.earned_at => {}
            _ => {
                by_id.insert(badge.id.clone(), badge);
            }
        }
    }

    let mut merged: Vec<Badge> = by_id.into_values().collect();
    merged.sort_by(|a, b| a.earned_at.cmp(&b.earned_at).then_with(|| a.id.cmp(&b.id)));
    serde_json::to_value(merged).map_err(|e| e.to_string())
}

/// Trim archive and history entries in `snapshot` to the newest `capacity` days.
///
/// Unions of two devices' days can exceed what either keeps. Values that do
/// not decode are left for validation to reject. Returns the keys rewritten.
pub fn bound_days(snapshot: &mut Snapshot, capacity: usize) -> Vec<String> {
    let mut trimmed = Vec::new();
    for (key, value) in snapshot.iter_mut() {
        let bounded = match SyncEntity::for_key(key) {
            SyncEntity::DailyStats => serde_json::from_value::<DailyArchive>(value.clone())
                .ok()
                .and_then(|mut archive| {
                    (archive.truncate_to(capacity) > 0).then_some(archive)
                })
                .and_then(|archive| serde_json::to_value(archive).ok()),
            SyncEntity::History => serde_json::from_value::<Vec<HistoryEntry>>(value.clone())
                .ok()
                .filter(|history| history.len() > capacity)
                .and_then(|mut history| {
                    history.sort_by(|a, b| b.date.cmp(&a.date));
                    history.truncate(capacity);
                    serde_json::to_value(history).ok()
                }),
            _ => None,
        };
        if let Some(bounded) = bounded {
            *value = bounded;
            trimmed.push(key.clone());
        }
    }
    trimmed
}

/// Union by date, local entries winning, most recent first.
fn merge_history(local: &Value, remote: &Value) -> Result<Value, String> {
    let local: Vec<HistoryEntry> = serde_json::from_value(local.clone()).map_err(|e| e.to_string())?;
    let remote: Vec<HistoryEntry> = serde_json::from_value(remote.clone()).map_err(|e| e.to_string())?;

    let mut by_date = BTreeMap::new();
    for entry in remote.into_iter().chain(local) {
        by_date.insert(entry.date, entry);
    }
    let merged: Vec<HistoryEntry> = by_date.into_values().rev().collect();
    serde_json::to_value(merged).map_err(|e| e.to_string())
}
