//! Persisted key namespace.

/// Keys used in the persistent store.
pub struct StorageKeys;

impl StorageKeys {
    /// Live StatRecord (JSON object)
    pub const STATS: &'static str = "stats";

    /// Daily archive, map of `YYYY-MM-DD` to DailyStat
    pub const DAILY_STATS: &'static str = "dailyStats";

    /// Earned badges (JSON array)
    pub const BADGES: &'static str = "badges";

    /// User settings (JSON object)
    pub const SETTINGS: &'static str = "settings";

    /// Most-recent-first daily history (JSON array)
    pub const HISTORY: &'static str = "history";

    /// Durable outbound analytics queue (JSON array)
    pub const ANALYTICS_QUEUE: &'static str = "analytics_queue";

    /// Timestamp of the last archival sweep (RFC 3339)
    pub const LAST_CLEANUP: &'static str = "lastCleanup";

    /// Remote-replica marker set once local data has been migrated
    pub const SYNC_INITIALIZED: &'static str = "initialized";

    /// Keys carried in backups, in export order.
    pub const BACKUP_SECTIONS: [&'static str; 5] = [
        Self::STATS,
        Self::DAILY_STATS,
        Self::BADGES,
        Self::SETTINGS,
        Self::HISTORY,
    ];

    /// Device-local keys, never reconciled with the remote replica.
    pub const LOCAL_ONLY: [&'static str; 3] = [
        Self::ANALYTICS_QUEUE,
        Self::LAST_CLEANUP,
        Self::SYNC_INITIALIZED,
    ];

    pub fn is_local_only(key: &str) -> bool {
        Self::LOCAL_ONLY.contains(&key)
    }

    /// Cache key for an external data source entry, e.g.
    /// `electricity_map:intensity-IN-KL`.
    pub fn source_cache_key(source: &str, kind: &str, region: &str) -> String {
        format!("{}:{}-{}", source, kind, region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_keys() {
        assert!(StorageKeys::is_local_only("analytics_queue"));
        assert!(StorageKeys::is_local_only("initialized"));
        assert!(!StorageKeys::is_local_only("stats"));
    }

    #[test]
    fn source_cache_key_format() {
        assert_eq!(
            StorageKeys::source_cache_key("electricity_map", "intensity", "IN-KL"),
            "electricity_map:intensity-IN-KL"
        );
    }
}
