//! SQLite-backed store on a dedicated executor thread.
//!
//! One `kv` table holds every key. Values are stored as JSON text and decoded
//! outside the executor so the SQLite thread only runs SQL.

use crate::{PersistentStore, Snapshot, StorageError, StorageResult};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

const UPSERT: &str = "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// Convert a tokio_rusqlite::Error to StorageError.
fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StorageError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StorageError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => StorageError::Connection("Connection closed".to_string()),
        other => StorageError::Connection(other.to_string()),
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// [`PersistentStore`] over a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    path: String,
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    pub async fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        let path_str = path.to_string_lossy().to_string();

        let conn = Connection::open(path_str.clone())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        info!(path = %path_str, "SQLite store opened");
        Ok(Self {
            conn,
            path: path_str,
        })
    }

    /// In-memory store, useful for testing.
    pub async fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        Ok(Self {
            conn,
            path: ":memory:".to_string(),
        })
    }

    /// Database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn decode(raw: Option<String>) -> StorageResult<Option<Value>> {
        raw.map(|text| serde_json::from_str(&text).map_err(StorageError::from))
            .transpose()
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let key = key.to_string();
        let raw = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()?;
                Ok(value)
            })
            .await
            .map_err(from_tokio_rusqlite)?;
        Self::decode(raw)
    }

    async fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.write_chunk(vec![(key.to_string(), value)]).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let key = key.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?))
            .await
            .map_err(from_tokio_rusqlite)?;
        Ok(removed > 0)
    }

    async fn write_chunk(&self, entries: Vec<(String, Value)>) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let rows = entries
            .into_iter()
            .map(|(key, value)| -> StorageResult<(String, String)> {
                Ok((key, serde_json::to_string(&value)?))
            })
            .collect::<StorageResult<Vec<(String, String)>>>()?;
        let count = rows.len();
        let now = now_millis();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(UPSERT)?;
                    for (key, value) in &rows {
                        stmt.execute(params![key, value, now])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(from_tokio_rusqlite)?;

        debug!(entries = count, "SQLite chunk committed");
        Ok(())
    }

    async fn get_all(&self) -> StorageResult<Snapshot> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT key, value FROM kv ORDER BY key")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(from_tokio_rusqlite)?;

        rows.into_iter()
            .map(|(key, text)| -> StorageResult<(String, Value)> {
                Ok((key, serde_json::from_str(&text)?))
            })
            .collect()
    }

    async fn clear(&self) -> StorageResult<()> {
        self.conn
            .call(|conn| {
                conn.execute("DELETE FROM kv", [])?;
                Ok(())
            })
            .await
            .map_err(from_tokio_rusqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let store = SqliteStore::open_in_memory().await.unwrap();

        store
            .set("settings", json!({"goal": 800, "theme": "dark"}))
            .await
            .unwrap();
        assert_eq!(
            store.get("settings").await.unwrap(),
            Some(json!({"goal": 800, "theme": "dark"}))
        );

        // Overwrite
        store.set("settings", json!({"goal": 900})).await.unwrap();
        assert_eq!(store.get("settings").await.unwrap(), Some(json!({"goal": 900})));

        assert!(store.delete("settings").await.unwrap());
        assert_eq!(store.get("settings").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_store_batch_and_get_all() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let entries: Vec<_> = (0..205).map(|i| (format!("k{:03}", i), json!(i))).collect();

        let committed = store.batch_set(entries, 100).await.unwrap();
        assert_eq!(committed, 205);

        let all = store.get_all().await.unwrap();
        assert_eq!(all.len(), 205);
        assert_eq!(all.get("k204"), Some(&json!(204)));

        store.clear().await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("karma.sqlite");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.set("stats", json!({"totalAccrued": 12.5})).await.unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(
            store.get("stats").await.unwrap(),
            Some(json!({"totalAccrued": 12.5}))
        );
        assert!(store.path().ends_with("karma.sqlite"));
    }
}
