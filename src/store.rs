//! Label to backend mapping storage
//!
//! The router and the control plane share one store handle. Every
//! implementation synchronizes internally, so callers never coordinate.

use crate::config::{StorageConfig, StorageEngine};
use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// In-memory database path understood by [`SqliteStore::open`]
pub const MEMORY_PATH: &str = ":memory:";

/// Failure kinds surfaced by a mapping store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No mapping exists for the label
    #[error("no backend registered for label")]
    NotFound,
    /// Any other storage failure, carrying its description
    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Other(other.to_string()),
        }
    }
}

/// Persistent associative store from subdomain label to backend URL
pub trait MappingStore: Send + Sync {
    /// Snapshot of every mapping
    fn map(&self) -> Result<HashMap<String, String>, StoreError>;

    /// Backend for `label`, or [`StoreError::NotFound`]
    fn get(&self, label: &str) -> Result<String, StoreError>;

    /// Create or fully replace the mapping for `label`
    fn set(&self, label: &str, backend: &str) -> Result<(), StoreError>;

    /// Remove the mapping for `label`; absent labels are not an error
    fn delete(&self, label: &str) -> Result<(), StoreError>;

    /// Remove every mapping
    fn delete_all(&self) -> Result<(), StoreError>;

    /// Release underlying resources
    fn close(&self);
}

/// Shared store handle used across concurrent requests
pub type SharedStore = Arc<dyn MappingStore>;

/// Open the store selected by configuration
pub fn open_store(config: &StorageConfig) -> Result<SharedStore> {
    match config.engine {
        StorageEngine::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
        StorageEngine::Memory => {
            info!("Using volatile in-memory mapping store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// SQLite-backed store with a single serialized connection
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open or create a store at `path`, or in memory for `":memory:"`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let conn = if path.as_os_str() == MEMORY_PATH {
            Connection::open_in_memory().context("Failed to open in-memory database")?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(path).context("Failed to open database")?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn
        };

        Self::init_schema(&conn)?;

        info!(path = %path.display(), "Mapping store opened");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(MEMORY_PATH)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        debug!("Ensuring subdomain_map table exists");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS subdomain_map (
                subdomain TEXT PRIMARY KEY,
                backend   TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create subdomain_map table")?;
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| StoreError::Other("store is closed".to_string()))?;
        f(conn).map_err(StoreError::from)
    }
}

impl MappingStore for SqliteStore {
    fn map(&self) -> Result<HashMap<String, String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT subdomain, backend FROM subdomain_map")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut mappings = HashMap::new();
            for row in rows {
                let (label, backend) = row?;
                mappings.insert(label, backend);
            }
            Ok(mappings)
        })
    }

    fn get(&self, label: &str) -> Result<String, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT backend FROM subdomain_map WHERE subdomain = ?1",
                params![label],
                |row| row.get(0),
            )
        })
    }

    fn set(&self, label: &str, backend: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "REPLACE INTO subdomain_map (subdomain, backend) VALUES (?1, ?2)",
                params![label, backend],
            )
        })?;
        debug!(label, backend, "Mapping stored");
        Ok(())
    }

    fn delete(&self, label: &str) -> Result<(), StoreError> {
        let rows = self.with_conn(|conn| {
            conn.execute("DELETE FROM subdomain_map WHERE subdomain = ?1", params![label])
        })?;
        debug!(label, removed = rows > 0, "Mapping deleted");
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        let rows = self.with_conn(|conn| conn.execute("DELETE FROM subdomain_map", []))?;
        debug!(removed = rows, "All mappings deleted");
        Ok(())
    }

    fn close(&self) {
        if let Some(conn) = self.conn.lock().take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "Failed to close mapping store cleanly");
            } else {
                info!("Mapping store closed");
            }
        }
    }
}

/// Volatile store backed by a concurrent hash map
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingStore for MemoryStore {
    fn map(&self) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    fn get(&self, label: &str) -> Result<String, StoreError> {
        self.entries
            .get(label)
            .map(|backend| backend.value().clone())
            .ok_or(StoreError::NotFound)
    }

    fn set(&self, label: &str, backend: &str) -> Result<(), StoreError> {
        self.entries.insert(label.to_string(), backend.to_string());
        Ok(())
    }

    fn delete(&self, label: &str) -> Result<(), StoreError> {
        self.entries.remove(label);
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }

    fn close(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_contract(store: &dyn MappingStore) {
        store.set("hoge", "http://localhost:5001").unwrap();
        store.set("fuga", "http://localhost:5002").unwrap();

        let all = store.map().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("hoge").map(String::as_str), Some("http://localhost:5001"));
        assert_eq!(all.get("fuga").map(String::as_str), Some("http://localhost:5002"));

        assert_eq!(store.get("hoge").unwrap(), "http://localhost:5001");
        assert_eq!(store.get("fuga").unwrap(), "http://localhost:5002");

        store.delete("hoge").unwrap();
        assert_eq!(store.get("hoge"), Err(StoreError::NotFound));

        store.delete_all().unwrap();
        assert_eq!(store.get("fuga"), Err(StoreError::NotFound));
        assert!(store.map().unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_store_contract() {
        let store = SqliteStore::open_in_memory().unwrap();
        exercise_contract(&store);
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryStore::new();
        exercise_contract(&store);
    }

    #[test]
    fn test_get_unknown_label_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get("never-written"), Err(StoreError::NotFound));
    }

    #[test]
    fn test_set_overwrites_existing_label() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set("app", "http://127.0.0.1:8001").unwrap();
        store.set("app", "http://127.0.0.1:8002").unwrap();

        assert_eq!(store.get("app").unwrap(), "http://127.0.0.1:8002");
        assert_eq!(store.map().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_absent_label_succeeds() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.delete("missing").unwrap();
        store.delete("missing").unwrap();

        let memory = MemoryStore::new();
        memory.delete("missing").unwrap();
    }

    #[test]
    fn test_sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mappings.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("persist", "http://127.0.0.1:9000").unwrap();
            store.close();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get("persist").unwrap(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_closed_store_reports_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.close();

        match store.get("anything") {
            Err(StoreError::Other(msg)) => assert_eq!(msg, "store is closed"),
            other => panic!("unexpected result: {:?}", other),
        }
        // Closing twice is harmless
        store.close();
    }

    #[test]
    fn test_rusqlite_error_conversion() {
        assert_eq!(
            StoreError::from(rusqlite::Error::QueryReturnedNoRows),
            StoreError::NotFound
        );
        assert!(matches!(
            StoreError::from(rusqlite::Error::InvalidQuery),
            StoreError::Other(_)
        ));
    }

    #[test]
    fn test_concurrent_writers() {
        let store: SharedStore = Arc::new(SqliteStore::open_in_memory().unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        store
                            .set(&format!("w{}-{}", i, j), "http://127.0.0.1:1")
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.map().unwrap().len(), 200);
    }

    #[test]
    fn test_open_store_selects_engine() {
        let memory = open_store(&StorageConfig {
            engine: StorageEngine::Memory,
            path: MEMORY_PATH.to_string(),
        })
        .unwrap();
        memory.set("a", "http://127.0.0.1:1").unwrap();
        assert_eq!(memory.get("a").unwrap(), "http://127.0.0.1:1");

        let sqlite = open_store(&StorageConfig::default()).unwrap();
        assert_eq!(sqlite.get("a"), Err(StoreError::NotFound));
    }
}
