use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::CrmError;

/// Durable string-keyed storage backing the native provider and the
/// persisted service configuration. Implementations must be safe to call
/// from multiple tasks; callers serialize read-modify-write cycles
/// themselves.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CrmError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CrmError>;
}

/// SQLite-backed store using a single `settings` key/value table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(db_path: &Path) -> Result<Self, CrmError> {
        let conn = Connection::open(db_path)
            .map_err(|e| CrmError::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| CrmError::Storage(format!("failed to create tables: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, CrmError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CrmError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

/// In-memory store for tests and hosts without a filesystem.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, CrmError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CrmError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_store_round_trips_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(&dir.path().join("crm.db")).unwrap();

        assert_eq!(store.get("missing").unwrap(), None);

        store.set("customers", "[]").unwrap();
        assert_eq!(store.get("customers").unwrap().as_deref(), Some("[]"));

        store.set("customers", "[{}]").unwrap();
        assert_eq!(store.get("customers").unwrap().as_deref(), Some("[{}]"));
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crm.db");

        SqliteStore::new(&path)
            .unwrap()
            .set("customerServiceConfig", "{\"provider\":\"native\"}")
            .unwrap();

        let reopened = SqliteStore::new(&path).unwrap();
        assert_eq!(
            reopened.get("customerServiceConfig").unwrap().as_deref(),
            Some("{\"provider\":\"native\"}")
        );
    }

    #[test]
    fn memory_store_overwrites() {
        let store = MemoryStore::default();
        store.set("k", "1").unwrap();
        store.set("k", "2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("2"));
    }
}
