//! SQLite-backed record and cache store
//!
//! Persists both logical collections and the resolution cache in a single
//! database file so bindings survive restarts.

use crate::error::{Error, Result};
use crate::store::{CacheStore, RecordStore, ValueStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// SQLite store with thread-safe access
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Store(format!("failed to create {}: {}", parent.display(), e)))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;

        info!("Store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);
            Self::migrate_v1(&conn)?;
        }

        Ok(())
    }

    /// Migration v1: records and cache tables
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: records and cache");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (collection, key)
            );

            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#,
        )?;

        Ok(())
    }
}

fn decode(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| Error::Store(format!("corrupt record: {}", e)))
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT value FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key],
                |row| row.get(0),
            )
            .optional()?
        };

        raw.as_deref().map(decode).transpose()
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO records (collection, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(collection, key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![collection, key, value.to_string()],
        )?;
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND key = ?2",
            params![collection, key],
        )?;
        Ok(())
    }

    async fn scan_prefix(&self, collection: &str, prefix: &str) -> Result<ValueStream> {
        let rows: Vec<String> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT value FROM records
                 WHERE collection = ?1 AND substr(key, 1, length(?2)) = ?2
                 ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![collection, prefix], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            rows
        };

        Ok(stream::iter(rows).map(|raw| decode(&raw)).boxed())
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cache (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
