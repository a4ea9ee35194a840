use super::StateStore;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

/// Key-value state store backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE kv (
///     key TEXT PRIMARY KEY,
///     value TEXT NOT NULL,       -- JSON
///     updated_at TEXT NOT NULL   -- ISO 8601 timestamp
/// );
/// ```
///
/// The connection is wrapped in a Mutex; every call is one short statement.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Creates or opens a store at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open state database")?;
        Self::init(conn)
    }

    /// In-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create kv table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a statement half-applied
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for SqliteStore {
    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value).context("Failed to serialize state value")?;
        let now = Utc::now().to_rfc3339();

        self.conn()
            .execute(
                r#"
                INSERT INTO kv (key, value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
                params![key, json, now],
            )
            .with_context(|| format!("Failed to save state for '{}'", key))?;

        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("Failed to load state for '{}'", key))?;

        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt state value for '{}'", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("Failed to delete state for '{}'", key))?;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .context("Failed to prepare key listing")?;

        let rows = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .context("Failed to list keys")?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("Failed to read key row")?);
        }
        Ok(keys)
    }
}
