//! Persistence for encoded catalogs.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Error, Result};

/// Key-value persistence holding one opaque encoded catalog per key.
pub trait CatalogStore: Send + Sync {
    /// Read the value stored under `key`.
    fn load(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`.
    fn save(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed catalog store.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at `db_path`.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| Error::Storage(format!("Failed to open catalog database: {e}")))?;

        Self::init_schema(&conn)?;
        debug!(path = %db_path.as_ref().display(), "opened catalog store");

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {e}")))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Initialize database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS catalogs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {e}")))?;

        Ok(())
    }

    /// Keys currently stored.
    pub fn keys(&self) -> Result<Vec<String>> {
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT key FROM catalogs ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

impl CatalogStore for SqliteStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock();
        let value = db
            .query_row(
                "SELECT value FROM catalogs WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Failed to read catalog {key}: {e}")))?;
        Ok(value)
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let db = self.db.lock();
        db.execute(
            "INSERT INTO catalogs (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )
        .map_err(|e| Error::Storage(format!("Failed to write catalog {key}: {e}")))?;
        Ok(())
    }
}
