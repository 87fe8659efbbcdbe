//! SQLite adapter for KeyValueStore
//!
//! Schema:
//!
//! ```sql
//! CREATE TABLE kv (
//!     key        TEXT PRIMARY KEY,
//!     value      BLOB NOT NULL,
//!     expires_at INTEGER          -- unix millis, NULL = never
//! );
//! ```
//!
//! All statements run on one connection behind a mutex, driven from
//! `spawn_blocking` so the async runtime never blocks on disk I/O.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::{validate_key, KeyValueStore};
use crate::{Result, StorageError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      BLOB NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv (expires_at);
";

/// File-backed key-value store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Private in-memory database (tests)
    pub fn new_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, i64) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard, now_millis())
        })
        .await
        .map_err(|e| StorageError::unavailable(format!("sqlite worker failed: {}", e)))?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

fn live_value(conn: &Connection, key: &str, now: i64) -> Result<Option<Vec<u8>>> {
    let value = conn
        .query_row(
            "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![key, now],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(value)
}

fn upsert(conn: &Connection, key: &str, value: &[u8], expires_at: Option<i64>) -> Result<()> {
    conn.execute(
        "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        params![key, value, expires_at],
    )?;
    Ok(())
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn, now| live_value(conn, &key, now))
            .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn, now| upsert(conn, &key, &value, expiry_millis(now, ttl)))
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn, now| {
            let tx = conn.transaction()?;
            let was_live = live_value(&tx, &key, now)?.is_some();
            tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            tx.commit()?;
            Ok(was_live)
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn, now| {
            let changed = conn.execute(
                "UPDATE kv SET expires_at = ?2
                 WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?3)",
                params![key, expiry_millis(now, Some(ttl)), now],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        let expected = expected.map(<[u8]>::to_vec);
        self.with_conn(move |conn, now| {
            let tx = conn.transaction()?;
            let current = live_value(&tx, &key, now)?;
            if current != expected {
                return Ok(false);
            }
            match new {
                Some(value) => upsert(&tx, &key, &value, expiry_millis(now, ttl))?,
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn, now| {
            // substr comparison avoids LIKE wildcard escaping for ':' and '_' in keys
            let mut stmt = conn.prepare(
                "SELECT key FROM kv
                 WHERE substr(key, 1, length(?1)) = ?1
                   AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![prefix, now], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.with_conn(|conn, now| {
            let removed = conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )?;
            Ok(removed)
        })
        .await
    }
}
