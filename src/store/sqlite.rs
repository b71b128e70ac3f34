//! SQLite-backed [`StateStore`], shared by every process that opens the file.
//!
//! Expiry is stored as absolute epoch milliseconds so a TTL means the same
//! thing to every process. Read-modify-write operations run in a
//! `BEGIN IMMEDIATE` transaction: the write lock is taken before the read,
//! and a second process waits on the busy timeout instead of interleaving.

use super::{apply_field, apply_heartbeat, StateStore};
use crate::core::Priority;
use crate::error::Result;
use crate::{rlog_debug, rlog_trace};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

/// How long a connection waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS kv (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER
    );
    CREATE TABLE IF NOT EXISTS queue_members (
        queue TEXT NOT NULL,
        priority TEXT NOT NULL,
        member TEXT NOT NULL,
        score INTEGER NOT NULL,
        PRIMARY KEY (queue, priority, member)
    );
    CREATE INDEX IF NOT EXISTS idx_queue_members_score
        ON queue_members (queue, priority, score, member);
";

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?2)";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        rlog_debug!("State store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now_ms().saturating_add(i64::try_from(d.as_millis()).unwrap_or(i64::MAX)))
}

fn immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

/// The live value at `key`, read inside `tx`.
fn read_live(tx: &Transaction<'_>, key: &str) -> Result<Option<Value>> {
    let raw: Option<String> = tx
        .query_row(
            &format!("SELECT value FROM kv WHERE key = ?1 AND {}", LIVE),
            params![key, now_ms()],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

/// Replace the value at `key`, leaving `expires_at` alone.
fn rewrite(tx: &Transaction<'_>, key: &str, value: &Value) -> Result<()> {
    tx.execute(
        "UPDATE kv SET value = ?2 WHERE key = ?1",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn set_json(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, serde_json::to_string(&value)?, expiry(ttl)],
        )?;
        rlog_trace!("store set {} ttl={:?}", key, ttl);
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let value = read_live(&tx, key)?;
        tx.commit()?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = immediate(&mut conn)?;
        let live = tx.execute(
            &format!("DELETE FROM kv WHERE key = ?1 AND {}", LIVE),
            params![key, now_ms()],
        )?;
        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        tx.commit()?;
        Ok(live > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let conn = self.conn.lock().await;
        let now = now_ms();
        let expires_at: Option<Option<i64>> = conn
            .query_row(
                &format!("SELECT expires_at FROM kv WHERE key = ?1 AND {}", LIVE),
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires_at
            .flatten()
            .map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0))))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let now = now_ms();
        conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    async fn enqueue(&self, queue: &str, priority: Priority, member: &str, score: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO queue_members (queue, priority, member, score) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (queue, priority, member) DO UPDATE SET score = excluded.score",
            params![queue, priority.to_string(), member, score],
        )?;
        Ok(())
    }

    async fn peek(&self, queue: &str, priority: Priority, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT member FROM queue_members WHERE queue = ?1 AND priority = ?2
             ORDER BY score, member LIMIT ?3",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![queue, priority.to_string(), limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    async fn remove(&self, queue: &str, priority: Priority, member: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM queue_members WHERE queue = ?1 AND priority = ?2 AND member = ?3",
            params![queue, priority.to_string(), member],
        )?;
        Ok(removed > 0)
    }

    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = immediate(&mut conn)?;
        let Some(mut value) = read_live(&tx, key)? else {
            return Ok(false);
        };
        apply_heartbeat(&mut value, at)?;
        rewrite(&tx, key, &value)?;
        tx.commit()?;
        Ok(true)
    }

    async fn heartbeat_or_insert(
        &self,
        key: &str,
        at: DateTime<Utc>,
        default: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = immediate(&mut conn)?;
        let existed = match read_live(&tx, key)? {
            Some(mut value) => {
                apply_heartbeat(&mut value, at)?;
                rewrite(&tx, key, &value)?;
                true
            }
            None => {
                let mut value = default;
                apply_heartbeat(&mut value, at)?;
                tx.execute(
                    "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![key, serde_json::to_string(&value)?, expiry(ttl)],
                )?;
                false
            }
        };
        tx.commit()?;
        Ok(existed)
    }

    async fn set_field(&self, key: &str, field: &str, value: Value) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = immediate(&mut conn)?;
        let Some(mut record) = read_live(&tx, key)? else {
            return Ok(false);
        };
        apply_field(&mut record, field, value)?;
        rewrite(&tx, key, &record)?;
        tx.commit()?;
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
