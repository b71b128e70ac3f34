//! Shared state store contract.
//!
//! Several processes (the gateway, worker heartbeat reporters, the health
//! monitor) read and write the same keys, so the store is the one place
//! where cross-process consistency matters. Besides plain JSON values with
//! TTLs and per-priority queues, it exposes three atomic read-modify-write
//! operations: [`StateStore::update_heartbeat`],
//! [`StateStore::heartbeat_or_insert`] and [`StateStore::set_field`].
//! Callers never read a record and write it back themselves.
//!
//! [`MemoryStore`] serves a single process; [`SqliteStore`] is the durable
//! backend every process on a host can open.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::{StoreBackend, StoreSettings};
use crate::core::Priority;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Field set by the heartbeat primitive, milliseconds since the epoch.
pub const LAST_HEARTBEAT_FIELD: &str = "lastHeartbeat";
pub const STATUS_FIELD: &str = "status";

/// Key under which an agent's record lives.
pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

/// The fixed update applied by [`StateStore::update_heartbeat`].
///
/// Sets `lastHeartbeat` and revives an `offline` agent to `idle`. Every other
/// field, `status` included when it is not `offline`, is left untouched.
pub fn apply_heartbeat(value: &mut Value, at: DateTime<Utc>) -> Result<()> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| Error::Store("heartbeat target is not a JSON object".to_string()))?;
    obj.insert(
        LAST_HEARTBEAT_FIELD.to_string(),
        Value::from(at.timestamp_millis()),
    );
    if obj.get(STATUS_FIELD).and_then(Value::as_str) == Some("offline") {
        obj.insert(STATUS_FIELD.to_string(), Value::from("idle"));
    }
    Ok(())
}

/// Open the backend named in `settings`.
pub fn open(settings: &StoreSettings) -> Result<Arc<dyn StateStore>> {
    match settings.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(settings.db_path())?)),
    }
}

/// Set one top-level field of a JSON object, leaving the rest alone.
pub fn apply_field(value: &mut Value, field: &str, new: Value) -> Result<()> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| Error::Store(format!("cannot set {}: record is not a JSON object", field)))?;
    obj.insert(field.to_string(), new);
    Ok(())
}

/// Durable key/value storage shared between processes.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store `value` at `key`, replacing any TTL with `ttl`.
    async fn set_json(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    async fn get_json(&self, key: &str) -> Result<Option<Value>>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime of `key`; `None` for missing keys and keys without TTL.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Live keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Insert `member` into the `priority` bucket of `queue` with a sortable score.
    /// Re-inserting an existing member updates its score.
    async fn enqueue(&self, queue: &str, priority: Priority, member: &str, score: i64) -> Result<()>;

    /// The `limit` lowest-scored members of one bucket.
    async fn peek(&self, queue: &str, priority: Priority, limit: usize) -> Result<Vec<String>>;

    /// Remove `member` from a bucket. Returns whether it was present.
    async fn remove(&self, queue: &str, priority: Priority, member: &str) -> Result<bool>;

    /// Atomically apply [`apply_heartbeat`] to the JSON at `key`, keeping its TTL.
    ///
    /// No other writer can observe or interleave with the read-modify-write.
    /// Returns `false` when the key does not exist.
    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Like [`StateStore::update_heartbeat`], but a missing key is created
    /// from `default` (with the heartbeat applied) and `ttl`, in the same
    /// atomic step. Returns `true` when an existing record was updated.
    async fn heartbeat_or_insert(
        &self,
        key: &str,
        at: DateTime<Utc>,
        default: Value,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Atomically set one field of the JSON object at `key`, keeping its TTL.
    /// Returns `false` when the key does not exist.
    async fn set_field(&self, key: &str, field: &str, value: Value) -> Result<bool>;

    /// Liveness check used by the health monitor.
    async fn ping(&self) -> Result<()>;

    /// Up to `limit` members across all buckets, critical first, lowest score first within a bucket.
    async fn peek_by_priority(&self, queue: &str, limit: usize) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            if out.len() >= limit {
                break;
            }
            out.extend(self.peek(queue, priority, limit - out.len()).await?);
        }
        Ok(out)
    }
}
