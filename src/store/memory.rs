//! In-process [`StateStore`] backend.
//!
//! All state sits behind one `tokio::sync::Mutex`; every operation, including
//! the heartbeat read-modify-write, runs entirely under that lock. Expired
//! keys are dropped lazily on access.

use super::{apply_field, apply_heartbeat, StateStore};
use crate::core::Priority;
use crate::error::Result;
use crate::rlog_trace;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t > now).unwrap_or(true)
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Entry>,
    /// `(queue, priority)` → `(score, member)` ordered ascending.
    queues: HashMap<(String, Priority), BTreeSet<(i64, String)>>,
}

impl Inner {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut Entry> {
        let expired = matches!(self.values.get(key), Some(e) if !e.is_live(now));
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get_mut(key)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set_json(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let expires_at = ttl.map(|d| Instant::now() + d);
        inner.values.insert(key.to_string(), Entry { value, expires_at });
        rlog_trace!("store set {} ttl={:?}", key, ttl);
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live(key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let was_live = inner.live(key, Instant::now()).is_some();
        inner.values.remove(key);
        Ok(was_live)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        Ok(inner
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(now)))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.values.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = inner
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn enqueue(&self, queue: &str, priority: Priority, member: &str, score: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let bucket = inner
            .queues
            .entry((queue.to_string(), priority))
            .or_default();
        bucket.retain(|(_, m)| m != member);
        bucket.insert((score, member.to_string()));
        Ok(())
    }

    async fn peek(&self, queue: &str, priority: Priority, limit: usize) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .queues
            .get(&(queue.to_string(), priority))
            .map(|bucket| bucket.iter().take(limit).map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn remove(&self, queue: &str, priority: Priority, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(bucket) = inner.queues.get_mut(&(queue.to_string(), priority)) else {
            return Ok(false);
        };
        let before = bucket.len();
        bucket.retain(|(_, m)| m != member);
        Ok(bucket.len() != before)
    }

    async fn update_heartbeat(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.live(key, Instant::now()) {
            Some(entry) => {
                // expires_at is untouched, so the existing TTL carries over.
                apply_heartbeat(&mut entry.value, at)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn heartbeat_or_insert(
        &self,
        key: &str,
        at: DateTime<Utc>,
        default: Value,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some(entry) = inner.live(key, now) {
            apply_heartbeat(&mut entry.value, at)?;
            return Ok(true);
        }
        let mut value = default;
        apply_heartbeat(&mut value, at)?;
        inner.values.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| now + d),
            },
        );
        rlog_trace!("store heartbeat created {}", key);
        Ok(false)
    }

    async fn set_field(&self, key: &str, field: &str, value: Value) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.live(key, Instant::now()) {
            Some(entry) => {
                apply_field(&mut entry.value, field, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
