//! In-process [`SharedStore`] with Redis-equivalent semantics.
//!
//! Keys expire lazily against `tokio::time::Instant`, so tests running on a
//! paused Tokio clock can move through TTLs and rate-limit windows with
//! `tokio::time::advance` instead of sleeping.
//!
//! The store also supports failure injection (see [`InMemoryStore::set_available`]
//! and [`InMemoryStore::set_latency`]) for exercising fail-open and fail-closed
//! paths without a real outage.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{SharedStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Bytes(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Shared in-memory store. Clones share the same keyspace.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while `false`, every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every operation by `latency` before it touches the keyspace.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Remaining TTL of a live key, `None` if the key is absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Whether a live key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.get(key).is_some_and(|e| e.is_live(now)))
            .unwrap_or(false)
    }

    async fn enter(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        let latency = self.latency.lock().ok().and_then(|guard| *guard);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))?;

        let now = Instant::now();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(entries)
    }
}

/// Resolve Redis-style inclusive `start..=stop` indices against a list length.
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        return None;
    }

    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// `INCR` on a string value, creating it at 0 when absent.
fn bump(entries: &mut HashMap<String, Entry>, key: &str) -> StoreResult<i64> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Bytes(b"0".to_vec()),
        expires_at: None,
    });

    let Value::Bytes(raw) = &mut entry.value else {
        return Err(StoreError::Unavailable(format!(
            "WRONGTYPE {key} holds a list"
        )));
    };

    let current: i64 = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::Unavailable(format!("value at {key} is not an integer")))?;
    let next = current
        .checked_add(1)
        .ok_or_else(|| StoreError::Unavailable(format!("increment of {key} would overflow")))?;

    *raw = next.to_string().into_bytes();
    Ok(next)
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let entries = self.enter().await?;
        match entries.get(key).map(|e| &e.value) {
            Some(Value::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Value::List(_)) => Err(StoreError::Unavailable(format!(
                "WRONGTYPE {key} holds a list"
            ))),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let mut entries = self.enter().await?;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.enter().await?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value.to_vec()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete_if_equal(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut entries = self.enter().await?;
        let matches = matches!(
            entries.get(key).map(|e| &e.value),
            Some(Value::Bytes(current)) if current.as_slice() == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut entries = self.enter().await?;
        bump(&mut entries, key)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.enter().await?;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn increment_in_window(&self, key: &str, window: Duration) -> StoreResult<i64> {
        let mut entries = self.enter().await?;
        let count = bump(&mut entries, key)?;
        if let Some(entry) = entries.get_mut(key)
            && entry.expires_at.is_none()
        {
            entry.expires_at = Some(Instant::now() + window);
        }
        Ok(count)
    }

    async fn list_push_front(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut entries = self.enter().await?;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });

        match &mut entry.value {
            Value::List(list) => {
                list.push_front(value.to_vec());
                Ok(())
            }
            Value::Bytes(_) => Err(StoreError::Unavailable(format!(
                "WRONGTYPE {key} does not hold a list"
            ))),
        }
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let mut entries = self.enter().await?;
        let Some(entry) = entries.get_mut(key) else {
            return Ok(());
        };
        let Value::List(list) = &mut entry.value else {
            return Err(StoreError::Unavailable(format!(
                "WRONGTYPE {key} does not hold a list"
            )));
        };

        match normalize_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.truncate(to + 1);
                list.drain(..from);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        let entries = self.enter().await?;
        let Some(entry) = entries.get(key) else {
            return Ok(Vec::new());
        };
        let Value::List(list) = &entry.value else {
            return Err(StoreError::Unavailable(format!(
                "WRONGTYPE {key} does not hold a list"
            )));
        };

        Ok(match normalize_range(list.len(), start, stop) {
            Some((from, to)) => list.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        self.enter().await.map(|_| ())
    }
}
