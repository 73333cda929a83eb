//! Violation audit log for the rate limiter.
//!
//! One list per composite limiter key, newest entry first, capped at
//! [`MAX_ENTRIES`]. Every append refreshes the list's [`RETENTION`], so the
//! trail of a key that keeps violating never expires while a quiet key's trail
//! ages out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{CallBudget, SharedStore, StoreResult};

/// Entries kept per key.
pub const MAX_ENTRIES: i64 = 100;

/// Lifetime of a key's list after its last append.
pub const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// One rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub ip: String,
    /// Request body prefix, lossily decoded as UTF-8.
    pub body: String,
    /// Whether `body` is only a prefix of what the client sent.
    pub body_truncated: bool,
}

/// Bounded, TTL'd violation lists in the shared store.
#[derive(Clone)]
pub struct ViolationAuditLog {
    store: Arc<dyn SharedStore>,
}

impl ViolationAuditLog {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    /// Prepend `entry`, trim to [`MAX_ENTRIES`], refresh [`RETENTION`].
    ///
    /// # Errors
    ///
    /// Returns the first failing store call. Earlier steps are not rolled back.
    pub async fn append(
        &self,
        key: &str,
        entry: &ViolationLogEntry,
        budget: &CallBudget,
    ) -> StoreResult<()> {
        // Serializing a struct of strings cannot fail
        let encoded = serde_json::to_vec(entry).unwrap_or_default();

        budget
            .run("lpush", self.store.list_push_front(key, &encoded))
            .await?;
        budget
            .run("ltrim", self.store.list_trim(key, 0, MAX_ENTRIES - 1))
            .await?;
        budget
            .run("pexpire", self.store.expire(key, RETENTION))
            .await?;
        Ok(())
    }

    /// Read a key's entries, newest first. Undecodable entries are skipped.
    pub async fn recent(&self, key: &str, budget: &CallBudget) -> StoreResult<Vec<ViolationLogEntry>> {
        let raw = budget
            .run("lrange", self.store.list_range(key, 0, MAX_ENTRIES - 1))
            .await?;

        Ok(raw
            .iter()
            .filter_map(|item| match serde_json::from_slice(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key, error = %e, "Skipping undecodable audit entry");
                    None
                }
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn entry(n: usize) -> ViolationLogEntry {
        ViolationLogEntry {
            timestamp: Utc::now(),
            method: "POST".to_string(),
            path: format!("/topups/{n}"),
            ip: "203.0.113.7".to_string(),
            body: String::new(),
            body_truncated: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_caps_and_orders() {
        let store = InMemoryStore::new();
        let log = ViolationAuditLog::new(Arc::new(store.clone()));
        let budget = CallBudget::new(Duration::from_secs(1));

        for n in 0..105 {
            log.append("ratelimitlog:t:k", &entry(n), &budget).await.unwrap();
        }

        let recent = log.recent("ratelimitlog:t:k", &budget).await.unwrap();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].path, "/topups/104");
        assert_eq!(recent[99].path, "/topups/5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_refreshes_retention() {
        let store = InMemoryStore::new();
        let log = ViolationAuditLog::new(Arc::new(store.clone()));
        let budget = CallBudget::new(Duration::from_secs(1));

        log.append("k", &entry(0), &budget).await.unwrap();
        tokio::time::advance(Duration::from_secs(23 * 60 * 60)).await;
        log.append("k", &entry(1), &budget).await.unwrap();

        assert_eq!(store.ttl("k"), Some(RETENTION));

        tokio::time::advance(RETENTION + Duration::from_secs(1)).await;
        assert!(log.recent("k", &budget).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_skips_garbage() {
        let store = InMemoryStore::new();
        store.list_push_front("k", b"not json").await.unwrap();
        let log = ViolationAuditLog::new(Arc::new(store.clone()));
        let budget = CallBudget::new(Duration::from_secs(1));
        log.append("k", &entry(1), &budget).await.unwrap();

        let recent = log.recent("k", &budget).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].path, "/topups/1");
    }
}
