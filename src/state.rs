//! Shared application state for Axum handlers.
//!
//! The shared store handle is created once at startup and injected here; the
//! admission middleware receive the same handle when the router is built.
//! Nothing else in the process holds store state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::Config;
use crate::store::SharedStore;

/// Shared application state for Axum handlers.
///
/// Cloned for each request; all fields are reference counted.
#[derive(Clone)]
pub struct AppState {
    /// Shared key-value store
    pub store: Arc<dyn SharedStore>,
    /// Application configuration
    pub config: Arc<Config>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Executed top-ups in this process
    topups: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(store: Arc<dyn SharedStore>, config: Config) -> Self {
        Self {
            store,
            config: Arc::new(config),
            started_at: Instant::now(),
            topups: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Claim the next top-up sequence number (starts at 1).
    pub fn next_topup_sequence(&self) -> u64 {
        self.topups.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Number of top-ups executed so far.
    pub fn topups_executed(&self) -> u64 {
        self.topups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_topup_sequence_is_shared_across_clones() {
        let state = AppState::new(Arc::new(InMemoryStore::new()), Config::default());
        let clone = state.clone();

        assert_eq!(state.next_topup_sequence(), 1);
        assert_eq!(clone.next_topup_sequence(), 2);
        assert_eq!(state.topups_executed(), 2);
    }
}
