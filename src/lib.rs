//! # Gateway Admission
//!
//! Admission control middleware for Axum services that coordinate through a
//! shared key-value store (Redis in production):
//!
//! - **Idempotency gate**: a repeated `Idempotency-Key` replays the stored
//!   response (`X-Idempotent-Cache: HIT`) and the handler runs at most once
//!   per key, even for concurrent duplicates
//! - **Keyed rate limiter**: fixed-window quota per composite key with a
//!   bounded, TTL'd violation audit log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Timeout → Request ID → Trace                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IdempotencyLayer → KeyedRateLimitLayer                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, topups)                                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SharedStore (RedisStore / InMemoryStore)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gateway_admission::{AppState, Config, RedisStore, build_router};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env()?;
//! let store = RedisStore::connect(&config.redis()).await?;
//!
//! let state = AppState::new(Arc::new(store), config);
//! let app = build_router(state)?;
//!
//! // Serve with `into_make_service_with_connect_info::<SocketAddr>()`...
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure Policies
//!
//! ```bash
//! IDEMPOTENCY_FAILURE_POLICY=open RATE_LIMIT_FAILURE_POLICY=closed cargo run
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod record;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use middleware::{FailurePolicy, IdempotencyLayer, KeyedRateLimitLayer};
pub use routes::build_router;
pub use state::AppState;
pub use store::{InMemoryStore, RedisStore, SharedStore, StoreError};
