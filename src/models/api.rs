use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to top up an account balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopupRequest {
    /// Account to credit
    pub account: String,
    /// Amount in minor currency units
    pub amount_cents: u64,
}

/// Receipt for an accepted top-up.
///
/// Replays of the same `Idempotency-Key` return this exact receipt, so
/// `topup_id` and `sequence` identify the single execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupReceipt {
    /// Unique identifier of this execution
    pub topup_id: Uuid,
    /// Process-wide execution counter
    pub sequence: u64,
    pub account: String,
    pub amount_cents: u64,
    /// When the top-up was processed
    pub processed_at: DateTime<Utc>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy" or "degraded"
    pub status: String,
    /// Whether the shared store answered a PING
    pub store_reachable: bool,
    /// Service version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}
