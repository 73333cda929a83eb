//! Account top-up endpoint, the side-effecting operation the admission
//! middleware protect.
//!
//! # Endpoints
//!
//! - `POST /topups` - Credit an account; send an `Idempotency-Key` to make
//!   retries safe

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{TopupReceipt, TopupRequest};
use crate::state::AppState;
use crate::validation::{validate_account, validate_amount};

/// Execute a top-up and return its receipt.
///
/// # Request Body
///
/// ```json
/// { "account": "acct-1", "amount_cents": 1500 }
/// ```
///
/// Every execution claims a new sequence number, so a replayed receipt is
/// recognisable by its unchanged `topup_id` and `sequence`.
#[instrument(skip(state, body))]
pub async fn create_topup(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<TopupReceipt>)> {
    let request: TopupRequest = serde_json::from_slice(&body)?;
    validate_account(&request.account)?;
    validate_amount(request.amount_cents)?;

    let receipt = TopupReceipt {
        topup_id: Uuid::new_v4(),
        sequence: state.next_topup_sequence(),
        account: request.account,
        amount_cents: request.amount_cents,
        processed_at: Utc::now(),
    };

    info!(
        topup_id = %receipt.topup_id,
        sequence = receipt.sequence,
        account = %receipt.account,
        amount_cents = receipt.amount_cents,
        "Top-up executed"
    );

    Ok((StatusCode::CREATED, Json(receipt)))
}
