use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Store Errors
///
/// Store failures inside the admission middleware never reach this type; each
/// component resolves them through its own failure policy. `Store` only covers
/// handler-level calls such as the health probe and startup.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Shared store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Request in progress: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full detail stays in the logs
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::Store(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "A backing service is temporarily unavailable. Please try again later.",
            ),
            AppError::Conflict(_) => (
                StatusCode::CONFLICT,
                "request_in_progress",
                "A request with this idempotency key is still being processed. Please retry.",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "An internal error occurred. Please contact support if the issue persists.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),
            AppError::SerializationError(e) => {
                let sanitized = sanitize_serde_error(e);
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(ErrorResponse {
                        error: "serialization_error".to_string(),
                        message: sanitized,
                    }),
                )
                    .into_response();
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();

    if msg.contains("missing field")
        && let Some(field) = backticked(&msg)
    {
        return format!("Missing required field: {field}");
    }

    if msg.contains("unknown field")
        && let Some(field) = backticked(&msg)
    {
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// First `` `quoted` `` fragment of a serde message.
fn backticked(msg: &str) -> Option<&str> {
    let (_, rest) = msg.split_once('`')?;
    let (field, _) = rest.split_once('`')?;
    Some(field)
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_store_error_is_503_without_detail() {
        let response =
            AppError::from(StoreError::Unavailable("10.0.0.7:6379 refused".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["error"], "store_unavailable");
        assert!(!body["message"].as_str().unwrap().contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_conflict_status() {
        let response = AppError::Conflict("abc".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "request_in_progress");
    }

    #[test]
    fn test_sanitize_missing_field() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Payload {
            account: String,
        }
        let err = serde_json::from_str::<Payload>("{}").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Missing required field: account");
    }

    #[test]
    fn test_sanitize_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{\"a\":").unwrap_err();
        assert_eq!(sanitize_serde_error(&err), "Malformed JSON in request body");
    }
}
