//! HTTP API handlers
//!
//! Thin boundary over the engine: handlers parse, delegate, and map
//! errors to status codes. Business outcomes (assigned vs escalated)
//! are both 200 with a tagged body; only malformed requests and
//! infrastructure failures become error statuses.

pub mod assignment;
pub mod health;
pub mod load;
pub mod logs;
pub mod policy;
pub mod pool;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use interpd_common::Error;
use serde_json::json;

/// Error boundary for all handlers.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError(Error::Database(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Conflict(_) | Error::Concurrency(_) => StatusCode::CONFLICT,
            Error::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
