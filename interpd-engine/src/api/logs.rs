//! Audit log query endpoint

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use interpd_common::db::models::AssignmentLogRow;

use crate::AppState;

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Max rows returned, newest first. Capped at 500.
    pub limit: Option<i64>,
    /// Restrict to one event type tag.
    pub event_type: Option<String>,
}

/// GET /logs/recent
pub async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<AssignmentLogRow>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let rows: Vec<AssignmentLogRow> = match query.event_type {
        Some(event_type) => {
            sqlx::query_as(
                "SELECT id, event_type, booking_id, detail, created_at
                 FROM assignment_logs
                 WHERE event_type = ?
                 ORDER BY id DESC LIMIT ?",
            )
            .bind(event_type)
            .bind(limit)
            .fetch_all(&state.engine.db)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT id, event_type, booking_id, detail, created_at
                 FROM assignment_logs
                 ORDER BY id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&state.engine.db)
            .await?
        }
    };

    Ok(Json(rows))
}
