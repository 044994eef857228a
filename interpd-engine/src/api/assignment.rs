//! Assignment run endpoint

use axum::extract::{Path, State};
use axum::Json;
use interpd_common::Error;
use uuid::Uuid;

use crate::orchestrator::RunResult;
use crate::AppState;

use super::ApiError;

/// POST /assignment/:booking_id/run
///
/// Runs the full decision for one booking. Both terminal outcomes are
/// 200; the body carries `status` of `assigned` or `escalated`.
pub async fn run_assignment(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
) -> Result<Json<RunResult>, ApiError> {
    let booking_id: Uuid = booking_id
        .parse()
        .map_err(|_| Error::Validation(format!("invalid booking id: {booking_id}")))?;

    let result = state.engine.run_assignment(booking_id).await?;
    Ok(Json(result))
}
