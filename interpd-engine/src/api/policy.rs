//! Policy read/update endpoints

use axum::extract::{Path, State};
use axum::Json;
use interpd_common::Error;

use crate::policy::{AssignmentPolicy, DrPolicy, Mode, PolicyPatch};
use crate::AppState;

use super::ApiError;

/// GET /policy
///
/// Returns the effective policy: for named modes the locked parameter
/// set, for CUSTOM the stored values.
pub async fn get_policy(
    State(state): State<AppState>,
) -> Result<Json<AssignmentPolicy>, ApiError> {
    let policy = state.engine.policy.load().await?;
    Ok(Json(policy))
}

/// PUT /policy
///
/// Applies a partial update as a new version. Rejected with 422 when
/// validation fails; parameter fields are overridden by the mode table
/// for locked modes.
pub async fn update_policy(
    State(state): State<AppState>,
    Json(patch): Json<PolicyPatch>,
) -> Result<Json<AssignmentPolicy>, ApiError> {
    let policy = state.engine.policy.update(patch).await?;
    Ok(Json(policy))
}

/// GET /policy/dr/:mode
///
/// The consecutive-DR rule that would be in force under a given mode.
pub async fn get_dr_policy(
    State(state): State<AppState>,
    Path(mode): Path<String>,
) -> Result<Json<DrPolicy>, ApiError> {
    let mode: Mode = mode
        .parse()
        .map_err(|_: Error| Error::Validation(format!("unknown mode: {mode}")))?;
    let policy = state.engine.policy.dr_policy_for(mode).await?;
    Ok(Json(policy))
}
