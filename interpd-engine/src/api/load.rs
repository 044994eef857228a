//! Load monitor endpoints

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::monitor::{
    self, active_override, AutoSwitchResult, SystemLoadAssessment,
};
use crate::policy::Mode;
use crate::AppState;

use super::ApiError;

/// GET /load
pub async fn get_load(
    State(state): State<AppState>,
) -> Result<Json<SystemLoadAssessment>, ApiError> {
    let assessment =
        monitor::evaluate_system_load(&state.engine, &state.thresholds, &state.preferences)
            .await?;
    Ok(Json(assessment))
}

#[derive(Debug, Deserialize)]
pub struct SwitchRequest {
    /// Target mode; when omitted the current recommendation is used.
    pub mode: Option<Mode>,
}

/// POST /load/switch
///
/// Attempts a mode switch under the auto-switch rules (confidence bar,
/// manual override). The attempt is recorded either way.
pub async fn switch_mode(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<AutoSwitchResult>, ApiError> {
    let assessment =
        monitor::evaluate_system_load(&state.engine, &state.thresholds, &state.preferences)
            .await?;
    let target = request.mode.unwrap_or(assessment.recommended_mode);
    let result = monitor::execute_auto_switch(&state.engine, target, &assessment).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub mode: Mode,
    pub set_by: String,
    /// Hours until the override lapses; defaults to 24.
    pub ttl_hours: Option<i64>,
}

/// POST /load/override
///
/// Sets a manual mode override. The auto-switcher defers until expiry;
/// the mode itself changes immediately.
pub async fn set_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ttl_hours = request.ttl_hours.unwrap_or(24);
    if ttl_hours <= 0 {
        return Err(interpd_common::Error::Validation(format!(
            "ttl_hours must be positive (got {ttl_hours})"
        ))
        .into());
    }

    monitor::set_override(&state.engine, request.mode, &request.set_by, ttl_hours).await?;
    state
        .engine
        .policy
        .update(crate::policy::PolicyPatch {
            mode: Some(request.mode),
            ..Default::default()
        })
        .await?;

    Ok(Json(serde_json::json!({
        "mode": request.mode.as_str(),
        "ttl_hours": ttl_hours,
    })))
}

/// DELETE /load/override
pub async fn clear_override(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let was_active = active_override(&state.engine).await?.is_some();
    monitor::clear_override(&state.engine).await?;
    Ok(Json(serde_json::json!({ "cleared": was_active })))
}
