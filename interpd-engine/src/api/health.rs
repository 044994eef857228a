//! Health endpoint

use axum::extract::State;
use axum::Json;

use crate::recovery::{self, HealthReport};
use crate::AppState;

/// GET /health
///
/// Always 200 with the current health report; an unreachable database
/// is reported in the body, not as a transport failure.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthReport> {
    Json(recovery::health_check(&state.engine).await)
}
