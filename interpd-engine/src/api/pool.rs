//! Pool batch endpoints

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::recovery::{self, ProcessingOutcome, ProcessingResult};
use crate::AppState;

use super::ApiError;

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub processed: usize,
    pub assigned: usize,
    pub escalated: usize,
    pub failed: usize,
    pub purged: usize,
    pub results: Vec<ProcessingResult>,
}

impl From<Vec<ProcessingResult>> for BatchResponse {
    fn from(results: Vec<ProcessingResult>) -> Self {
        let mut r = BatchResponse {
            processed: results.len(),
            assigned: 0,
            escalated: 0,
            failed: 0,
            purged: 0,
            results,
        };
        for item in &r.results {
            match item.outcome {
                ProcessingOutcome::Assigned { .. } => r.assigned += 1,
                ProcessingOutcome::Escalated { .. } => r.escalated += 1,
                ProcessingOutcome::Failed { .. } => r.failed += 1,
                ProcessingOutcome::Purged { .. } | ProcessingOutcome::Repaired { .. } => {
                    r.purged += 1
                }
            }
        }
        r
    }
}

/// POST /pool/process-ready
pub async fn process_ready(State(state): State<AppState>) -> Result<Json<BatchResponse>, ApiError> {
    let results = recovery::process_ready_entries(&state.engine).await?;
    Ok(Json(results.into()))
}

/// POST /pool/process-deadline
pub async fn process_deadline(
    State(state): State<AppState>,
) -> Result<Json<BatchResponse>, ApiError> {
    let results = recovery::process_deadline_entries(&state.engine).await?;
    Ok(Json(results.into()))
}

/// POST /pool/emergency
///
/// No-op (empty batch) unless the urgency-tier trigger currently fires.
pub async fn process_emergency(
    State(state): State<AppState>,
) -> Result<Json<BatchResponse>, ApiError> {
    let results = recovery::process_emergency_override(&state.engine).await?;
    Ok(Json(results.into()))
}
