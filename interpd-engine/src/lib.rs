//! interpd-engine: automatic interpreter assignment
//!
//! Core decision pipeline (fairness, urgency, conflict, DR rules,
//! ranking), the assignment pool, safe commit, error recovery, and the
//! auto-approval load monitor, fronted by a thin HTTP API.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod commit;
pub mod conflict;
pub mod fairness;
pub mod monitor;
pub mod orchestrator;
pub mod policy;
pub mod pool;
pub mod ranking;
pub mod recovery;
pub mod scheduler;
pub mod scoring;

use monitor::{LoadThresholds, ModePreference};
use orchestrator::Engine;
use std::sync::Arc;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub thresholds: Arc<LoadThresholds>,
    pub preferences: Arc<Vec<ModePreference>>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            thresholds: Arc::new(LoadThresholds::default()),
            preferences: Arc::new(monitor::default_preferences()),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/assignment/:booking_id/run", post(api::assignment::run_assignment))
        .route("/pool/process-ready", post(api::pool::process_ready))
        .route("/pool/process-deadline", post(api::pool::process_deadline))
        .route("/pool/emergency", post(api::pool::process_emergency))
        .route("/policy", get(api::policy::get_policy).put(api::policy::update_policy))
        .route("/policy/dr/:mode", get(api::policy::get_dr_policy))
        .route("/load", get(api::load::get_load))
        .route("/load/switch", post(api::load::switch_mode))
        .route(
            "/load/override",
            post(api::load::set_override).delete(api::load::clear_override),
        )
        .route("/logs/recent", get(api::logs::recent_logs))
        .route("/health", get(api::health::health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
