//! Background tick loops
//!
//! Two periodic tasks: the pool tick (promote, process ready, process
//! deadline, emergency override when due) and the monitor tick (load
//! assessment, auto mode switch, degradation re-evaluation). Both stop
//! cleanly on cancellation.

use crate::monitor::{self, LoadThresholds, ModePreference};
use crate::orchestrator::Engine;
use crate::recovery::{self, ProcessingOutcome, ProcessingResult};
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Drives pool batches at a fixed cadence until cancelled.
pub async fn run_pool_ticker(engine: Engine, tick_secs: u64, cancel: CancellationToken) {
    let mut ticker = interval(Duration::from_secs(tick_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(tick_secs, "pool ticker started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("pool ticker stopping");
                return;
            }
            _ = ticker.tick() => {
                pool_tick(&engine).await;
            }
        }
    }
}

fn assigned_count(results: &[ProcessingResult]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r.outcome, ProcessingOutcome::Assigned { .. }))
        .count()
}

/// One pool pass. Batch errors are logged, never propagated; the next
/// tick starts from current state regardless.
async fn pool_tick(engine: &Engine) {
    match recovery::process_ready_entries(engine).await {
        Ok(results) => debug!(
            processed = results.len(),
            assigned = assigned_count(&results),
            "ready batch done"
        ),
        Err(e) => error!(error = %e, "ready batch failed"),
    }

    match recovery::process_deadline_entries(engine).await {
        Ok(results) => debug!(
            processed = results.len(),
            assigned = assigned_count(&results),
            "deadline batch done"
        ),
        Err(e) => error!(error = %e, "deadline batch failed"),
    }

    match engine.pool.emergency_due().await {
        Ok(true) => {
            if let Err(e) = recovery::process_emergency_override(engine).await {
                error!(error = %e, "emergency batch failed");
            }
        }
        Ok(false) => {}
        Err(e) => error!(error = %e, "emergency check failed"),
    }
}

/// Drives the load monitor at a fixed cadence until cancelled.
pub async fn run_monitor_ticker(
    engine: Engine,
    tick_secs: u64,
    thresholds: LoadThresholds,
    preferences: Vec<ModePreference>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(Duration::from_secs(tick_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(tick_secs, "load monitor started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("load monitor stopping");
                return;
            }
            _ = ticker.tick() => {
                match monitor::monitor_tick(&engine, &thresholds, &preferences).await {
                    Ok(a) => debug!(
                        level = ?a.load_level,
                        pool = a.pool_size,
                        recommended = a.recommended_mode.as_str(),
                        confidence = a.confidence,
                        "load assessed"
                    ),
                    Err(e) => error!(error = %e, "monitor tick failed"),
                }

                let report = recovery::evaluate_degradation(&engine).await;
                debug!(level = report.recommended_level.as_str(), "degradation evaluated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitConfig;
    use crate::orchestrator::Engine;
    use crate::policy::PolicyStore;
    use crate::pool::Pool;
    use crate::recovery::DegradationState;
    use chrono::NaiveDateTime;
    use interpd_common::clock::ManualClock;
    use interpd_common::db::init::init_memory_database;
    use interpd_common::events::EventBus;
    use std::sync::Arc;

    async fn engine() -> Engine {
        let db = init_memory_database().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            NaiveDateTime::parse_from_str("2025-03-10 08:00:00", "%Y-%m-%d %H:%M:%S")
                .unwrap()
                .and_utc(),
        ));
        Engine::new(
            db.clone(),
            clock.clone(),
            PolicyStore::new(db.clone(), clock.clone()),
            Pool::new(db, clock, 10),
            EventBus::default(),
            CommitConfig::default(),
            DegradationState::default(),
        )
    }

    #[tokio::test]
    async fn pool_ticker_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_pool_ticker(engine().await, 3600, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ticker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn monitor_ticker_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_monitor_ticker(
            engine().await,
            3600,
            LoadThresholds::default(),
            monitor::default_preferences(),
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ticker did not stop")
            .unwrap();
    }
}
