//! Error recovery and graceful degradation
//!
//! Batch pool processing wraps every entry in corruption detection, then
//! the standard retry path, then an immediate-assignment fallback, and
//! finally manual escalation. Conflict, concurrency, and corruption never
//! abort the batch; only infrastructure failures abort the current entry.
//!
//! The degradation ladder progressively disables audit logging under load
//! or failure while preserving the assignment decision path. In
//! `Emergency`, batch processing collapses to the minimal
//! escalate-for-manual-handling fallback.

use crate::orchestrator::{Engine, RunResult};
use crate::policy::Mode;
use crate::pool::MAX_POOL_ATTEMPTS;
use chrono::{DateTime, Duration, Utc};
use interpd_common::db::models::{Booking, PoolEntry, PoolStatus};
use interpd_common::events::EngineEvent;
use interpd_common::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Graceful degradation ladder, best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Normal,
    ReducedLogging,
    MinimalLogging,
    NoLogging,
    Emergency,
}

impl DegradationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Normal => "normal",
            DegradationLevel::ReducedLogging => "reduced_logging",
            DegradationLevel::MinimalLogging => "minimal_logging",
            DegradationLevel::NoLogging => "no_logging",
            DegradationLevel::Emergency => "emergency",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => DegradationLevel::Normal,
            1 => DegradationLevel::ReducedLogging,
            2 => DegradationLevel::MinimalLogging,
            3 => DegradationLevel::NoLogging,
            _ => DegradationLevel::Emergency,
        }
    }
}

/// Shared current degradation level.
///
/// Read on every audit emission, so it is a single atomic rather than a
/// lock.
#[derive(Debug, Clone, Default)]
pub struct DegradationState {
    level: Arc<AtomicU8>,
}

impl DegradationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> DegradationLevel {
        DegradationLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn set(&self, level: DegradationLevel) -> DegradationLevel {
        let previous = self.level.swap(level as u8, Ordering::Relaxed);
        DegradationLevel::from_u8(previous)
    }

    /// Database audit rows are the first thing to go.
    pub fn allow_db_logging(&self) -> bool {
        self.current() == DegradationLevel::Normal
    }

    /// The in-process bus survives one rung longer.
    pub fn allow_bus(&self) -> bool {
        self.current() <= DegradationLevel::ReducedLogging
    }

    pub fn is_emergency(&self) -> bool {
        self.current() == DegradationLevel::Emergency
    }
}

/// What corruption detection decided about one entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionVerdict {
    Clean,
    /// Inconsistent but repairable in place
    Repair(String),
    /// Critically corrupted; remove unconditionally
    Purge(String),
}

/// Detect pool/booking inconsistencies for one entry.
///
/// Checks: booking missing, already-assigned-but-still-pooled, cancelled,
/// deadline after the booking start, start already in the past, and
/// attempt overflow.
pub fn detect_corruption(
    entry: &PoolEntry,
    booking: Option<&Booking>,
    now: DateTime<Utc>,
) -> CorruptionVerdict {
    let Some(booking) = booking else {
        return CorruptionVerdict::Purge("booking no longer exists".to_string());
    };

    if booking.interpreter_id.is_some() {
        return CorruptionVerdict::Purge("booking already assigned but still pooled".to_string());
    }
    if booking.status == "cancelled" {
        return CorruptionVerdict::Purge("booking cancelled".to_string());
    }
    if booking.start_time <= now {
        return CorruptionVerdict::Purge("booking start already passed".to_string());
    }
    if entry.deadline_at >= booking.start_time {
        return CorruptionVerdict::Repair("deadline not before booking start".to_string());
    }
    if entry.attempts > MAX_POOL_ATTEMPTS {
        return CorruptionVerdict::Repair("attempt counter overflow".to_string());
    }

    CorruptionVerdict::Clean
}

/// Outcome of processing one pool entry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Assigned { interpreter_id: Uuid },
    Escalated { reason: String },
    Failed { reason: String },
    Purged { reason: String },
    Repaired { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResult {
    pub booking_id: Uuid,
    pub outcome: ProcessingOutcome,
}

/// Process all `ready` entries (the threshold path). Runs housekeeping
/// first: cancelled sweep, stuck recovery, due promotion.
pub async fn process_ready_entries(engine: &Engine) -> Result<Vec<ProcessingResult>> {
    engine.pool.sweep_cancelled().await?;
    engine.pool.recover_stuck().await?;
    engine.pool.promote_due().await?;

    let entries = engine.pool.ready_entries().await?;
    process_batch(engine, entries, "ready").await
}

/// Process entries whose deadline has arrived, regardless of status.
pub async fn process_deadline_entries(engine: &Engine) -> Result<Vec<ProcessingResult>> {
    engine.pool.sweep_cancelled().await?;
    engine.pool.recover_stuck().await?;

    let entries = engine.pool.deadline_entries().await?;
    process_batch(engine, entries, "deadline").await
}

/// Emergency batch: runs the deadline path only when the urgency-tier
/// trigger fires.
pub async fn process_emergency_override(engine: &Engine) -> Result<Vec<ProcessingResult>> {
    if !engine.pool.emergency_due().await? {
        return Ok(Vec::new());
    }
    warn!("emergency pool override triggered");
    process_deadline_entries(engine).await
}

async fn process_batch(
    engine: &Engine,
    entries: Vec<PoolEntry>,
    kind: &str,
) -> Result<Vec<ProcessingResult>> {
    let started = std::time::Instant::now();
    let mut results = Vec::with_capacity(entries.len());
    let (mut assigned, mut escalated, mut failed, mut purged) = (0u32, 0u32, 0u32, 0u32);

    for entry in entries {
        let result = if engine.degradation.is_emergency() {
            emergency_fallback(engine, &entry).await
        } else {
            process_entry(engine, &entry).await
        };

        match result {
            Ok(result) => {
                match &result.outcome {
                    ProcessingOutcome::Assigned { .. } => assigned += 1,
                    ProcessingOutcome::Escalated { .. } => escalated += 1,
                    ProcessingOutcome::Failed { .. } => failed += 1,
                    ProcessingOutcome::Purged { .. } | ProcessingOutcome::Repaired { .. } => {
                        purged += 1
                    }
                }
                results.push(result);
            }
            // Infrastructure failure: abort this entry, keep the batch
            Err(e) => {
                error!(booking_id = %entry.booking_id, error = %e, "entry processing aborted");
                failed += 1;
                results.push(ProcessingResult {
                    booking_id: entry.booking_id,
                    outcome: ProcessingOutcome::Failed {
                        reason: e.to_string(),
                    },
                });
            }
        }
    }

    let processed = results.len() as u32;
    engine
        .audit(EngineEvent::PoolBatchCompleted {
            kind: kind.to_string(),
            processed,
            assigned,
            escalated,
            failed,
            purged,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: engine.clock.now(),
        })
        .await;

    info!(kind, processed, assigned, escalated, failed, purged, "pool batch completed");
    Ok(results)
}

/// Full per-entry ladder: corruption check, claimed run, retry
/// bookkeeping, immediate-assignment fallback, manual escalation.
async fn process_entry(engine: &Engine, entry: &PoolEntry) -> Result<ProcessingResult> {
    let booking = load_booking(engine, entry.booking_id).await?;
    let now = engine.clock.now();

    match detect_corruption(entry, booking.as_ref(), now) {
        CorruptionVerdict::Purge(reason) => {
            warn!(booking_id = %entry.booking_id, reason, "purging corrupted pool entry");
            engine.pool.remove(entry.booking_id).await?;
            return Ok(ProcessingResult {
                booking_id: entry.booking_id,
                outcome: ProcessingOutcome::Purged { reason },
            });
        }
        CorruptionVerdict::Repair(reason) => {
            warn!(booking_id = %entry.booking_id, reason, "repairing pool entry");
            repair_entry(engine, entry, booking.as_ref(), &reason).await?;
            return Ok(ProcessingResult {
                booking_id: entry.booking_id,
                outcome: ProcessingOutcome::Repaired { reason },
            });
        }
        CorruptionVerdict::Clean => {}
    }

    // Another worker may have claimed the entry between the SELECT and here
    if !engine.pool.claim_for_processing(entry.booking_id).await? {
        return Ok(ProcessingResult {
            booking_id: entry.booking_id,
            outcome: ProcessingOutcome::Failed {
                reason: "claimed by another worker".to_string(),
            },
        });
    }

    match engine.run_assignment_forced(entry.booking_id).await {
        Ok(RunResult::Assigned { interpreter_id }) => Ok(ProcessingResult {
            booking_id: entry.booking_id,
            outcome: ProcessingOutcome::Assigned { interpreter_id },
        }),
        Ok(RunResult::Escalated { reason }) => {
            engine.pool.remove(entry.booking_id).await?;
            Ok(ProcessingResult {
                booking_id: entry.booking_id,
                outcome: ProcessingOutcome::Escalated { reason },
            })
        }
        Err(e) if e.is_transient() => {
            let status = engine.pool.record_failure(entry.booking_id).await?;
            if status == PoolStatus::Failed {
                immediate_fallback(engine, entry.booking_id).await
            } else {
                Ok(ProcessingResult {
                    booking_id: entry.booking_id,
                    outcome: ProcessingOutcome::Failed {
                        reason: format!("transient failure, will retry: {e}"),
                    },
                })
            }
        }
        Err(e) => Err(e),
    }
}

/// Retries exhausted: clear pool bookkeeping and reattempt once outside
/// the pool context; if that also fails, escalate to manual assignment.
async fn immediate_fallback(engine: &Engine, booking_id: Uuid) -> Result<ProcessingResult> {
    warn!(booking_id = %booking_id, "pool retries exhausted, attempting immediate assignment");
    engine.pool.remove(booking_id).await?;

    match engine.run_assignment_forced(booking_id).await {
        Ok(RunResult::Assigned { interpreter_id }) => Ok(ProcessingResult {
            booking_id,
            outcome: ProcessingOutcome::Assigned { interpreter_id },
        }),
        Ok(RunResult::Escalated { reason }) => Ok(ProcessingResult {
            booking_id,
            outcome: ProcessingOutcome::Escalated { reason },
        }),
        Err(e) => {
            error!(booking_id = %booking_id, error = %e, "immediate fallback failed");
            engine
                .audit(EngineEvent::AssignmentEscalated {
                    booking_id,
                    reason: format!("manual assignment required after fallback failure: {e}"),
                    mode: "unknown".to_string(),
                    timestamp: engine.clock.now(),
                })
                .await;
            Ok(ProcessingResult {
                booking_id,
                outcome: ProcessingOutcome::Escalated {
                    reason: format!("manual assignment required: {e}"),
                },
            })
        }
    }
}

/// Minimal Emergency-mode path: no assignment attempted, every entry is
/// handed to an operator.
async fn emergency_fallback(engine: &Engine, entry: &PoolEntry) -> Result<ProcessingResult> {
    engine.pool.remove(entry.booking_id).await?;
    error!(booking_id = %entry.booking_id, "emergency degradation: escalating for manual handling");
    Ok(ProcessingResult {
        booking_id: entry.booking_id,
        outcome: ProcessingOutcome::Escalated {
            reason: "system in emergency degradation, manual handling required".to_string(),
        },
    })
}

async fn repair_entry(
    engine: &Engine,
    entry: &PoolEntry,
    booking: Option<&Booking>,
    reason: &str,
) -> Result<()> {
    match reason {
        "attempt counter overflow" => engine.pool.reset_attempts(entry.booking_id).await,
        _ => {
            // deadline inconsistencies: re-derive the entry from the
            // booking under its entry mode
            let Some(booking) = booking else {
                return engine.pool.remove(entry.booking_id).await;
            };
            let mode: Mode = entry
                .mode_at_entry
                .parse()
                .unwrap_or(Mode::Normal);
            engine.pool.enter(booking, mode).await.map(|_| ())
        }
    }
}

async fn load_booking(engine: &Engine, booking_id: Uuid) -> Result<Option<Booking>> {
    let booking: Option<Booking> = sqlx::query_as(
        "SELECT id, start_time, end_time, meeting_type, sub_scope, status,
                interpreter_id, owner_id, environment, chair_id, detail,
                created_at, updated_at
         FROM bookings WHERE id = ?",
    )
    .bind(booking_id)
    .fetch_optional(&engine.db)
    .await?;
    Ok(booking)
}

/// Aggregated system health, input to the degradation ladder.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub db_reachable: bool,
    pub stuck_processing: i64,
    /// Escalations over terminal outcomes in the trailing 24h
    pub failure_rate: f64,
    /// Pool entries at or past the retry bound
    pub excessive_retries: i64,
    pub recommended_level: DegradationLevel,
}

/// Probe the datastore and pool, recommend a degradation level.
pub async fn health_check(engine: &Engine) -> HealthReport {
    let db_reachable = sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&engine.db)
        .await
        .is_ok();

    if !db_reachable {
        return HealthReport {
            db_reachable: false,
            stuck_processing: 0,
            failure_rate: 0.0,
            excessive_retries: 0,
            recommended_level: DegradationLevel::Emergency,
        };
    }

    let stuck_processing = engine.pool.stuck_count().await.unwrap_or(0);

    let since = engine.clock.now() - Duration::hours(24);
    let (escalated, decided) = terminal_counts(engine, since).await.unwrap_or((0, 0));
    let total = escalated + decided;
    let failure_rate = if total == 0 {
        0.0
    } else {
        escalated as f64 / total as f64
    };

    let excessive_retries: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pool_entries WHERE attempts >= ?",
    )
    .bind(MAX_POOL_ATTEMPTS)
    .fetch_one(&engine.db)
    .await
    .unwrap_or(0);

    let recommended_level = recommend_level(stuck_processing, failure_rate, excessive_retries);

    HealthReport {
        db_reachable,
        stuck_processing,
        failure_rate,
        excessive_retries,
        recommended_level,
    }
}

fn recommend_level(stuck: i64, failure_rate: f64, excessive_retries: i64) -> DegradationLevel {
    if stuck >= 10 || failure_rate >= 0.75 {
        DegradationLevel::NoLogging
    } else if stuck >= 5 || failure_rate >= 0.5 {
        DegradationLevel::MinimalLogging
    } else if stuck >= 2 || failure_rate >= 0.25 || excessive_retries >= 3 {
        DegradationLevel::ReducedLogging
    } else {
        DegradationLevel::Normal
    }
}

async fn terminal_counts(engine: &Engine, since: DateTime<Utc>) -> Result<(i64, i64)> {
    let escalated: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assignment_logs
         WHERE event_type = 'assignment_escalated' AND created_at >= ?",
    )
    .bind(since)
    .fetch_one(&engine.db)
    .await?;

    let decided: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assignment_logs
         WHERE event_type = 'assignment_decided' AND created_at >= ?",
    )
    .bind(since)
    .fetch_one(&engine.db)
    .await?;

    Ok((escalated, decided))
}

/// Run a health check and move the ladder, announcing transitions.
pub async fn evaluate_degradation(engine: &Engine) -> HealthReport {
    let report = health_check(engine).await;
    let previous = engine.degradation.set(report.recommended_level);

    if previous != report.recommended_level {
        let event = EngineEvent::DegradationChanged {
            from_level: previous.as_str().to_string(),
            to_level: report.recommended_level.as_str().to_string(),
            reason: format!(
                "stuck={} failure_rate={:.2} excessive_retries={}",
                report.stuck_processing, report.failure_rate, report.excessive_retries
            ),
            timestamp: engine.clock.now(),
        };
        // announce directly: the new level may forbid our own audit path
        engine.bus.emit_lossy(event.clone());
        if report.recommended_level < DegradationLevel::MinimalLogging {
            interpd_common::events::log_event(&engine.db, &event).await;
        }
        warn!(
            from = previous.as_str(),
            to = report.recommended_level.as_str(),
            "degradation level changed"
        );
    }

    report
}
