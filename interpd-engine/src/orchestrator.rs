//! Assignment orchestrator: the core run loop for one booking
//!
//! Terminal in exactly two outcomes per invocation, `Assigned` or
//! `Escalated`; a booking is never silently dropped. Safe to re-invoke
//! from a scheduler tick: already-assigned bookings return idempotently
//! with no writes.

use crate::commit::{commit_assignment, CommitConfig, CommitOutcome};
use crate::conflict::filter_available;
use crate::fairness::interpreter_hours;
use crate::policy::{dr_policy, Mode, PolicyStore};
use crate::pool::Pool;
use crate::ranking::{apply_gap_filter, rank, recommendation, GapFilterMode};
use crate::recovery::DegradationState;
use crate::scoring::{
    effective_thresholds, evaluate_dr, last_dr_interpreter, should_assign_immediately,
    urgency_score, DrOutcome, OverrideContext,
};
use chrono::Duration;
use interpd_common::clock::duration_hours;
use interpd_common::db::models::Booking;
use interpd_common::events::{log_event, CandidateScoreDetail, EngineEvent, EventBus};
use interpd_common::{Clock, Error, Result};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Terminal outcome of one assignment attempt.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Assigned { interpreter_id: Uuid },
    Escalated { reason: String },
}

/// The assignment engine with all collaborators injected explicitly.
#[derive(Clone)]
pub struct Engine {
    pub db: SqlitePool,
    pub clock: Arc<dyn Clock>,
    pub policy: PolicyStore,
    pub pool: Pool,
    pub bus: EventBus,
    pub commit_cfg: CommitConfig,
    pub degradation: DegradationState,
}

impl Engine {
    pub fn new(
        db: SqlitePool,
        clock: Arc<dyn Clock>,
        policy: PolicyStore,
        pool: Pool,
        bus: EventBus,
        commit_cfg: CommitConfig,
        degradation: DegradationState,
    ) -> Self {
        Self {
            db,
            clock,
            policy,
            pool,
            bus,
            commit_cfg,
            degradation,
        }
    }

    /// Run the assignment decision for one booking.
    pub async fn run_assignment(&self, booking_id: Uuid) -> Result<RunResult> {
        self.run(booking_id, false).await
    }

    /// Pool batch entry point: a ready entry has reached its decision
    /// point, so the not-yet-urgent check must not push it back into the
    /// pool.
    pub async fn run_assignment_forced(&self, booking_id: Uuid) -> Result<RunResult> {
        self.run(booking_id, true).await
    }

    #[instrument(skip(self), fields(booking_id = %booking_id))]
    async fn run(&self, booking_id: Uuid, force: bool) -> Result<RunResult> {
        let booking = self.load_booking(booking_id).await?;
        let policy = self.policy.load().await?;
        let mode = policy.mode;

        // Idempotence: an assigned booking reports its interpreter with no
        // further writes
        if let Some(existing) = booking.interpreter_id {
            return Ok(RunResult::Assigned {
                interpreter_id: existing,
            });
        }

        if booking.status == "cancelled" {
            self.pool.remove(booking.id).await?;
            return self
                .escalate(&booking, mode, "booking was cancelled".to_string())
                .await;
        }

        if !policy.auto_assign_enabled {
            return self
                .escalate(&booking, mode, "automatic assignment disabled by policy".to_string())
                .await;
        }

        let now = self.clock.now();
        let thresholds = effective_thresholds(
            &self.db,
            &booking.meeting_type,
            mode,
            booking.environment.as_deref(),
        )
        .await?;

        let urgent = should_assign_immediately(now, booking.start_time, thresholds.urgent_days);

        // Pooling is the expected non-urgent path, not an error
        if !force && !urgent {
            self.pool.enter(&booking, mode).await?;
            return self
                .escalate(
                    &booking,
                    mode,
                    "pending manual approval: pooled until decision point".to_string(),
                )
                .await;
        }

        // Candidate universe: active interpreters in the booking's
        // environment scope (environment-less interpreters serve all)
        let candidates = self.active_interpreters(booking.environment.as_deref()).await?;
        if candidates.is_empty() {
            return self
                .escalate(&booking, mode, "no active interpreters in scope".to_string())
                .await;
        }

        let available = filter_available(
            &self.db,
            &candidates,
            booking.start_time,
            booking.end_time,
            Some(booking.id),
        )
        .await?;
        if available.is_empty() {
            let reason = format!(
                "all interpreters have time conflicts: {} of {} candidates busy in [{}, {})",
                candidates.len(),
                candidates.len(),
                booking.start_time,
                booking.end_time
            );
            return self.escalate(&booking, mode, reason).await;
        }

        let hours = interpreter_hours(
            &self.db,
            &available,
            policy.fairness_window_days,
            now,
        )
        .await?;

        let urgency = urgency_score(
            now,
            booking.start_time,
            thresholds.priority,
            thresholds.urgent_days,
        );

        let booking_hours = duration_hours(booking.start_time, booking.end_time);
        let (filtered, filter_mode) = apply_gap_filter(
            &available,
            &hours,
            booking_hours,
            policy.max_gap_hours,
            urgent,
        );
        if filtered.is_empty() {
            let reason = format!(
                "no available interpreters under maxGapHours ({:?} mode)",
                filter_mode
            );
            return self.escalate(&booking, mode, reason).await;
        }
        if filter_mode != GapFilterMode::Strict {
            info!(?filter_mode, booking_id = %booking.id, "gap filter relaxed for urgent booking");
        }

        let dr_outcomes = self
            .dr_outcomes(&booking, mode, &policy, &filtered, now)
            .await?;

        let last_assigned = self.last_assigned(policy.fairness_window_days).await?;
        let ranked = rank(&filtered, &hours, urgency, &policy, &dr_outcomes, last_assigned);

        if recommendation(&ranked).is_none() {
            let reason = ranked
                .first()
                .and_then(|top| top.ineligible_reason.clone())
                .unwrap_or_else(|| "no eligible candidate after ranking".to_string());
            return self.escalate(&booking, mode, reason).await;
        }

        match commit_assignment(&self.db, &booking, &ranked, &self.commit_cfg, &self.bus).await {
            Ok(CommitOutcome::Committed {
                interpreter_id,
                attempts,
            }) => {
                self.pool.remove(booking.id).await?;
                self.audit(EngineEvent::AssignmentDecided {
                    booking_id: booking.id,
                    interpreter_id,
                    mode: mode.as_str().to_string(),
                    urgency_score: urgency,
                    candidates: ranked
                        .iter()
                        .map(|c| CandidateScoreDetail {
                            interpreter_id: c.interpreter_id,
                            fairness: c.fairness,
                            urgency: c.urgency,
                            rotation: c.rotation,
                            dr_penalty: c.dr_penalty,
                            total: c.total,
                            eligible: c.eligible,
                        })
                        .collect(),
                    attempts,
                    timestamp: self.clock.now(),
                })
                .await;
                Ok(RunResult::Assigned { interpreter_id })
            }
            Ok(CommitOutcome::Exhausted { reasons }) => {
                let reason = format!(
                    "no suitable candidate after conflict resolution and retries: {}",
                    reasons.join("; ")
                );
                self.escalate(&booking, mode, reason).await
            }
            Err(Error::Concurrency(_)) => {
                // lost the race: someone else assigned this booking, which
                // is a success from the caller's perspective
                let fresh = self.load_booking(booking.id).await?;
                match fresh.interpreter_id {
                    Some(interpreter_id) => {
                        self.pool.remove(booking.id).await?;
                        Ok(RunResult::Assigned { interpreter_id })
                    }
                    None => {
                        self.escalate(
                            &booking,
                            mode,
                            "booking changed concurrently and is no longer assignable".to_string(),
                        )
                        .await
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Consecutive-DR outcomes per candidate; empty for non-DR bookings.
    async fn dr_outcomes(
        &self,
        booking: &Booking,
        mode: Mode,
        policy: &crate::policy::AssignmentPolicy,
        candidates: &[Uuid],
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<BTreeMap<Uuid, DrOutcome>> {
        let mut outcomes = BTreeMap::new();
        if !booking.is_dr() {
            return Ok(outcomes);
        }

        let last_dr = last_dr_interpreter(&self.db, policy.fairness_window_days, now).await?;
        let Some(last_dr) = last_dr else {
            return Ok(outcomes);
        };

        let dr = dr_policy(mode, policy);
        let ctx = OverrideContext {
            critical_coverage: booking.start_time - now <= Duration::hours(24),
            no_alternatives: candidates.len() == 1,
            high_system_load: self.pool.emergency_due().await?,
        };

        for candidate in candidates {
            let outcome = evaluate_dr(*candidate, Some(last_dr), &dr, &ctx);
            if let DrOutcome::Penalty { amount, overridden } = &outcome {
                self.audit(EngineEvent::DrPolicyDecision {
                    booking_id: booking.id,
                    interpreter_id: *candidate,
                    blocking: dr.blocking.as_str().to_string(),
                    blocked: false,
                    penalty_applied: *amount,
                    override_condition: overridden.then(|| "override".to_string()),
                    timestamp: self.clock.now(),
                })
                .await;
            } else if matches!(outcome, DrOutcome::Blocked { .. }) {
                self.audit(EngineEvent::DrPolicyDecision {
                    booking_id: booking.id,
                    interpreter_id: *candidate,
                    blocking: dr.blocking.as_str().to_string(),
                    blocked: true,
                    penalty_applied: 0.0,
                    override_condition: None,
                    timestamp: self.clock.now(),
                })
                .await;
            }
            outcomes.insert(*candidate, outcome);
        }

        Ok(outcomes)
    }

    async fn load_booking(&self, booking_id: Uuid) -> Result<Booking> {
        let booking: Option<Booking> = sqlx::query_as(
            "SELECT id, start_time, end_time, meeting_type, sub_scope, status,
                    interpreter_id, owner_id, environment, chair_id, detail,
                    created_at, updated_at
             FROM bookings WHERE id = ?",
        )
        .bind(booking_id)
        .fetch_optional(&self.db)
        .await?;

        booking.ok_or_else(|| Error::NotFound(format!("booking {booking_id}")))
    }

    async fn active_interpreters(&self, environment: Option<&str>) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM interpreters
             WHERE active = 1 AND is_interpreter = 1
               AND (environment IS NULL OR ? IS NULL OR environment = ?)
             ORDER BY id",
        )
        .bind(environment)
        .bind(environment)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Interpreter holding the most recent assignment of any type within
    /// the window, for the rotation-smoothing term.
    async fn last_assigned(&self, window_days: i64) -> Result<Option<Uuid>> {
        let window_start = self.clock.now() - Duration::days(window_days);
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT interpreter_id FROM bookings
             WHERE interpreter_id IS NOT NULL
               AND status = 'approved'
               AND start_time >= ?
             ORDER BY updated_at DESC
             LIMIT 1",
        )
        .bind(window_start)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn escalate(&self, booking: &Booking, mode: Mode, reason: String) -> Result<RunResult> {
        info!(booking_id = %booking.id, reason, "assignment escalated");
        self.audit(EngineEvent::AssignmentEscalated {
            booking_id: booking.id,
            reason: reason.clone(),
            mode: mode.as_str().to_string(),
            timestamp: self.clock.now(),
        })
        .await;
        Ok(RunResult::Escalated { reason })
    }

    /// Emit an audit event through the degradation gate. Never fails the
    /// decision path.
    pub(crate) async fn audit(&self, event: EngineEvent) {
        if self.degradation.allow_bus() {
            self.bus.emit_lossy(event.clone());
        }
        if self.degradation.allow_db_logging() {
            log_event(&self.db, &event).await;
        }
    }
}
