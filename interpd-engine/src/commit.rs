//! Safe commit with bounded retry
//!
//! For each ranked eligible candidate in order: up to N attempts with
//! capped exponential backoff. Every attempt re-validates availability on
//! the pool, then opens a transaction that re-reads the booking (fail fast
//! on a concurrent assignment), re-validates availability inside the
//! transaction, and writes the assignment with a guarded UPDATE. Only the
//! commit step mutates booking state anywhere in the engine.

use crate::conflict::{chair_conflict, validate_assignment_safety};
use crate::ranking::CandidateResult;
use chrono::Utc;
use interpd_common::db::models::Booking;
use interpd_common::db::{acquire_lock, release_lock};
use interpd_common::events::{EngineEvent, EventBus};
use interpd_common::{Error, Result};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CAPACITY_LOCK_KEY: &str = "assignment_capacity";
const CAPACITY_LOCK_TTL_SECS: i64 = 30;
const MAX_BACKOFF_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Attempts per candidate
    pub retries: u32,
    /// Base backoff delay, doubled per attempt, capped
    pub backoff_ms: u64,
    /// Bounded wait for the global capacity lock; zero disables the lock
    pub lock_wait_ms: u64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 100,
            lock_wait_ms: 5_000,
        }
    }
}

/// Terminal outcome of the commit ladder.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        interpreter_id: Uuid,
        attempts: u32,
    },
    /// Every candidate was exhausted; carries a reason per candidate
    Exhausted { reasons: Vec<String> },
}

/// Try ranked candidates in order until one commits.
pub async fn commit_assignment(
    db: &SqlitePool,
    booking: &Booking,
    ranked: &[CandidateResult],
    cfg: &CommitConfig,
    bus: &EventBus,
) -> Result<CommitOutcome> {
    let mut reasons = Vec::new();
    let mut total_attempts: u32 = 0;

    for candidate in ranked.iter().filter(|c| c.eligible) {
        match commit_candidate(db, booking, candidate.interpreter_id, cfg, bus, &mut total_attempts)
            .await?
        {
            CandidateVerdict::Committed => {
                return Ok(CommitOutcome::Committed {
                    interpreter_id: candidate.interpreter_id,
                    attempts: total_attempts,
                });
            }
            CandidateVerdict::Conflicted(reason) | CandidateVerdict::Exhausted(reason) => {
                reasons.push(format!("{}: {}", candidate.interpreter_id, reason));
            }
        }
    }

    if reasons.is_empty() {
        reasons.push("no eligible candidates".to_string());
    }
    Ok(CommitOutcome::Exhausted { reasons })
}

/// Doubled per attempt, capped. Saturating so an operator-set retry
/// count can never overflow the delay.
fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    base_ms
        .saturating_mul(1u64 << attempt.min(32))
        .min(MAX_BACKOFF_MS)
}

enum CandidateVerdict {
    Committed,
    /// Now conflicted; move to the next candidate without retrying
    Conflicted(String),
    /// Transient failures used up all attempts
    Exhausted(String),
}

async fn commit_candidate(
    db: &SqlitePool,
    booking: &Booking,
    interpreter_id: Uuid,
    cfg: &CommitConfig,
    bus: &EventBus,
    total_attempts: &mut u32,
) -> Result<CandidateVerdict> {
    let mut last_transient = String::new();

    for attempt in 0..cfg.retries {
        *total_attempts += 1;

        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(backoff_delay(cfg.backoff_ms, attempt))).await;
        }

        // Pre-check on the pool; a conflict here means the candidate is
        // genuinely taken, not a transient race
        if let Some(conflicting) = validate_assignment_safety(
            db,
            interpreter_id,
            booking.start_time,
            booking.end_time,
            booking.id,
        )
        .await?
        {
            bus.emit_lossy(EngineEvent::ConflictDetected {
                booking_id: booking.id,
                interpreter_id,
                conflicting_booking_id: Some(conflicting),
                chair_conflict: false,
                timestamp: Utc::now(),
            });
            return Ok(CandidateVerdict::Conflicted(format!(
                "schedule conflict with booking {conflicting}"
            )));
        }

        // DR meetings also require the chair to be free
        if booking.is_dr() {
            if let Some(chair) = booking.chair_id {
                if let Some(conflicting) =
                    chair_conflict(db, chair, booking.start_time, booking.end_time, booking.id)
                        .await?
                {
                    bus.emit_lossy(EngineEvent::ConflictDetected {
                        booking_id: booking.id,
                        interpreter_id,
                        conflicting_booking_id: Some(conflicting),
                        chair_conflict: true,
                        timestamp: Utc::now(),
                    });
                    return Ok(CandidateVerdict::Conflicted(format!(
                        "chairperson committed to booking {conflicting}"
                    )));
                }
            }
        }

        match transactional_commit(db, booking, interpreter_id, cfg).await {
            Ok(()) => {
                info!(
                    booking_id = %booking.id,
                    interpreter_id = %interpreter_id,
                    attempt = attempt + 1,
                    "assignment committed"
                );
                return Ok(CandidateVerdict::Committed);
            }
            Err(Error::Concurrency(msg)) => {
                // booking itself was taken by another run; no candidate
                // can succeed anymore, surface upward
                return Err(Error::Concurrency(msg));
            }
            Err(e) if e.is_transient() => {
                warn!(
                    booking_id = %booking.id,
                    interpreter_id = %interpreter_id,
                    attempt = attempt + 1,
                    error = %e,
                    "transient commit failure, will retry"
                );
                last_transient = e.to_string();
            }
            Err(e) => return Err(e),
        }
    }

    Ok(CandidateVerdict::Exhausted(format!(
        "retries exhausted ({last_transient})"
    )))
}

/// The transactional core: re-read, re-validate, guarded write.
async fn transactional_commit(
    db: &SqlitePool,
    booking: &Booking,
    interpreter_id: Uuid,
    cfg: &CommitConfig,
) -> Result<()> {
    let holder = format!("commit-{}", booking.id);
    let locked = cfg.lock_wait_ms > 0;
    if locked {
        acquire_lock(
            db,
            CAPACITY_LOCK_KEY,
            &holder,
            CAPACITY_LOCK_TTL_SECS,
            cfg.lock_wait_ms,
        )
        .await?;
    }

    let result = transactional_commit_inner(db, booking, interpreter_id).await;

    if locked {
        // release failures must not mask the commit result; the TTL will
        // reap the row if this delete is lost
        if let Err(e) = release_lock(db, CAPACITY_LOCK_KEY, &holder).await {
            warn!(error = %e, "failed to release capacity lock");
        }
    }

    result
}

async fn transactional_commit_inner(
    db: &SqlitePool,
    booking: &Booking,
    interpreter_id: Uuid,
) -> Result<()> {
    let mut tx = db.begin().await?;

    // Fail fast if a concurrent run assigned this booking already
    let current: Option<(Option<Uuid>, String)> =
        sqlx::query_as("SELECT interpreter_id, status FROM bookings WHERE id = ?")
            .bind(booking.id)
            .fetch_optional(&mut *tx)
            .await?;

    let (assigned_to, status) = current
        .ok_or_else(|| Error::NotFound(format!("booking {} disappeared", booking.id)))?;

    if let Some(existing) = assigned_to {
        return Err(Error::Concurrency(format!(
            "booking {} already assigned to {existing}",
            booking.id
        )));
    }
    if status == "cancelled" {
        return Err(Error::Concurrency(format!(
            "booking {} was cancelled concurrently",
            booking.id
        )));
    }

    // Second availability check inside the transaction closes the window
    // between the pool-level check and this write
    if let Some(conflicting) = validate_assignment_safety(
        &mut *tx,
        interpreter_id,
        booking.start_time,
        booking.end_time,
        booking.id,
    )
    .await?
    {
        return Err(Error::Conflict(format!(
            "interpreter {interpreter_id} gained conflicting booking {conflicting}"
        )));
    }

    // Guarded write: the WHERE clause makes this a compare-and-write
    let result = sqlx::query(
        "UPDATE bookings
         SET interpreter_id = ?, status = 'approved', updated_at = ?
         WHERE id = ? AND interpreter_id IS NULL AND status = 'waiting'",
    )
    .bind(interpreter_id)
    .bind(Utc::now())
    .bind(booking.id)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() != 1 {
        return Err(Error::Concurrency(format!(
            "booking {} changed between read and write",
            booking.id
        )));
    }

    tx.commit().await?;
    debug!(booking_id = %booking.id, "transaction committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, NaiveDateTime, Utc};
    use interpd_common::db::init::init_memory_database;

    fn at(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
    }

    fn candidate(id: Uuid, eligible: bool) -> CandidateResult {
        CandidateResult {
            interpreter_id: id,
            fairness: 1.0,
            urgency: 0.5,
            rotation: 1.0,
            dr_penalty: 0.0,
            total: 2.0,
            current_hours: 0.0,
            eligible,
            ineligible_reason: None,
        }
    }

    async fn insert_booking(db: &SqlitePool, start: DateTime<Utc>) -> Booking {
        let b = Booking {
            id: Uuid::new_v4(),
            start_time: start,
            end_time: start + Duration::hours(2),
            meeting_type: "other".to_string(),
            sub_scope: None,
            status: "waiting".to_string(),
            interpreter_id: None,
            owner_id: Uuid::new_v4(),
            environment: None,
            chair_id: None,
            detail: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO bookings
             (id, start_time, end_time, meeting_type, status, owner_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(b.id)
        .bind(b.start_time)
        .bind(b.end_time)
        .bind(&b.meeting_type)
        .bind(&b.status)
        .bind(b.owner_id)
        .bind(b.created_at)
        .bind(b.updated_at)
        .execute(db)
        .await
        .unwrap();
        b
    }

    fn fast_cfg() -> CommitConfig {
        CommitConfig {
            retries: 2,
            backoff_ms: 1,
            lock_wait_ms: 500,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(100, 1), 200);
        assert_eq!(backoff_delay(100, 2), 400);
        assert_eq!(backoff_delay(100, 5), MAX_BACKOFF_MS);
    }

    #[test]
    fn backoff_saturates_for_absurd_attempt_counts() {
        assert_eq!(backoff_delay(100, 63), MAX_BACKOFF_MS);
        assert_eq!(backoff_delay(100, u32::MAX), MAX_BACKOFF_MS);
        assert_eq!(backoff_delay(u64::MAX, 1), MAX_BACKOFF_MS);
    }

    #[tokio::test]
    async fn commits_first_eligible_candidate() {
        let db = init_memory_database().await.unwrap();
        let booking = insert_booking(&db, at("2025-03-12 10:00:00")).await;
        let a = Uuid::new_v4();
        let bus = EventBus::new(8);

        let outcome = commit_assignment(
            &db,
            &booking,
            &[candidate(a, true)],
            &fast_cfg(),
            &bus,
        )
        .await
        .unwrap();

        match outcome {
            CommitOutcome::Committed { interpreter_id, .. } => assert_eq!(interpreter_id, a),
            other => panic!("expected commit, got {other:?}"),
        }

        let (assigned, status): (Option<Uuid>, String) =
            sqlx::query_as("SELECT interpreter_id, status FROM bookings WHERE id = ?")
                .bind(booking.id)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(assigned, Some(a));
        assert_eq!(status, "approved");
    }

    #[tokio::test]
    async fn conflicted_candidate_falls_through_to_next() {
        let db = init_memory_database().await.unwrap();
        let booking = insert_booking(&db, at("2025-03-12 10:00:00")).await;
        let busy = Uuid::new_v4();
        let free = Uuid::new_v4();
        let bus = EventBus::new(8);

        // busy already holds an overlapping approved booking
        sqlx::query(
            "INSERT INTO bookings
             (id, start_time, end_time, meeting_type, status, interpreter_id,
              owner_id, created_at, updated_at)
             VALUES (?, ?, ?, 'other', 'approved', ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(at("2025-03-12 09:00:00"))
        .bind(at("2025-03-12 11:00:00"))
        .bind(busy)
        .bind(Uuid::new_v4())
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&db)
        .await
        .unwrap();

        let outcome = commit_assignment(
            &db,
            &booking,
            &[candidate(busy, true), candidate(free, true)],
            &fast_cfg(),
            &bus,
        )
        .await
        .unwrap();

        match outcome {
            CommitOutcome::Committed { interpreter_id, .. } => assert_eq!(interpreter_id, free),
            other => panic!("expected commit to free candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn already_assigned_booking_fails_fast_as_concurrency() {
        let db = init_memory_database().await.unwrap();
        let booking = insert_booking(&db, at("2025-03-12 10:00:00")).await;
        let bus = EventBus::new(8);

        sqlx::query("UPDATE bookings SET interpreter_id = ?, status = 'approved' WHERE id = ?")
            .bind(Uuid::new_v4())
            .bind(booking.id)
            .execute(&db)
            .await
            .unwrap();

        let err = commit_assignment(
            &db,
            &booking,
            &[candidate(Uuid::new_v4(), true)],
            &fast_cfg(),
            &bus,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Concurrency(_)));
    }

    #[tokio::test]
    async fn ineligible_candidates_are_skipped() {
        let db = init_memory_database().await.unwrap();
        let booking = insert_booking(&db, at("2025-03-12 10:00:00")).await;
        let bus = EventBus::new(8);

        let outcome = commit_assignment(
            &db,
            &booking,
            &[candidate(Uuid::new_v4(), false)],
            &fast_cfg(),
            &bus,
        )
        .await
        .unwrap();

        match outcome {
            CommitOutcome::Exhausted { reasons } => {
                assert_eq!(reasons, vec!["no eligible candidates".to_string()]);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chair_conflict_rejects_dr_candidate() {
        let db = init_memory_database().await.unwrap();
        let chair = Uuid::new_v4();
        let bus = EventBus::new(8);

        let mut booking = insert_booking(&db, at("2025-03-12 10:00:00")).await;
        sqlx::query("UPDATE bookings SET meeting_type = 'dr', chair_id = ? WHERE id = ?")
            .bind(chair)
            .bind(booking.id)
            .execute(&db)
            .await
            .unwrap();
        booking.meeting_type = "dr".to_string();
        booking.chair_id = Some(chair);

        // chair committed elsewhere in the same slot
        sqlx::query(
            "INSERT INTO bookings
             (id, start_time, end_time, meeting_type, status, owner_id, chair_id,
              created_at, updated_at)
             VALUES (?, ?, ?, 'other', 'approved', ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(at("2025-03-12 09:30:00"))
        .bind(at("2025-03-12 10:30:00"))
        .bind(Uuid::new_v4())
        .bind(chair)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&db)
        .await
        .unwrap();

        let outcome = commit_assignment(
            &db,
            &booking,
            &[candidate(Uuid::new_v4(), true)],
            &fast_cfg(),
            &bus,
        )
        .await
        .unwrap();

        match outcome {
            CommitOutcome::Exhausted { reasons } => {
                assert!(reasons[0].contains("chairperson"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
