//! Pool state machine
//!
//! Bookings that are not yet urgent wait here until a mode-dependent
//! decision point. Entry lifecycle:
//!
//! `waiting` → `ready` → `processing` → assigned/escalated (entry cleared)
//! or `failed` (bounded retries back to `waiting`).
//!
//! An entry becomes ready when its mode's wait threshold has elapsed or
//! its deadline has arrived, whichever comes first; the deadline is an
//! unconditional override regardless of mode.

use crate::policy::Mode;
use crate::scoring::{effective_thresholds, Thresholds};
use chrono::{DateTime, Duration, Utc};
use interpd_common::db::models::{Booking, PoolEntry, PoolStatus};
use interpd_common::{Clock, Error, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Retries a failed entry may consume before requiring operator attention.
pub const MAX_POOL_ATTEMPTS: i64 = 5;

/// Urgency tier by hours remaining until an entry's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineUrgency {
    Low,
    Medium,
    High,
    Critical,
}

/// Classify by hours-to-deadline. At or past the deadline is Critical.
pub fn classify_deadline(hours_left: f64) -> DeadlineUrgency {
    if hours_left <= 2.0 {
        DeadlineUrgency::Critical
    } else if hours_left <= 6.0 {
        DeadlineUrgency::High
    } else if hours_left <= 24.0 {
        DeadlineUrgency::Medium
    } else {
        DeadlineUrgency::Low
    }
}

/// Mode-dependent wait threshold and deadline for a new entry.
#[derive(Debug, Clone, Copy)]
pub struct EntrySchedule {
    /// Days the entry waits before becoming ready on its own
    pub wait_days: i64,
    /// Unconditional promotion time
    pub deadline: DateTime<Utc>,
    /// Entries under Urgent mode skip `waiting` entirely
    pub immediately_ready: bool,
}

/// Compute the wait/deadline pair for a booking entering the pool.
pub fn entry_schedule(mode: Mode, start: DateTime<Utc>, thresholds: &Thresholds) -> EntrySchedule {
    match mode {
        Mode::Urgent => EntrySchedule {
            wait_days: 0,
            deadline: start - Duration::days(thresholds.urgent_days),
            immediately_ready: true,
        },
        Mode::Balance => EntrySchedule {
            // longer wait lets one batch optimize fairness across many
            // entries; deadline one day before the urgent threshold leaves
            // a safety margin
            wait_days: thresholds.general_days.max(3),
            deadline: start - Duration::days(thresholds.urgent_days + 1),
            immediately_ready: false,
        },
        Mode::Normal | Mode::Custom => EntrySchedule {
            wait_days: thresholds.general_days,
            deadline: start - Duration::days(thresholds.urgent_days),
            immediately_ready: false,
        },
    }
}

/// Database-backed pool of deferred bookings.
#[derive(Clone)]
pub struct Pool {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
    /// Minutes after which a `processing` entry counts as stuck
    stale_minutes: i64,
}

impl Pool {
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>, stale_minutes: i64) -> Self {
        Self {
            db,
            clock,
            stale_minutes,
        }
    }

    /// Insert or refresh the pool entry for a booking that is not yet
    /// urgent. Idempotent: re-entering updates the deadline and mode but
    /// preserves the original entry time and attempt count.
    pub async fn enter(&self, booking: &Booking, mode: Mode) -> Result<PoolEntry> {
        let thresholds = effective_thresholds(
            &self.db,
            &booking.meeting_type,
            mode,
            booking.environment.as_deref(),
        )
        .await?;

        let now = self.clock.now();
        let schedule = entry_schedule(mode, booking.start_time, &thresholds);
        let status = if schedule.immediately_ready {
            PoolStatus::Ready
        } else {
            PoolStatus::Waiting
        };

        sqlx::query(
            "INSERT INTO pool_entries
             (booking_id, entered_at, deadline_at, mode_at_entry, attempts, status, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)
             ON CONFLICT (booking_id) DO UPDATE SET
                deadline_at = excluded.deadline_at,
                mode_at_entry = excluded.mode_at_entry,
                status = CASE
                    WHEN pool_entries.status = 'waiting' AND excluded.status = 'ready'
                        THEN 'ready'
                    ELSE pool_entries.status
                END,
                updated_at = excluded.updated_at",
        )
        .bind(booking.id)
        .bind(now)
        .bind(schedule.deadline)
        .bind(mode.as_str())
        .bind(status.as_str())
        .bind(now)
        .execute(&self.db)
        .await?;

        debug!(
            booking_id = %booking.id,
            mode = mode.as_str(),
            deadline = %schedule.deadline,
            "booking entered pool"
        );

        self.get(booking.id)
            .await?
            .ok_or_else(|| Error::Internal("pool entry vanished after insert".to_string()))
    }

    pub async fn get(&self, booking_id: Uuid) -> Result<Option<PoolEntry>> {
        let entry: Option<PoolEntry> = sqlx::query_as(
            "SELECT booking_id, entered_at, deadline_at, mode_at_entry, attempts,
                    status, processing_since, updated_at
             FROM pool_entries WHERE booking_id = ?",
        )
        .bind(booking_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(entry)
    }

    /// Promote `waiting` entries whose wait threshold has elapsed or whose
    /// deadline has arrived. Returns the number promoted.
    pub async fn promote_due(&self) -> Result<u32> {
        let now = self.clock.now();
        let waiting: Vec<PoolEntry> = sqlx::query_as(
            "SELECT booking_id, entered_at, deadline_at, mode_at_entry, attempts,
                    status, processing_since, updated_at
             FROM pool_entries WHERE status = 'waiting'",
        )
        .fetch_all(&self.db)
        .await?;

        let mut promoted = 0;
        for entry in waiting {
            let mode: Mode = entry.mode_at_entry.parse()?;

            let booking: Option<(String, Option<String>)> = sqlx::query_as(
                "SELECT meeting_type, environment FROM bookings WHERE id = ?",
            )
            .bind(entry.booking_id)
            .fetch_optional(&self.db)
            .await?;

            // orphan entries are the recovery layer's problem, skip here
            let Some((meeting_type, environment)) = booking else {
                continue;
            };

            let thresholds =
                effective_thresholds(&self.db, &meeting_type, mode, environment.as_deref())
                    .await?;
            let wait_days = match mode {
                Mode::Urgent => 0,
                Mode::Balance => thresholds.general_days.max(3),
                Mode::Normal | Mode::Custom => thresholds.general_days,
            };

            let threshold_due = now >= entry.entered_at + Duration::days(wait_days);
            let deadline_due = now >= entry.deadline_at;

            if threshold_due || deadline_due {
                self.set_status(entry.booking_id, PoolStatus::Ready).await?;
                promoted += 1;
            }
        }

        if promoted > 0 {
            info!(promoted, "pool entries promoted to ready");
        }
        Ok(promoted)
    }

    /// All `ready` entries, deadline-soonest first.
    pub async fn ready_entries(&self) -> Result<Vec<PoolEntry>> {
        let entries: Vec<PoolEntry> = sqlx::query_as(
            "SELECT booking_id, entered_at, deadline_at, mode_at_entry, attempts,
                    status, processing_since, updated_at
             FROM pool_entries WHERE status = 'ready'
             ORDER BY deadline_at ASC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(entries)
    }

    /// Entries whose deadline has arrived, regardless of status (the
    /// deadline override path).
    pub async fn deadline_entries(&self) -> Result<Vec<PoolEntry>> {
        let entries: Vec<PoolEntry> = sqlx::query_as(
            "SELECT booking_id, entered_at, deadline_at, mode_at_entry, attempts,
                    status, processing_since, updated_at
             FROM pool_entries
             WHERE deadline_at <= ? AND status IN ('waiting', 'ready', 'failed')
             ORDER BY deadline_at ASC",
        )
        .bind(self.clock.now())
        .fetch_all(&self.db)
        .await?;
        Ok(entries)
    }

    /// Deadline urgency tiers across all live entries.
    pub async fn deadline_profile(&self) -> Result<Vec<(Uuid, DeadlineUrgency)>> {
        let now = self.clock.now();
        let entries: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT booking_id, deadline_at FROM pool_entries
             WHERE status IN ('waiting', 'ready', 'failed')",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(entries
            .into_iter()
            .map(|(id, deadline)| {
                let hours_left = (deadline - now).num_seconds() as f64 / 3600.0;
                (id, classify_deadline(hours_left))
            })
            .collect())
    }

    /// Emergency batch processing triggers on ≥1 Critical or ≥3
    /// High-or-worse entries.
    pub async fn emergency_due(&self) -> Result<bool> {
        let profile = self.deadline_profile().await?;
        let critical = profile
            .iter()
            .filter(|(_, u)| *u == DeadlineUrgency::Critical)
            .count();
        let high_plus = profile
            .iter()
            .filter(|(_, u)| *u >= DeadlineUrgency::High)
            .count();
        Ok(critical >= 1 || high_plus >= 3)
    }

    /// Claim an entry for processing. Returns false if another worker
    /// claimed it first.
    pub async fn claim_for_processing(&self, booking_id: Uuid) -> Result<bool> {
        let now = self.clock.now();
        let result = sqlx::query(
            "UPDATE pool_entries
             SET status = 'processing', processing_since = ?, updated_at = ?
             WHERE booking_id = ? AND status IN ('waiting', 'ready', 'failed')",
        )
        .bind(now)
        .bind(now)
        .bind(booking_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a failed processing attempt. Entries under the attempt bound
    /// go back to `waiting`; beyond it they stay `failed` for an operator.
    pub async fn record_failure(&self, booking_id: Uuid) -> Result<PoolStatus> {
        let now = self.clock.now();
        let attempts: i64 = sqlx::query_scalar(
            "UPDATE pool_entries
             SET attempts = attempts + 1,
                 processing_since = NULL,
                 updated_at = ?
             WHERE booking_id = ?
             RETURNING attempts",
        )
        .bind(now)
        .bind(booking_id)
        .fetch_one(&self.db)
        .await?;

        let status = if attempts < MAX_POOL_ATTEMPTS {
            PoolStatus::Waiting
        } else {
            warn!(booking_id = %booking_id, attempts, "pool entry exhausted retries");
            PoolStatus::Failed
        };
        self.set_status(booking_id, status).await?;
        Ok(status)
    }

    /// Reset attempts without removing the entry (used by corruption
    /// repair).
    pub async fn reset_attempts(&self, booking_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE pool_entries
             SET attempts = 0, status = 'waiting', processing_since = NULL, updated_at = ?
             WHERE booking_id = ?",
        )
        .bind(self.clock.now())
        .bind(booking_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Clear an entry on assignment, escalation, or cancellation.
    pub async fn remove(&self, booking_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM pool_entries WHERE booking_id = ?")
            .bind(booking_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Recover entries stuck in `processing` past the staleness threshold.
    pub async fn recover_stuck(&self) -> Result<u32> {
        let cutoff = self.clock.now() - Duration::minutes(self.stale_minutes);
        let result = sqlx::query(
            "UPDATE pool_entries
             SET status = 'ready', processing_since = NULL, updated_at = ?
             WHERE status = 'processing' AND processing_since <= ?",
        )
        .bind(self.clock.now())
        .bind(cutoff)
        .execute(&self.db)
        .await?;

        let recovered = result.rows_affected() as u32;
        if recovered > 0 {
            warn!(recovered, "recovered stuck pool entries");
        }
        Ok(recovered)
    }

    /// Count of entries currently stuck in `processing`.
    pub async fn stuck_count(&self) -> Result<i64> {
        let cutoff = self.clock.now() - Duration::minutes(self.stale_minutes);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pool_entries
             WHERE status = 'processing' AND processing_since <= ?",
        )
        .bind(cutoff)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }

    /// Drop entries whose booking was cancelled externally.
    pub async fn sweep_cancelled(&self) -> Result<u32> {
        let result = sqlx::query(
            "DELETE FROM pool_entries
             WHERE booking_id IN (SELECT id FROM bookings WHERE status = 'cancelled')",
        )
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() as u32)
    }

    pub async fn size(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pool_entries")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    async fn set_status(&self, booking_id: Uuid, status: PoolStatus) -> Result<()> {
        sqlx::query("UPDATE pool_entries SET status = ?, updated_at = ? WHERE booking_id = ?")
            .bind(status.as_str())
            .bind(self.clock.now())
            .bind(booking_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
