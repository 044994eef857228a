//! Conflict detection: schedule overlap and chairperson checks
//!
//! Intervals are half-open `[start, end)`: touching endpoints are not a
//! conflict. Queries take any sqlite executor so the same check runs
//! against the pool before commit and against the open transaction inside
//! it (the second run closes the TOCTOU window).

use chrono::{DateTime, Utc};
use interpd_common::Result;
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

/// Half-open interval overlap predicate.
pub fn intervals_overlap(
    s1: DateTime<Utc>,
    e1: DateTime<Utc>,
    s2: DateTime<Utc>,
    e2: DateTime<Utc>,
) -> bool {
    s1 < e2 && s2 < e1
}

/// Booking that makes `interpreter_id` unavailable in `[start, end)`,
/// if one exists. Cancelled bookings never conflict.
pub async fn find_conflict<'e, E>(
    executor: E,
    interpreter_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_booking: Option<Uuid>,
) -> Result<Option<Uuid>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM bookings
         WHERE interpreter_id = ?
           AND status != 'cancelled'
           AND start_time < ?
           AND end_time > ?
           AND (? IS NULL OR id != ?)
         LIMIT 1",
    )
    .bind(interpreter_id)
    .bind(end)
    .bind(start)
    .bind(exclude_booking)
    .bind(exclude_booking)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Subset of `ids` with no overlapping non-cancelled booking in
/// `[start, end)`.
pub async fn filter_available(
    db: &sqlx::SqlitePool,
    ids: &[Uuid],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_booking: Option<Uuid>,
) -> Result<Vec<Uuid>> {
    let mut available = Vec::with_capacity(ids.len());
    for id in ids {
        if find_conflict(db, *id, start, end, exclude_booking).await?.is_none() {
            available.push(*id);
        }
    }
    Ok(available)
}

/// Safety check used both pre-commit and inside the commit transaction.
/// Returns the conflicting booking id when unsafe.
pub async fn validate_assignment_safety<'e, E>(
    executor: E,
    interpreter_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_booking: Uuid,
) -> Result<Option<Uuid>>
where
    E: Executor<'e, Database = Sqlite>,
{
    find_conflict(executor, interpreter_id, start, end, Some(exclude_booking)).await
}

/// DR meetings additionally require the organizer's chairperson to be free.
/// Returns the booking that already commits the chair, if any.
pub async fn chair_conflict(
    db: &sqlx::SqlitePool,
    chair_id: Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_booking: Uuid,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM bookings
         WHERE chair_id = ?
           AND status != 'cancelled'
           AND start_time < ?
           AND end_time > ?
           AND id != ?
         LIMIT 1",
    )
    .bind(chair_id)
    .bind(end)
    .bind(start)
    .bind(exclude_booking)
    .fetch_optional(db)
    .await?;

    Ok(row.map(|(id,)| id))
}
