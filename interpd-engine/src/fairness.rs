//! Fairness ledger: rolling worked-hours per interpreter
//!
//! A pure aggregate over the booking history. Recomputed on every decision;
//! caching a snapshot across decisions would race with concurrent commits.

use chrono::{DateTime, Duration, Utc};
use interpd_common::Result;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Interpreter → accumulated hours within the fairness window.
/// Interpreters with no bookings map to 0.0.
pub type HoursSnapshot = BTreeMap<Uuid, f64>;

/// Sum the duration of all non-cancelled, assigned bookings whose start
/// falls within the trailing window, restricted to the given interpreters.
pub async fn interpreter_hours(
    db: &SqlitePool,
    interpreter_ids: &[Uuid],
    window_days: i64,
    now: DateTime<Utc>,
) -> Result<HoursSnapshot> {
    let mut snapshot: HoursSnapshot =
        interpreter_ids.iter().map(|id| (*id, 0.0)).collect();

    if interpreter_ids.is_empty() {
        return Ok(snapshot);
    }

    let window_start = now - Duration::days(window_days);

    let rows: Vec<(Uuid, f64)> = sqlx::query_as(
        "SELECT interpreter_id,
                SUM((julianday(end_time) - julianday(start_time)) * 24.0)
         FROM bookings
         WHERE interpreter_id IS NOT NULL
           AND status != 'cancelled'
           AND start_time >= ?
           AND start_time <= ?
         GROUP BY interpreter_id",
    )
    .bind(window_start)
    .bind(now)
    .fetch_all(db)
    .await?;

    for (id, hours) in rows {
        // Only interpreters in the requested active set count
        if let Some(entry) = snapshot.get_mut(&id) {
            *entry = hours;
        }
    }

    Ok(snapshot)
}

/// Spread between the busiest and the idlest interpreter in a snapshot.
pub fn hours_gap(snapshot: &HoursSnapshot) -> f64 {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for hours in snapshot.values() {
        min = min.min(*hours);
        max = max.max(*hours);
    }
    if snapshot.is_empty() {
        0.0
    } else {
        max - min
    }
}
