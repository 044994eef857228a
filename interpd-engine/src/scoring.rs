//! Urgency scoring and DR-history evaluation
//!
//! Urgency is an exponential-decay curve over whole days until start,
//! scaled by meeting-type priority and normalized into [0, 1]. The DR
//! history check finds the most recent DR assignment globally within the
//! fairness window and applies the mode's blocking behavior to a candidate
//! who would repeat.

use crate::policy::{DrBlocking, DrOverrideThreshold, DrPolicy, Mode};
use chrono::{DateTime, Duration, Utc};
use interpd_common::clock::days_until;
use interpd_common::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

/// Effective urgent/general threshold days for one meeting type.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub priority: f64,
    pub urgent_days: i64,
    pub general_days: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            priority: 1.0,
            urgent_days: 3,
            general_days: 7,
        }
    }
}

/// Resolve thresholds for a meeting type, preferring the most specific row:
/// mode+environment, then mode, then environment, then the plain default.
pub async fn effective_thresholds(
    db: &SqlitePool,
    meeting_type: &str,
    mode: Mode,
    environment: Option<&str>,
) -> Result<Thresholds> {
    let row: Option<(f64, i64, i64)> = sqlx::query_as(
        "SELECT priority, urgent_threshold_days, general_threshold_days
         FROM meeting_type_priorities
         WHERE meeting_type = ?
           AND (mode = ? OR mode IS NULL)
           AND (environment = ? OR environment IS NULL)
         ORDER BY (mode IS NOT NULL) DESC, (environment IS NOT NULL) DESC
         LIMIT 1",
    )
    .bind(meeting_type)
    .bind(mode.as_str())
    .bind(environment)
    .fetch_optional(db)
    .await?;

    Ok(match row {
        Some((priority, urgent, general)) => Thresholds {
            priority,
            urgent_days: urgent,
            general_days: general,
        },
        None => Thresholds::default(),
    })
}

/// Time-decay urgency score in [0, 1].
///
/// Already-due bookings score 1.0. Inside the urgent threshold the score
/// follows `priority * min(2^((threshold - days)/2), 100) / 100`, capped at
/// 1.0. Beyond the threshold the score is 0.
pub fn urgency_score(
    now: DateTime<Utc>,
    start: DateTime<Utc>,
    priority: f64,
    urgent_threshold_days: i64,
) -> f64 {
    let days = days_until(now, start);

    if days < 0 {
        return 1.0;
    }
    if days > urgent_threshold_days {
        return 0.0;
    }

    let decay = 2f64.powf((urgent_threshold_days - days) as f64 / 2.0).min(100.0);
    (priority * decay / 100.0).min(1.0)
}

/// Whether the booking is urgent enough to bypass the pool.
pub fn should_assign_immediately(
    now: DateTime<Utc>,
    start: DateTime<Utc>,
    urgent_threshold_days: i64,
) -> bool {
    days_until(now, start) <= urgent_threshold_days
}

/// Conditions under which a consecutive-DR rule may be bypassed.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverrideContext {
    /// The booking is critically close to start with no slack left
    pub critical_coverage: bool,
    /// This candidate is the only one left standing
    pub no_alternatives: bool,
    /// The load monitor currently classifies system load as high/critical
    pub high_system_load: bool,
}

impl OverrideContext {
    /// The override condition that holds under the given threshold, if any.
    pub fn condition_under(&self, threshold: DrOverrideThreshold) -> Option<&'static str> {
        match threshold {
            DrOverrideThreshold::Never => None,
            DrOverrideThreshold::CriticalOnly => {
                self.critical_coverage.then_some("critical_coverage")
            }
            DrOverrideThreshold::NoAlternatives => {
                if self.critical_coverage {
                    Some("critical_coverage")
                } else if self.no_alternatives {
                    Some("no_alternatives")
                } else {
                    None
                }
            }
            DrOverrideThreshold::Always => {
                if self.critical_coverage {
                    Some("critical_coverage")
                } else if self.no_alternatives {
                    Some("no_alternatives")
                } else if self.high_system_load {
                    Some("high_system_load")
                } else {
                    Some("always")
                }
            }
        }
    }
}

/// Result of the consecutive-DR check for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum DrOutcome {
    /// Not consecutive, or not a DR booking: no effect
    Clear,
    /// Consecutive but allowed through with a (negative) score adjustment
    Penalty { amount: f64, overridden: bool },
    /// Consecutive and hard-blocked
    Blocked { reason: String },
}

/// Interpreter who received the most recent DR assignment within the
/// fairness window, if any. Global: not scoped to owner or environment,
/// because the anti-repetition rule protects the interpreter, not the
/// meeting series.
pub async fn last_dr_interpreter(
    db: &SqlitePool,
    window_days: i64,
    now: DateTime<Utc>,
) -> Result<Option<Uuid>> {
    let window_start = now - Duration::days(window_days);

    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT interpreter_id FROM bookings
         WHERE meeting_type = 'dr'
           AND status = 'approved'
           AND interpreter_id IS NOT NULL
           AND start_time >= ?
         ORDER BY start_time DESC
         LIMIT 1",
    )
    .bind(window_start)
    .fetch_optional(db)
    .await?;

    Ok(row.map(|(id,)| id))
}

/// Apply the mode's DR policy to a candidate.
pub fn evaluate_dr(
    candidate: Uuid,
    last_dr: Option<Uuid>,
    policy: &DrPolicy,
    ctx: &OverrideContext,
) -> DrOutcome {
    if last_dr != Some(candidate) {
        return DrOutcome::Clear;
    }

    let override_condition = ctx.condition_under(policy.override_threshold);

    match policy.blocking {
        DrBlocking::HardBlock => match override_condition {
            Some(condition) => {
                tracing::debug!(condition, "consecutive DR block overridden");
                DrOutcome::Penalty {
                    amount: policy.consecutive_penalty,
                    overridden: true,
                }
            }
            None => DrOutcome::Blocked {
                reason: "consecutive DR assignment blocked by policy".to_string(),
            },
        },
        DrBlocking::SoftPenalty => {
            let overridden = override_condition.is_some();
            let amount = if overridden {
                policy.consecutive_penalty / 2.0
            } else {
                policy.consecutive_penalty
            };
            DrOutcome::Penalty { amount, overridden }
        }
        DrBlocking::MinimalPenalty => DrOutcome::Penalty {
            // penalty is negative, so the max picks the milder of the two
            amount: (policy.consecutive_penalty * 0.2).max(-0.1),
            overridden: override_condition.is_some(),
        },
    }
}
