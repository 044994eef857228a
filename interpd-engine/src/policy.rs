//! Assignment policy: modes, locked mode constants, DR policy, storage
//!
//! The stored policy row is never trusted directly. `effective_policy`
//! applies the locked-parameter invariant at every read boundary: for any
//! mode other than `Custom`, window/gap/weights/penalty are overwritten
//! with the mode constants, so a stale or tampered row cannot desynchronize
//! a locked mode.

use chrono::{DateTime, Utc};
use interpd_common::{Clock, Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Named policy preset controlling weights, thresholds, and DR blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    Balance,
    Urgent,
    Custom,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Balance => "balance",
            Mode::Urgent => "urgent",
            Mode::Custom => "custom",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Mode::Normal),
            "balance" => Ok(Mode::Balance),
            "urgent" => Ok(Mode::Urgent),
            "custom" => Ok(Mode::Custom),
            other => Err(Error::Validation(format!("unknown mode: {other}"))),
        }
    }
}

/// Effective assignment policy for one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentPolicy {
    pub mode: Mode,
    pub fairness_window_days: i64,
    pub max_gap_hours: f64,
    pub w_fairness: f64,
    pub w_urgency: f64,
    pub w_rotation: f64,
    /// Negative number subtracted from a consecutive-DR candidate's total
    pub consecutive_dr_penalty: f64,
    pub auto_assign_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Partial update accepted from the boundary; merged over the latest row.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyPatch {
    pub mode: Option<Mode>,
    pub fairness_window_days: Option<i64>,
    pub max_gap_hours: Option<f64>,
    pub w_fairness: Option<f64>,
    pub w_urgency: Option<f64>,
    pub w_rotation: Option<f64>,
    pub consecutive_dr_penalty: Option<f64>,
    pub auto_assign_enabled: Option<bool>,
}

/// How the consecutive-DR rule treats a repeat candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrBlocking {
    HardBlock,
    SoftPenalty,
    MinimalPenalty,
}

impl DrBlocking {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrBlocking::HardBlock => "hard_block",
            DrBlocking::SoftPenalty => "soft_penalty",
            DrBlocking::MinimalPenalty => "minimal_penalty",
        }
    }
}

/// When a consecutive-DR block/penalty may be bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrOverrideThreshold {
    Never,
    CriticalOnly,
    NoAlternatives,
    Always,
}

/// DR-specific policy derived from the mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrPolicy {
    pub blocking: DrBlocking,
    pub override_threshold: DrOverrideThreshold,
    pub consecutive_penalty: f64,
}

/// Mode constants for the locked-parameter invariant.
///
/// Returns `None` for `Custom`, which honors stored values.
pub fn mode_constants(mode: Mode) -> Option<ModeConstants> {
    match mode {
        Mode::Normal => Some(ModeConstants {
            fairness_window_days: 30,
            max_gap_hours: 5.0,
            w_fairness: 1.2,
            w_urgency: 0.8,
            w_rotation: 0.3,
            consecutive_dr_penalty: -0.5,
        }),
        Mode::Balance => Some(ModeConstants {
            fairness_window_days: 60,
            max_gap_hours: 2.0,
            w_fairness: 2.0,
            w_urgency: 0.6,
            w_rotation: 0.6,
            consecutive_dr_penalty: -0.8,
        }),
        Mode::Urgent => Some(ModeConstants {
            fairness_window_days: 14,
            max_gap_hours: 10.0,
            w_fairness: 0.5,
            w_urgency: 2.5,
            w_rotation: 0.2,
            consecutive_dr_penalty: -0.1,
        }),
        Mode::Custom => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModeConstants {
    pub fairness_window_days: i64,
    pub max_gap_hours: f64,
    pub w_fairness: f64,
    pub w_urgency: f64,
    pub w_rotation: f64,
    pub consecutive_dr_penalty: f64,
}

/// Apply the locked-parameter invariant to a stored policy.
pub fn effective_policy(stored: AssignmentPolicy) -> AssignmentPolicy {
    match mode_constants(stored.mode) {
        Some(c) => AssignmentPolicy {
            fairness_window_days: c.fairness_window_days,
            max_gap_hours: c.max_gap_hours,
            w_fairness: c.w_fairness,
            w_urgency: c.w_urgency,
            w_rotation: c.w_rotation,
            consecutive_dr_penalty: c.consecutive_dr_penalty,
            ..stored
        },
        None => stored,
    }
}

/// DR policy per mode.
///
/// Urgent mode must always be able to find coverage, so it never hard
/// blocks and allows overrides freely.
pub fn dr_policy(mode: Mode, effective: &AssignmentPolicy) -> DrPolicy {
    let (blocking, override_threshold) = match mode {
        Mode::Normal => (DrBlocking::SoftPenalty, DrOverrideThreshold::CriticalOnly),
        Mode::Balance => (DrBlocking::HardBlock, DrOverrideThreshold::NoAlternatives),
        Mode::Urgent => (DrBlocking::MinimalPenalty, DrOverrideThreshold::Always),
        Mode::Custom => (DrBlocking::SoftPenalty, DrOverrideThreshold::NoAlternatives),
    };

    DrPolicy {
        blocking,
        override_threshold,
        consecutive_penalty: effective.consecutive_dr_penalty,
    }
}

/// Field-level validation of a policy patch.
pub fn validate_policy(patch: &PolicyPatch) -> Result<()> {
    let mut problems = Vec::new();

    if let Some(days) = patch.fairness_window_days {
        if days <= 0 {
            problems.push(format!("fairness_window_days must be positive (got {days})"));
        }
    }
    if let Some(gap) = patch.max_gap_hours {
        if gap <= 0.0 {
            problems.push(format!("max_gap_hours must be positive (got {gap})"));
        }
    }
    for (name, value) in [
        ("w_fairness", patch.w_fairness),
        ("w_urgency", patch.w_urgency),
        ("w_rotation", patch.w_rotation),
    ] {
        if let Some(w) = value {
            if w < 0.0 {
                problems.push(format!("{name} must be non-negative (got {w})"));
            }
        }
    }
    if let Some(penalty) = patch.consecutive_dr_penalty {
        if penalty >= 0.0 {
            problems.push(format!(
                "consecutive_dr_penalty must be negative (got {penalty})"
            ));
        }
    }
    // Hard blocking cannot coexist with urgent mode's always-find-coverage
    // goal; the mode table never pairs them, so only a custom patch that
    // asks for urgent alongside a blocking penalty needs rejecting here.
    if patch.mode == Some(Mode::Urgent) {
        if let Some(penalty) = patch.consecutive_dr_penalty {
            if penalty <= -1.0 {
                problems.push(format!(
                    "consecutive_dr_penalty {penalty} would hard-block under urgent mode"
                ));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(problems.join("; ")))
    }
}

/// Database-backed policy store.
///
/// Explicitly constructed and injected; the most recently inserted row is
/// authoritative, and updates append rather than overwrite so policy
/// history stays reconstructable.
#[derive(Clone)]
pub struct PolicyStore {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
}

type PolicyRow = (i64, String, i64, f64, f64, f64, f64, f64, i64, DateTime<Utc>);

impl PolicyStore {
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Load the effective policy, creating NORMAL defaults on first use.
    pub async fn load(&self) -> Result<AssignmentPolicy> {
        let row: Option<PolicyRow> = sqlx::query_as(
            "SELECT id, mode, fairness_window_days, max_gap_hours,
                    w_fairness, w_urgency, w_rotation, consecutive_dr_penalty,
                    auto_assign_enabled, updated_at
             FROM assignment_policies
             ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.db)
        .await?;

        let stored = match row {
            Some(row) => Self::from_row(row)?,
            None => {
                info!("No assignment policy found, creating NORMAL defaults");
                self.insert_defaults().await?
            }
        };

        Ok(effective_policy(stored))
    }

    /// Merge a validated patch over the latest row and append the result.
    pub async fn update(&self, patch: PolicyPatch) -> Result<AssignmentPolicy> {
        validate_policy(&patch)?;

        let current = self.load().await?;
        let merged = AssignmentPolicy {
            mode: patch.mode.unwrap_or(current.mode),
            fairness_window_days: patch
                .fairness_window_days
                .unwrap_or(current.fairness_window_days),
            max_gap_hours: patch.max_gap_hours.unwrap_or(current.max_gap_hours),
            w_fairness: patch.w_fairness.unwrap_or(current.w_fairness),
            w_urgency: patch.w_urgency.unwrap_or(current.w_urgency),
            w_rotation: patch.w_rotation.unwrap_or(current.w_rotation),
            consecutive_dr_penalty: patch
                .consecutive_dr_penalty
                .unwrap_or(current.consecutive_dr_penalty),
            auto_assign_enabled: patch
                .auto_assign_enabled
                .unwrap_or(current.auto_assign_enabled),
            updated_at: self.clock.now(),
        };

        self.insert(&merged).await?;
        info!(mode = merged.mode.as_str(), "Assignment policy updated");

        Ok(effective_policy(merged))
    }

    /// DR policy for the given mode under the current effective policy.
    pub async fn dr_policy_for(&self, mode: Mode) -> Result<DrPolicy> {
        let mut policy = self.load().await?;
        policy.mode = mode;
        let policy = effective_policy(policy);
        Ok(dr_policy(mode, &policy))
    }

    async fn insert_defaults(&self) -> Result<AssignmentPolicy> {
        let defaults = AssignmentPolicy {
            mode: Mode::Normal,
            fairness_window_days: 30,
            max_gap_hours: 5.0,
            w_fairness: 1.2,
            w_urgency: 0.8,
            w_rotation: 0.3,
            consecutive_dr_penalty: -0.5,
            auto_assign_enabled: true,
            updated_at: self.clock.now(),
        };
        self.insert(&defaults).await?;
        Ok(defaults)
    }

    async fn insert(&self, policy: &AssignmentPolicy) -> Result<()> {
        sqlx::query(
            "INSERT INTO assignment_policies
             (mode, fairness_window_days, max_gap_hours, w_fairness, w_urgency,
              w_rotation, consecutive_dr_penalty, auto_assign_enabled, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(policy.mode.as_str())
        .bind(policy.fairness_window_days)
        .bind(policy.max_gap_hours)
        .bind(policy.w_fairness)
        .bind(policy.w_urgency)
        .bind(policy.w_rotation)
        .bind(policy.consecutive_dr_penalty)
        .bind(policy.auto_assign_enabled as i64)
        .bind(policy.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    fn from_row(row: PolicyRow) -> Result<AssignmentPolicy> {
        Ok(AssignmentPolicy {
            mode: row.1.parse()?,
            fairness_window_days: row.2,
            max_gap_hours: row.3,
            w_fairness: row.4,
            w_urgency: row.5,
            w_rotation: row.6,
            consecutive_dr_penalty: row.7,
            auto_assign_enabled: row.8 != 0,
            updated_at: row.9,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interpd_common::db::init::init_memory_database;
    use interpd_common::SystemClock;

    fn store(pool: SqlitePool) -> PolicyStore {
        PolicyStore::new(pool, Arc::new(SystemClock))
    }

    #[test]
    fn balance_mode_locks_weights() {
        let stored = AssignmentPolicy {
            mode: Mode::Balance,
            fairness_window_days: 7,
            max_gap_hours: 99.0,
            w_fairness: 0.1,
            w_urgency: 9.0,
            w_rotation: 9.0,
            consecutive_dr_penalty: -0.01,
            auto_assign_enabled: true,
            updated_at: Utc::now(),
        };
        let eff = effective_policy(stored);
        assert_eq!(eff.fairness_window_days, 60);
        assert_eq!(eff.max_gap_hours, 2.0);
        assert_eq!(eff.w_fairness, 2.0);
        assert_eq!(eff.consecutive_dr_penalty, -0.8);
    }

    #[test]
    fn custom_mode_honors_stored_values() {
        let stored = AssignmentPolicy {
            mode: Mode::Custom,
            fairness_window_days: 7,
            max_gap_hours: 99.0,
            w_fairness: 0.1,
            w_urgency: 9.0,
            w_rotation: 9.0,
            consecutive_dr_penalty: -0.01,
            auto_assign_enabled: true,
            updated_at: Utc::now(),
        };
        let eff = effective_policy(stored.clone());
        assert_eq!(eff.w_fairness, stored.w_fairness);
        assert_eq!(eff.fairness_window_days, stored.fairness_window_days);
    }

    #[test]
    fn validation_rejects_non_negative_dr_penalty() {
        let patch = PolicyPatch {
            consecutive_dr_penalty: Some(0.5),
            ..Default::default()
        };
        let err = validate_policy(&patch).unwrap_err();
        assert!(err.to_string().contains("consecutive_dr_penalty"));
    }

    #[test]
    fn validation_rejects_blocking_penalty_under_urgent() {
        let patch = PolicyPatch {
            mode: Some(Mode::Urgent),
            consecutive_dr_penalty: Some(-1.5),
            ..Default::default()
        };
        assert!(validate_policy(&patch).is_err());
    }

    #[test]
    fn urgent_mode_never_hard_blocks() {
        let eff = effective_policy(AssignmentPolicy {
            mode: Mode::Urgent,
            fairness_window_days: 14,
            max_gap_hours: 10.0,
            w_fairness: 0.5,
            w_urgency: 2.5,
            w_rotation: 0.2,
            consecutive_dr_penalty: -0.1,
            auto_assign_enabled: true,
            updated_at: Utc::now(),
        });
        let dr = dr_policy(Mode::Urgent, &eff);
        assert_eq!(dr.blocking, DrBlocking::MinimalPenalty);
        assert_eq!(dr.override_threshold, DrOverrideThreshold::Always);
    }

    #[tokio::test]
    async fn load_creates_defaults_once() {
        let pool = init_memory_database().await.unwrap();
        let store = store(pool.clone());

        let policy = store.load().await.unwrap();
        assert_eq!(policy.mode, Mode::Normal);
        assert_eq!(policy.fairness_window_days, 30);

        store.load().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assignment_policies")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn update_to_balance_locks_subsequent_loads() {
        let pool = init_memory_database().await.unwrap();
        let store = store(pool);

        store
            .update(PolicyPatch {
                mode: Some(Mode::Balance),
                w_fairness: Some(0.1),
                ..Default::default()
            })
            .await
            .unwrap();

        let policy = store.load().await.unwrap();
        assert_eq!(policy.mode, Mode::Balance);
        // locked constant wins over the patched 0.1
        assert_eq!(policy.w_fairness, 2.0);
    }

    #[tokio::test]
    async fn updates_append_versions() {
        let pool = init_memory_database().await.unwrap();
        let store = store(pool.clone());

        store.load().await.unwrap();
        store
            .update(PolicyPatch {
                mode: Some(Mode::Urgent),
                ..Default::default()
            })
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assignment_policies")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
