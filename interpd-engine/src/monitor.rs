//! Auto-approval load monitor
//!
//! Periodically assesses pool size, escalation/conflict rates over a
//! trailing 24h window, batch latency, deadline violations, and growth,
//! classifies system load, and recommends (or executes) a policy-mode
//! switch. A switch only happens when confidence clears the bar and no
//! manual operator override is active.

use crate::orchestrator::Engine;
use crate::policy::{Mode, PolicyPatch};
use chrono::{DateTime, Duration, Utc};
use interpd_common::events::EngineEvent;
use interpd_common::Result;
use serde::Serialize;
use tracing::{info, warn};

/// Minimum confidence required to execute an automatic switch.
pub const MIN_SWITCH_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Classification thresholds; defaults suit a mid-size installation.
#[derive(Debug, Clone)]
pub struct LoadThresholds {
    pub pool_high: i64,
    pub pool_critical: i64,
    pub escalation_high: f64,
    pub escalation_critical: f64,
    pub conflict_high: f64,
    pub latency_high_ms: f64,
    pub deadline_violations_critical: i64,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            pool_high: 50,
            pool_critical: 100,
            escalation_high: 0.4,
            escalation_critical: 0.7,
            conflict_high: 0.5,
            latency_high_ms: 2_000.0,
            deadline_violations_critical: 5,
        }
    }
}

/// One entry in the ordered mode preference table. The first preference
/// whose ceilings all hold wins.
#[derive(Debug, Clone)]
pub struct ModePreference {
    pub mode: Mode,
    pub min_pool: i64,
    pub max_pool: i64,
    pub max_escalation_rate: f64,
    pub max_conflict_rate: f64,
}

/// Default preference order: stay Normal while quiet, move to Balance as
/// the pool builds, and Urgent when rates climb.
pub fn default_preferences() -> Vec<ModePreference> {
    vec![
        ModePreference {
            mode: Mode::Normal,
            min_pool: 0,
            max_pool: 25,
            max_escalation_rate: 0.2,
            max_conflict_rate: 0.3,
        },
        ModePreference {
            mode: Mode::Balance,
            min_pool: 10,
            max_pool: 80,
            max_escalation_rate: 0.4,
            max_conflict_rate: 0.5,
        },
        ModePreference {
            mode: Mode::Urgent,
            min_pool: 0,
            max_pool: i64::MAX,
            max_escalation_rate: 1.0,
            max_conflict_rate: 1.0,
        },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemLoadAssessment {
    pub pool_size: i64,
    pub escalation_rate: f64,
    pub conflict_rate: f64,
    pub avg_batch_ms: f64,
    pub deadline_violations: i64,
    /// Entries that joined the pool in the trailing hour
    pub pool_growth_1h: i64,
    /// Terminal outcomes observed in the trailing 24h
    pub sample_size: i64,
    pub load_level: LoadLevel,
    pub recommended_mode: Mode,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoSwitchResult {
    pub from_mode: Mode,
    pub to_mode: Mode,
    pub executed: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Assess current system load.
pub async fn evaluate_system_load(
    engine: &Engine,
    thresholds: &LoadThresholds,
    preferences: &[ModePreference],
) -> Result<SystemLoadAssessment> {
    let now = engine.clock.now();
    let since = now - Duration::hours(24);

    let pool_size = engine.pool.size().await?;
    let deadline_violations: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pool_entries WHERE deadline_at <= ?",
    )
    .bind(now)
    .fetch_one(&engine.db)
    .await?;

    let pool_growth_1h: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pool_entries WHERE entered_at >= ?",
    )
    .bind(now - Duration::hours(1))
    .fetch_one(&engine.db)
    .await?;

    let escalated = count_events(engine, "assignment_escalated", since).await?;
    let decided = count_events(engine, "assignment_decided", since).await?;
    let conflicts = count_events(engine, "conflict_detected", since).await?;

    let sample_size = escalated + decided;
    let escalation_rate = rate(escalated, sample_size);
    let conflict_rate = rate(conflicts, sample_size);

    let avg_batch_ms: f64 = sqlx::query_scalar(
        "SELECT COALESCE(AVG(CAST(json_extract(detail, '$.duration_ms') AS REAL)), 0.0)
         FROM assignment_logs
         WHERE event_type = 'pool_batch_completed' AND created_at >= ?",
    )
    .bind(since)
    .fetch_one(&engine.db)
    .await?;

    let load_level = classify_load(
        thresholds,
        pool_size,
        escalation_rate,
        conflict_rate,
        avg_batch_ms,
        deadline_violations,
    );

    let recommended_mode = recommend_mode(
        load_level,
        preferences,
        pool_size,
        escalation_rate,
        conflict_rate,
    );

    let confidence = confidence_score(sample_size, avg_batch_ms, thresholds);

    Ok(SystemLoadAssessment {
        pool_size,
        escalation_rate,
        conflict_rate,
        avg_batch_ms,
        deadline_violations,
        pool_growth_1h,
        sample_size,
        load_level,
        recommended_mode,
        confidence,
    })
}

async fn count_events(engine: &Engine, event_type: &str, since: DateTime<Utc>) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assignment_logs WHERE event_type = ? AND created_at >= ?",
    )
    .bind(event_type)
    .bind(since)
    .fetch_one(&engine.db)
    .await?;
    Ok(count)
}

fn rate(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

pub fn classify_load(
    t: &LoadThresholds,
    pool_size: i64,
    escalation_rate: f64,
    conflict_rate: f64,
    avg_batch_ms: f64,
    deadline_violations: i64,
) -> LoadLevel {
    if pool_size >= t.pool_critical
        || escalation_rate >= t.escalation_critical
        || deadline_violations >= t.deadline_violations_critical
    {
        LoadLevel::Critical
    } else if pool_size >= t.pool_high
        || escalation_rate >= t.escalation_high
        || conflict_rate >= t.conflict_high
        || avg_batch_ms >= t.latency_high_ms
    {
        LoadLevel::High
    } else if pool_size >= t.pool_high / 2
        || escalation_rate >= t.escalation_high / 2.0
        || conflict_rate >= t.conflict_high / 2.0
    {
        LoadLevel::Medium
    } else {
        LoadLevel::Low
    }
}

/// Critical load always recommends Urgent; otherwise the first matching
/// preference wins, falling back to a per-level default.
pub fn recommend_mode(
    level: LoadLevel,
    preferences: &[ModePreference],
    pool_size: i64,
    escalation_rate: f64,
    conflict_rate: f64,
) -> Mode {
    if level == LoadLevel::Critical {
        return Mode::Urgent;
    }

    for pref in preferences {
        if pool_size >= pref.min_pool
            && pool_size <= pref.max_pool
            && escalation_rate <= pref.max_escalation_rate
            && conflict_rate <= pref.max_conflict_rate
        {
            return pref.mode;
        }
    }

    match level {
        LoadLevel::Low => Mode::Normal,
        LoadLevel::Medium => Mode::Balance,
        LoadLevel::High | LoadLevel::Critical => Mode::Urgent,
    }
}

/// Confidence starts at 1.0 and is penalized for a thin 24h sample and
/// for slow batch processing, clamped to [0, 1].
pub fn confidence_score(sample_size: i64, avg_batch_ms: f64, t: &LoadThresholds) -> f64 {
    let mut confidence: f64 = 1.0;
    if sample_size < 10 {
        confidence -= 0.3;
    }
    if sample_size < 3 {
        confidence -= 0.2;
    }
    if avg_batch_ms >= t.latency_high_ms {
        confidence -= 0.2;
    }
    confidence.clamp(0.0, 1.0)
}

/// Operator-set mode override currently in force, if any.
pub async fn active_override(engine: &Engine) -> Result<Option<Mode>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT mode FROM mode_overrides
         WHERE expires_at > ?
         ORDER BY id DESC LIMIT 1",
    )
    .bind(engine.clock.now())
    .fetch_optional(&engine.db)
    .await?;

    match row {
        Some((mode,)) => Ok(Some(mode.parse()?)),
        None => Ok(None),
    }
}

/// Set a manual override for `ttl_hours`; the auto-switcher defers to it
/// until expiry.
pub async fn set_override(
    engine: &Engine,
    mode: Mode,
    set_by: &str,
    ttl_hours: i64,
) -> Result<()> {
    let now = engine.clock.now();
    sqlx::query(
        "INSERT INTO mode_overrides (mode, set_by, set_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(mode.as_str())
    .bind(set_by)
    .bind(now)
    .bind(now + Duration::hours(ttl_hours))
    .execute(&engine.db)
    .await?;

    info!(mode = mode.as_str(), set_by, ttl_hours, "manual mode override set");
    Ok(())
}

pub async fn clear_override(engine: &Engine) -> Result<()> {
    sqlx::query("DELETE FROM mode_overrides").execute(&engine.db).await?;
    Ok(())
}

/// Execute a mode switch to `target` if confidence and override rules
/// permit. Every attempt is recorded, executed or not.
pub async fn execute_auto_switch(
    engine: &Engine,
    target: Mode,
    assessment: &SystemLoadAssessment,
) -> Result<AutoSwitchResult> {
    let current = engine.policy.load().await?.mode;

    let result = if current == target {
        AutoSwitchResult {
            from_mode: current,
            to_mode: target,
            executed: false,
            confidence: assessment.confidence,
            reason: "already in target mode".to_string(),
        }
    } else if let Some(overridden) = active_override(engine).await? {
        AutoSwitchResult {
            from_mode: current,
            to_mode: target,
            executed: false,
            confidence: assessment.confidence,
            reason: format!(
                "manual override active (mode {}), auto-switch suppressed",
                overridden.as_str()
            ),
        }
    } else if assessment.confidence < MIN_SWITCH_CONFIDENCE {
        AutoSwitchResult {
            from_mode: current,
            to_mode: target,
            executed: false,
            confidence: assessment.confidence,
            reason: format!(
                "confidence {:.2} below threshold {MIN_SWITCH_CONFIDENCE}",
                assessment.confidence
            ),
        }
    } else {
        engine
            .policy
            .update(PolicyPatch {
                mode: Some(target),
                ..Default::default()
            })
            .await?;
        AutoSwitchResult {
            from_mode: current,
            to_mode: target,
            executed: true,
            confidence: assessment.confidence,
            reason: format!(
                "load {:?}, pool {}, escalation rate {:.2}",
                assessment.load_level, assessment.pool_size, assessment.escalation_rate
            ),
        }
    };

    if result.executed {
        info!(
            from = result.from_mode.as_str(),
            to = result.to_mode.as_str(),
            "auto mode switch executed"
        );
    } else {
        warn!(
            from = result.from_mode.as_str(),
            to = result.to_mode.as_str(),
            reason = result.reason,
            "auto mode switch not executed"
        );
    }

    engine
        .audit(EngineEvent::ModeSwitchAttempted {
            from_mode: result.from_mode.as_str().to_string(),
            to_mode: result.to_mode.as_str().to_string(),
            executed: result.executed,
            confidence: result.confidence,
            reason: result.reason.clone(),
            timestamp: engine.clock.now(),
        })
        .await;

    Ok(result)
}

/// One monitor tick: assess, then switch if the recommendation differs.
pub async fn monitor_tick(
    engine: &Engine,
    thresholds: &LoadThresholds,
    preferences: &[ModePreference],
) -> Result<SystemLoadAssessment> {
    let assessment = evaluate_system_load(engine, thresholds, preferences).await?;
    let current = engine.policy.load().await?.mode;

    if assessment.recommended_mode != current {
        execute_auto_switch(engine, assessment.recommended_mode, &assessment).await?;
    }

    Ok(assessment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitConfig;
    use crate::policy::PolicyStore;
    use crate::pool::Pool;
    use crate::recovery::DegradationState;
    use chrono::NaiveDateTime;
    use interpd_common::clock::ManualClock;
    use interpd_common::db::init::init_memory_database;
    use interpd_common::events::EventBus;
    use std::sync::Arc;

    fn t() -> LoadThresholds {
        LoadThresholds::default()
    }

    async fn engine_at(s: &str) -> (Engine, Arc<ManualClock>) {
        let db = init_memory_database().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .unwrap()
                .and_utc(),
        ));
        let engine = Engine::new(
            db.clone(),
            clock.clone(),
            PolicyStore::new(db.clone(), clock.clone()),
            Pool::new(db, clock.clone(), 10),
            EventBus::new(16),
            CommitConfig::default(),
            DegradationState::default(),
        );
        (engine, clock)
    }

    fn confident_assessment(recommended: Mode) -> SystemLoadAssessment {
        SystemLoadAssessment {
            pool_size: 60,
            escalation_rate: 0.5,
            conflict_rate: 0.1,
            avg_batch_ms: 50.0,
            deadline_violations: 0,
            pool_growth_1h: 5,
            sample_size: 40,
            load_level: LoadLevel::High,
            recommended_mode: recommended,
            confidence: 1.0,
        }
    }

    #[test]
    fn critical_pool_classifies_critical() {
        assert_eq!(
            classify_load(&t(), 150, 0.0, 0.0, 0.0, 0),
            LoadLevel::Critical
        );
    }

    #[test]
    fn deadline_violations_force_critical() {
        assert_eq!(classify_load(&t(), 0, 0.0, 0.0, 0.0, 5), LoadLevel::Critical);
    }

    #[test]
    fn slow_batches_classify_high() {
        assert_eq!(
            classify_load(&t(), 0, 0.0, 0.0, 2_500.0, 0),
            LoadLevel::High
        );
    }

    #[test]
    fn quiet_system_is_low() {
        assert_eq!(classify_load(&t(), 3, 0.05, 0.05, 50.0, 0), LoadLevel::Low);
    }

    #[test]
    fn critical_always_recommends_urgent() {
        let mode = recommend_mode(LoadLevel::Critical, &default_preferences(), 0, 0.0, 0.0);
        assert_eq!(mode, Mode::Urgent);
    }

    #[test]
    fn preference_order_is_respected() {
        let prefs = default_preferences();
        // quiet: Normal's ceilings hold
        assert_eq!(recommend_mode(LoadLevel::Low, &prefs, 5, 0.1, 0.1), Mode::Normal);
        // pool beyond Normal's ceiling, within Balance's
        assert_eq!(
            recommend_mode(LoadLevel::Medium, &prefs, 40, 0.3, 0.4),
            Mode::Balance
        );
        // everything busted except Urgent's open ceilings
        assert_eq!(
            recommend_mode(LoadLevel::High, &prefs, 90, 0.9, 0.9),
            Mode::Urgent
        );
    }

    #[test]
    fn fallback_uses_load_level_default() {
        // empty preference table
        assert_eq!(recommend_mode(LoadLevel::Medium, &[], 40, 0.3, 0.4), Mode::Balance);
        assert_eq!(recommend_mode(LoadLevel::Low, &[], 5, 0.0, 0.0), Mode::Normal);
    }

    #[tokio::test]
    async fn override_suppresses_auto_switch_until_it_expires() {
        let (engine, clock) = engine_at("2025-03-10 08:00:00").await;
        let assessment = confident_assessment(Mode::Urgent);

        set_override(&engine, Mode::Balance, "dispatcher", 1)
            .await
            .unwrap();

        let result = execute_auto_switch(&engine, Mode::Urgent, &assessment)
            .await
            .unwrap();
        assert!(!result.executed);
        assert!(result.reason.contains("override"), "{}", result.reason);
        assert_eq!(engine.policy.load().await.unwrap().mode, Mode::Normal);

        // one-hour TTL lapses: the same switch now goes through
        clock.advance(Duration::hours(2));
        assert!(active_override(&engine).await.unwrap().is_none());

        let result = execute_auto_switch(&engine, Mode::Urgent, &assessment)
            .await
            .unwrap();
        assert!(result.executed, "{}", result.reason);
        assert_eq!(engine.policy.load().await.unwrap().mode, Mode::Urgent);
    }

    #[tokio::test]
    async fn low_confidence_blocks_the_switch() {
        let (engine, _clock) = engine_at("2025-03-10 08:00:00").await;
        let mut assessment = confident_assessment(Mode::Urgent);
        assessment.confidence = 0.5;

        let result = execute_auto_switch(&engine, Mode::Urgent, &assessment)
            .await
            .unwrap();
        assert!(!result.executed);
        assert!(result.reason.contains("confidence"), "{}", result.reason);
        assert_eq!(engine.policy.load().await.unwrap().mode, Mode::Normal);
    }

    #[test]
    fn confidence_penalizes_thin_samples_and_latency() {
        let t = t();
        assert_eq!(confidence_score(50, 100.0, &t), 1.0);
        assert!((confidence_score(5, 100.0, &t) - 0.7).abs() < 1e-9);
        assert!((confidence_score(1, 100.0, &t) - 0.5).abs() < 1e-9);
        assert!((confidence_score(50, 3_000.0, &t) - 0.8).abs() < 1e-9);
        assert!(confidence_score(1, 3_000.0, &t) < MIN_SWITCH_CONFIDENCE);
    }
}
