//! Ranking engine: hard gap filter and multi-criteria candidate ordering
//!
//! Fairness favors the least-loaded candidate, urgency is shared across all
//! candidates (the differentiator is fairness and DR history), and the
//! rotation term mildly disfavors whoever holds the most recent assignment.
//! A hard gap filter runs before scoring; for urgent bookings it relaxes to
//! twice the gap and finally drops away entirely so fairness alone can
//! never block coverage.

use crate::fairness::HoursSnapshot;
use crate::policy::AssignmentPolicy;
use crate::scoring::DrOutcome;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Ephemeral ranking output for one candidate.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateResult {
    pub interpreter_id: Uuid,
    pub fairness: f64,
    pub urgency: f64,
    pub rotation: f64,
    pub dr_penalty: f64,
    pub total: f64,
    pub current_hours: f64,
    pub eligible: bool,
    pub ineligible_reason: Option<String>,
}

/// How the gap filter ended up being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GapFilterMode {
    Strict,
    Relaxed,
    Bypassed,
}

/// Candidates surviving the hard gap filter, with the filter mode used.
///
/// Simulates adding the booking's duration to each candidate; a candidate
/// whose simulated assignment would stretch the max-min spread beyond
/// `max_gap_hours` is excluded. Urgent bookings relax the bound to double,
/// and if nothing survives even that, the filter is bypassed.
pub fn apply_gap_filter(
    candidates: &[Uuid],
    hours: &HoursSnapshot,
    booking_hours: f64,
    max_gap_hours: f64,
    urgent: bool,
) -> (Vec<Uuid>, GapFilterMode) {
    let strict = filter_at(candidates, hours, booking_hours, max_gap_hours);
    if !strict.is_empty() {
        return (strict, GapFilterMode::Strict);
    }

    if urgent {
        let relaxed = filter_at(candidates, hours, booking_hours, 2.0 * max_gap_hours);
        if !relaxed.is_empty() {
            return (relaxed, GapFilterMode::Relaxed);
        }
        return (candidates.to_vec(), GapFilterMode::Bypassed);
    }

    (strict, GapFilterMode::Strict)
}

fn filter_at(
    candidates: &[Uuid],
    hours: &HoursSnapshot,
    booking_hours: f64,
    gap_limit: f64,
) -> Vec<Uuid> {
    candidates
        .iter()
        .copied()
        .filter(|candidate| {
            let mut simulated: BTreeMap<Uuid, f64> = hours.clone();
            *simulated.entry(*candidate).or_insert(0.0) += booking_hours;

            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for h in simulated.values() {
                min = min.min(*h);
                max = max.max(*h);
            }
            max - min <= gap_limit
        })
        .collect()
}

/// Rank candidates descending by total score.
///
/// Ties break toward lower current hours, then lexical id order, so the
/// result is deterministic for identical inputs.
pub fn rank(
    candidates: &[Uuid],
    hours: &HoursSnapshot,
    urgency: f64,
    policy: &AssignmentPolicy,
    dr_outcomes: &BTreeMap<Uuid, DrOutcome>,
    last_assigned: Option<Uuid>,
) -> Vec<CandidateResult> {
    let min_hours = candidates
        .iter()
        .map(|id| hours.get(id).copied().unwrap_or(0.0))
        .fold(f64::INFINITY, f64::min);

    let mut results: Vec<CandidateResult> = candidates
        .iter()
        .map(|id| {
            let current_hours = hours.get(id).copied().unwrap_or(0.0);

            let fairness = if policy.max_gap_hours > 0.0 {
                (1.0 - (current_hours - min_hours) / policy.max_gap_hours).clamp(0.0, 1.0)
            } else {
                1.0
            };

            let rotation = if last_assigned == Some(*id) { 0.0 } else { 1.0 };

            let (dr_penalty, eligible, ineligible_reason) =
                match dr_outcomes.get(id).unwrap_or(&DrOutcome::Clear) {
                    DrOutcome::Clear => (0.0, true, None),
                    DrOutcome::Penalty { amount, .. } => (*amount, true, None),
                    DrOutcome::Blocked { reason } => (0.0, false, Some(reason.clone())),
                };

            let total = policy.w_fairness * fairness
                + policy.w_urgency * urgency
                + policy.w_rotation * rotation
                + dr_penalty;

            CandidateResult {
                interpreter_id: *id,
                fairness,
                urgency,
                rotation,
                dr_penalty,
                total,
                current_hours,
                eligible,
                ineligible_reason,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.current_hours
                    .partial_cmp(&b.current_hours)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.interpreter_id.cmp(&b.interpreter_id))
    });

    results
}

/// Top eligible candidate, if any.
pub fn recommendation(ranked: &[CandidateResult]) -> Option<&CandidateResult> {
    ranked.iter().find(|c| c.eligible)
}
