//! Audit event types and the event bus
//!
//! Every consequential engine decision is described by one `EngineEvent`
//! variant with a fixed payload schema, broadcast in-process via `EventBus`
//! and persisted to `assignment_logs`. Emission is lossy on both paths:
//! a full channel or a failed log write must never fail the decision that
//! produced the event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use uuid::Uuid;

/// One scored candidate as recorded in an assignment decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateScoreDetail {
    pub interpreter_id: Uuid,
    pub fairness: f64,
    pub urgency: f64,
    pub rotation: f64,
    pub dr_penalty: f64,
    pub total: f64,
    pub eligible: bool,
}

/// Engine audit events.
///
/// Serialized form is tagged by `type`; payloads are fixed structs per
/// variant, never free-form maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Terminal outcome: an interpreter was committed
    AssignmentDecided {
        booking_id: Uuid,
        interpreter_id: Uuid,
        mode: String,
        urgency_score: f64,
        candidates: Vec<CandidateScoreDetail>,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// Terminal outcome: no automatic assignment, manual handling required
    AssignmentEscalated {
        booking_id: Uuid,
        reason: String,
        mode: String,
        timestamp: DateTime<Utc>,
    },

    /// A candidate was rejected for a schedule or chairperson overlap
    ConflictDetected {
        booking_id: Uuid,
        interpreter_id: Uuid,
        conflicting_booking_id: Option<Uuid>,
        chair_conflict: bool,
        timestamp: DateTime<Utc>,
    },

    /// Outcome of the consecutive-DR rule for one candidate
    DrPolicyDecision {
        booking_id: Uuid,
        interpreter_id: Uuid,
        blocking: String,
        blocked: bool,
        penalty_applied: f64,
        override_condition: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Summary of one pool batch run
    PoolBatchCompleted {
        kind: String,
        processed: u32,
        assigned: u32,
        escalated: u32,
        failed: u32,
        purged: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An auto-switch attempt, whether executed or rejected
    ModeSwitchAttempted {
        from_mode: String,
        to_mode: String,
        executed: bool,
        confidence: f64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Degradation ladder moved up or down
    DegradationChanged {
        from_level: String,
        to_level: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Stable type tag, used as the indexed `event_type` column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            EngineEvent::AssignmentDecided { .. } => "assignment_decided",
            EngineEvent::AssignmentEscalated { .. } => "assignment_escalated",
            EngineEvent::ConflictDetected { .. } => "conflict_detected",
            EngineEvent::DrPolicyDecision { .. } => "dr_policy_decision",
            EngineEvent::PoolBatchCompleted { .. } => "pool_batch_completed",
            EngineEvent::ModeSwitchAttempted { .. } => "mode_switch_attempted",
            EngineEvent::DegradationChanged { .. } => "degradation_changed",
        }
    }

    /// Booking this event concerns, when there is one.
    pub fn booking_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::AssignmentDecided { booking_id, .. }
            | EngineEvent::AssignmentEscalated { booking_id, .. }
            | EngineEvent::ConflictDetected { booking_id, .. }
            | EngineEvent::DrPolicyDecision { booking_id, .. } => Some(*booking_id),
            _ => None,
        }
    }
}

/// In-process broadcast bus for engine events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Broadcast without caring whether anyone listens. A send error only
    /// means there are no subscribers.
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Persist an event to `assignment_logs`. Failures are logged and swallowed;
/// the degradation ladder decides whether this is called at all.
pub async fn log_event(db: &SqlitePool, event: &EngineEvent) {
    let detail = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize engine event");
            return;
        }
    };

    let result = sqlx::query(
        "INSERT INTO assignment_logs (event_type, booking_id, detail, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(event.type_tag())
    .bind(event.booking_id())
    .bind(&detail)
    .bind(Utc::now())
    .execute(db)
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, event_type = event.type_tag(), "failed to persist engine event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::AssignmentEscalated {
            booking_id: Uuid::new_v4(),
            reason: "auto-assign disabled".to_string(),
            mode: "normal".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"AssignmentEscalated\""));
    }

    #[test]
    fn type_tag_matches_variant() {
        let event = EngineEvent::PoolBatchCompleted {
            kind: "ready".to_string(),
            processed: 3,
            assigned: 2,
            escalated: 1,
            failed: 0,
            purged: 0,
            duration_ms: 12,
            timestamp: Utc::now(),
        };
        assert_eq!(event.type_tag(), "pool_batch_completed");
        assert!(event.booking_id().is_none());
    }

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit_lossy(EngineEvent::DegradationChanged {
            from_level: "normal".to_string(),
            to_level: "reduced_logging".to_string(),
            reason: "failure rate".to_string(),
            timestamp: Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.type_tag(), "degradation_changed");
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(1);
        bus.emit_lossy(EngineEvent::AssignmentEscalated {
            booking_id: Uuid::new_v4(),
            reason: "no subscribers".to_string(),
            mode: "normal".to_string(),
            timestamp: Utc::now(),
        });
    }
}
