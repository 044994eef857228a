//! End-to-end engine flows against an in-memory database.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use interpd_common::clock::ManualClock;
use interpd_common::db::init::init_memory_database;
use interpd_common::events::EventBus;
use interpd_engine::commit::CommitConfig;
use interpd_engine::orchestrator::{Engine, RunResult};
use interpd_engine::policy::{Mode, PolicyPatch, PolicyStore};
use interpd_engine::pool::Pool;
use interpd_engine::recovery::{self, DegradationLevel, DegradationState, ProcessingOutcome};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

fn at(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .unwrap()
        .and_utc()
}

const NOW: &str = "2025-03-10 08:00:00";

async fn engine() -> (Engine, Arc<ManualClock>) {
    let db = init_memory_database().await.unwrap();
    let clock = Arc::new(ManualClock::new(at(NOW)));
    let engine = Engine::new(
        db.clone(),
        clock.clone(),
        PolicyStore::new(db.clone(), clock.clone()),
        Pool::new(db, clock.clone(), 10),
        EventBus::new(64),
        CommitConfig {
            retries: 2,
            backoff_ms: 1,
            lock_wait_ms: 500,
        },
        DegradationState::default(),
    );
    (engine, clock)
}

async fn insert_interpreter(db: &SqlitePool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO interpreters (id, name) VALUES (?, ?)")
        .bind(id)
        .bind(format!("interp-{}", &id.to_string()[..8]))
        .execute(db)
        .await
        .unwrap();
    id
}

async fn insert_booking(
    db: &SqlitePool,
    meeting_type: &str,
    start: DateTime<Utc>,
    hours: i64,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO bookings
         (id, start_time, end_time, meeting_type, status, owner_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'waiting', ?, ?, ?)",
    )
    .bind(id)
    .bind(start)
    .bind(start + Duration::hours(hours))
    .bind(meeting_type)
    .bind(Uuid::new_v4())
    .bind(at(NOW))
    .bind(at(NOW))
    .execute(db)
    .await
    .unwrap();
    id
}

async fn assigned_to(db: &SqlitePool, booking_id: Uuid) -> Option<Uuid> {
    sqlx::query_scalar("SELECT interpreter_id FROM bookings WHERE id = ?")
        .bind(booking_id)
        .fetch_one(db)
        .await
        .unwrap()
}

#[tokio::test]
async fn urgent_booking_gets_assigned() {
    let (engine, _) = engine().await;
    let interp = insert_interpreter(&engine.db).await;
    // one day out, inside the 3-day urgent threshold for 'other'
    let booking = insert_booking(&engine.db, "other", at("2025-03-11 10:00:00"), 2).await;

    let result = engine.run_assignment(booking).await.unwrap();
    assert_eq!(
        result,
        RunResult::Assigned {
            interpreter_id: interp
        }
    );
    assert_eq!(assigned_to(&engine.db, booking).await, Some(interp));
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let (engine, _) = engine().await;
    insert_interpreter(&engine.db).await;
    let booking = insert_booking(&engine.db, "other", at("2025-03-11 10:00:00"), 2).await;

    let first = engine.run_assignment(booking).await.unwrap();
    let second = engine.run_assignment(booking).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn concurrent_runs_assign_at_most_once() {
    let (engine, _) = engine().await;
    insert_interpreter(&engine.db).await;
    insert_interpreter(&engine.db).await;
    let booking = insert_booking(&engine.db, "other", at("2025-03-11 10:00:00"), 2).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = engine.clone();
        handles.push(tokio::spawn(
            async move { engine.run_assignment(booking).await },
        ));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            RunResult::Assigned { interpreter_id } => winners.push(interpreter_id),
            RunResult::Escalated { reason } => panic!("unexpected escalation: {reason}"),
        }
    }

    // every run reports the same single winner
    winners.dedup();
    assert_eq!(winners.len(), 1);
    assert_eq!(assigned_to(&engine.db, booking).await, Some(winners[0]));
}

#[tokio::test]
async fn non_urgent_booking_is_pooled() {
    let (engine, _) = engine().await;
    insert_interpreter(&engine.db).await;
    // ten days out, beyond the 3-day urgent threshold
    let booking = insert_booking(&engine.db, "other", at("2025-03-20 10:00:00"), 2).await;

    match engine.run_assignment(booking).await.unwrap() {
        RunResult::Escalated { reason } => assert!(reason.contains("pooled"), "{reason}"),
        other => panic!("expected pooling escalation, got {other:?}"),
    }

    assert!(engine.pool.get(booking).await.unwrap().is_some());
    assert_eq!(assigned_to(&engine.db, booking).await, None);
}

#[tokio::test]
async fn pooled_booking_assigned_once_threshold_reached() {
    let (engine, clock) = engine().await;
    let interp = insert_interpreter(&engine.db).await;
    let booking = insert_booking(&engine.db, "other", at("2025-03-20 10:00:00"), 2).await;

    engine.run_assignment(booking).await.unwrap();
    assert!(engine.pool.get(booking).await.unwrap().is_some());

    // past the 7-day wait threshold: the ready batch picks it up
    clock.set(at("2025-03-17 09:00:00"));
    let results = recovery::process_ready_entries(&engine).await.unwrap();

    assert_eq!(results.len(), 1);
    assert!(matches!(
        results[0].outcome,
        ProcessingOutcome::Assigned { interpreter_id } if interpreter_id == interp
    ));
    assert!(engine.pool.get(booking).await.unwrap().is_none());
}

#[tokio::test]
async fn emergency_degradation_escalates_batch_without_assigning() {
    let (engine, _) = engine().await;
    // a free interpreter exists, so any assignment attempt would succeed
    insert_interpreter(&engine.db).await;
    let booking = insert_booking(&engine.db, "other", at("2025-03-20 10:00:00"), 2).await;

    engine.run_assignment(booking).await.unwrap();
    sqlx::query("UPDATE pool_entries SET status = 'ready' WHERE booking_id = ?")
        .bind(booking)
        .execute(&engine.db)
        .await
        .unwrap();

    engine.degradation.set(DegradationLevel::Emergency);
    let results = recovery::process_ready_entries(&engine).await.unwrap();

    assert_eq!(results.len(), 1);
    match &results[0].outcome {
        ProcessingOutcome::Escalated { reason } => {
            assert!(reason.contains("emergency"), "{reason}")
        }
        other => panic!("expected escalation, got {other:?}"),
    }
    assert!(engine.pool.get(booking).await.unwrap().is_none());
    assert_eq!(assigned_to(&engine.db, booking).await, None);
}

#[tokio::test]
async fn no_candidates_escalates() {
    let (engine, _) = engine().await;
    let booking = insert_booking(&engine.db, "other", at("2025-03-11 10:00:00"), 2).await;

    match engine.run_assignment(booking).await.unwrap() {
        RunResult::Escalated { reason } => {
            assert!(reason.contains("no active interpreters"), "{reason}")
        }
        other => panic!("expected escalation, got {other:?}"),
    }
}

#[tokio::test]
async fn busy_interpreter_is_skipped_for_free_one() {
    let (engine, _) = engine().await;
    let busy = insert_interpreter(&engine.db).await;
    let free = insert_interpreter(&engine.db).await;

    // busy already covers an overlapping approved booking
    sqlx::query(
        "INSERT INTO bookings
         (id, start_time, end_time, meeting_type, status, interpreter_id,
          owner_id, created_at, updated_at)
         VALUES (?, ?, ?, 'other', 'approved', ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(at("2025-03-11 09:00:00"))
    .bind(at("2025-03-11 12:00:00"))
    .bind(busy)
    .bind(Uuid::new_v4())
    .bind(at(NOW))
    .bind(at(NOW))
    .execute(&engine.db)
    .await
    .unwrap();

    let booking = insert_booking(&engine.db, "other", at("2025-03-11 10:00:00"), 2).await;
    let result = engine.run_assignment(booking).await.unwrap();
    assert_eq!(
        result,
        RunResult::Assigned {
            interpreter_id: free
        }
    );
}

#[tokio::test]
async fn consecutive_dr_hard_blocked_under_balance() {
    let (engine, _) = engine().await;
    let repeat = insert_interpreter(&engine.db).await;
    let fresh = insert_interpreter(&engine.db).await;

    engine
        .policy
        .update(PolicyPatch {
            mode: Some(Mode::Balance),
            ..Default::default()
        })
        .await
        .unwrap();

    // repeat held the most recent DR meeting
    sqlx::query(
        "INSERT INTO bookings
         (id, start_time, end_time, meeting_type, status, interpreter_id,
          owner_id, created_at, updated_at)
         VALUES (?, ?, ?, 'dr', 'approved', ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(at("2025-03-08 10:00:00"))
    .bind(at("2025-03-08 12:00:00"))
    .bind(repeat)
    .bind(Uuid::new_v4())
    .bind(at(NOW))
    .bind(at(NOW))
    .execute(&engine.db)
    .await
    .unwrap();

    // dr urgent threshold is 7 days, so 2 days out is immediate
    let booking = insert_booking(&engine.db, "dr", at("2025-03-12 10:00:00"), 2).await;
    let result = engine.run_assignment(booking).await.unwrap();
    assert_eq!(
        result,
        RunResult::Assigned {
            interpreter_id: fresh
        }
    );
}

#[tokio::test]
async fn cancelled_booking_is_removed_and_escalated() {
    let (engine, _) = engine().await;
    insert_interpreter(&engine.db).await;
    let booking = insert_booking(&engine.db, "other", at("2025-03-20 10:00:00"), 2).await;
    engine.run_assignment(booking).await.unwrap();

    sqlx::query("UPDATE bookings SET status = 'cancelled' WHERE id = ?")
        .bind(booking)
        .execute(&engine.db)
        .await
        .unwrap();

    match engine.run_assignment(booking).await.unwrap() {
        RunResult::Escalated { reason } => assert!(reason.contains("cancelled"), "{reason}"),
        other => panic!("expected escalation, got {other:?}"),
    }
    assert!(engine.pool.get(booking).await.unwrap().is_none());
}

#[tokio::test]
async fn disabled_auto_assign_escalates() {
    let (engine, _) = engine().await;
    insert_interpreter(&engine.db).await;
    engine
        .policy
        .update(PolicyPatch {
            auto_assign_enabled: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();

    let booking = insert_booking(&engine.db, "other", at("2025-03-11 10:00:00"), 2).await;
    match engine.run_assignment(booking).await.unwrap() {
        RunResult::Escalated { reason } => assert!(reason.contains("disabled"), "{reason}"),
        other => panic!("expected escalation, got {other:?}"),
    }
}

#[tokio::test]
async fn fairness_prefers_lower_hours() {
    let (engine, _) = engine().await;
    let loaded = insert_interpreter(&engine.db).await;
    let light = insert_interpreter(&engine.db).await;

    // loaded already has 6 assigned hours inside the window
    sqlx::query(
        "INSERT INTO bookings
         (id, start_time, end_time, meeting_type, status, interpreter_id,
          owner_id, created_at, updated_at)
         VALUES (?, ?, ?, 'other', 'approved', ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(at("2025-03-05 08:00:00"))
    .bind(at("2025-03-05 14:00:00"))
    .bind(loaded)
    .bind(Uuid::new_v4())
    .bind(at(NOW))
    .bind(at(NOW))
    .execute(&engine.db)
    .await
    .unwrap();

    let booking = insert_booking(&engine.db, "other", at("2025-03-11 10:00:00"), 2).await;
    let result = engine.run_assignment(booking).await.unwrap();
    assert_eq!(
        result,
        RunResult::Assigned {
            interpreter_id: light
        }
    );
}
