//! Database initialization
//!
//! Creates the SQLite schema on first run and reopens it idempotently
//! afterwards. WAL mode and a busy timeout keep concurrent orchestrator
//! runs from failing on short lock contention; longer contention is handled
//! by the commit retry layer.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection pool and create tables if needed.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    configure_and_migrate(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests; same schema and pragmas.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    configure_and_migrate(&pool).await?;
    Ok(pool)
}

async fn configure_and_migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    // WAL allows concurrent readers with one writer; critical for
    // overlapping orchestrator runs and pool batch ticks
    sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(pool).await?;

    // Idempotent schema creation
    create_interpreters_table(pool).await?;
    create_bookings_table(pool).await?;
    create_policies_table(pool).await?;
    create_meeting_type_priorities_table(pool).await?;
    create_pool_entries_table(pool).await?;
    create_assignment_logs_table(pool).await?;
    create_advisory_locks_table(pool).await?;
    create_mode_overrides_table(pool).await?;

    seed_default_priorities(pool).await?;

    Ok(())
}

async fn create_interpreters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS interpreters (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            is_interpreter INTEGER NOT NULL DEFAULT 1,
            environment TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_bookings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bookings (
            id TEXT PRIMARY KEY,
            start_time TIMESTAMP NOT NULL,
            end_time TIMESTAMP NOT NULL,
            meeting_type TEXT NOT NULL,
            sub_scope TEXT,
            status TEXT NOT NULL DEFAULT 'waiting',
            interpreter_id TEXT,
            owner_id TEXT NOT NULL,
            environment TEXT,
            chair_id TEXT,
            detail TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Conflict detection scans by interpreter and time range
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bookings_interpreter_start
         ON bookings (interpreter_id, start_time)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_bookings_status_start
         ON bookings (status, start_time)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_policies_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assignment_policies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mode TEXT NOT NULL DEFAULT 'normal',
            fairness_window_days INTEGER NOT NULL DEFAULT 30,
            max_gap_hours REAL NOT NULL DEFAULT 5.0,
            w_fairness REAL NOT NULL DEFAULT 1.2,
            w_urgency REAL NOT NULL DEFAULT 0.8,
            w_rotation REAL NOT NULL DEFAULT 0.3,
            consecutive_dr_penalty REAL NOT NULL DEFAULT -0.5,
            auto_assign_enabled INTEGER NOT NULL DEFAULT 1,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_meeting_type_priorities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meeting_type_priorities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            meeting_type TEXT NOT NULL,
            priority REAL NOT NULL DEFAULT 1.0,
            urgent_threshold_days INTEGER NOT NULL,
            general_threshold_days INTEGER NOT NULL,
            mode TEXT,
            environment TEXT,
            CHECK (urgent_threshold_days < general_threshold_days)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_pool_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pool_entries (
            booking_id TEXT PRIMARY KEY,
            entered_at TIMESTAMP NOT NULL,
            deadline_at TIMESTAMP NOT NULL,
            mode_at_entry TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'waiting',
            processing_since TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pool_entries_status_deadline
         ON pool_entries (status, deadline_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_assignment_logs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assignment_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            booking_id TEXT,
            detail TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_assignment_logs_type_time
         ON assignment_logs (event_type, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_advisory_locks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS advisory_locks (
            key TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at TIMESTAMP NOT NULL,
            expires_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_mode_overrides_table(pool: &SqlitePool) -> Result<()> {
    // Manual mode override set by an operator; the auto-switcher must not
    // fight it until it expires
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mode_overrides (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mode TEXT NOT NULL,
            set_by TEXT NOT NULL,
            set_at TIMESTAMP NOT NULL,
            expires_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Seed default per-type thresholds when the table is empty.
///
/// DR meetings carry higher priority and a wider urgency horizon than the
/// generic category.
async fn seed_default_priorities(pool: &SqlitePool) -> Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM meeting_type_priorities")
        .fetch_one(pool)
        .await?;

    if count > 0 {
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO meeting_type_priorities
         (meeting_type, priority, urgent_threshold_days, general_threshold_days)
         VALUES ('dr', 3.0, 7, 14), ('other', 1.0, 3, 7)",
    )
    .execute(pool)
    .await?;

    info!("Seeded default meeting type priorities");
    Ok(())
}
