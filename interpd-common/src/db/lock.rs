//! Advisory locks over the datastore
//!
//! SQLite has no server-side named-lock primitive, so a lock is a row in
//! `advisory_locks` claimed with an atomic INSERT. Expired rows may be taken
//! over. Acquisition waits with backoff up to a bound, then fails loudly
//! with `Error::LockTimeout` rather than hanging.

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::time::Duration as StdDuration;

const POLL_INTERVAL_MS: u64 = 50;

/// Acquire the named lock for `holder`, waiting up to `wait_timeout_ms`.
///
/// `ttl_secs` bounds how long a crashed holder can wedge the lock: once
/// `expires_at` passes, any waiter may take the row over.
pub async fn acquire_lock(
    pool: &SqlitePool,
    key: &str,
    holder: &str,
    ttl_secs: i64,
    wait_timeout_ms: u64,
) -> Result<()> {
    let deadline = Utc::now() + Duration::milliseconds(wait_timeout_ms as i64);

    loop {
        let now = Utc::now();
        if try_claim(pool, key, holder, now, ttl_secs).await? {
            return Ok(());
        }

        if Utc::now() >= deadline {
            return Err(Error::LockTimeout(format!(
                "could not acquire advisory lock '{key}' within {wait_timeout_ms} ms"
            )));
        }

        tokio::time::sleep(StdDuration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

async fn try_claim(
    pool: &SqlitePool,
    key: &str,
    holder: &str,
    now: DateTime<Utc>,
    ttl_secs: i64,
) -> Result<bool> {
    let expires = now + Duration::seconds(ttl_secs);

    // Single statement: claim a free key, or take over an expired one.
    // The WHERE clause on the upsert makes the takeover atomic.
    let result = sqlx::query(
        r#"
        INSERT INTO advisory_locks (key, holder, acquired_at, expires_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET
            holder = excluded.holder,
            acquired_at = excluded.acquired_at,
            expires_at = excluded.expires_at
        WHERE advisory_locks.expires_at <= ?
           OR advisory_locks.holder = excluded.holder
        "#,
    )
    .bind(key)
    .bind(holder)
    .bind(now)
    .bind(expires)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Release a lock held by `holder`. Releasing a lock you no longer hold
/// (expired and taken over) is a no-op, not an error.
pub async fn release_lock(pool: &SqlitePool, key: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM advisory_locks WHERE key = ? AND holder = ?")
        .bind(key)
        .bind(holder)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::init_memory_database;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let pool = init_memory_database().await.unwrap();

        acquire_lock(&pool, "capacity", "run-a", 30, 200).await.unwrap();

        let err = acquire_lock(&pool, "capacity", "run-b", 30, 150)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout(_)));

        release_lock(&pool, "capacity", "run-a").await.unwrap();
        acquire_lock(&pool, "capacity", "run-b", 30, 200).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let pool = init_memory_database().await.unwrap();

        // TTL of zero expires immediately
        acquire_lock(&pool, "capacity", "crashed", 0, 200).await.unwrap();
        acquire_lock(&pool, "capacity", "run-b", 30, 500).await.unwrap();

        let holder: String =
            sqlx::query_scalar("SELECT holder FROM advisory_locks WHERE key = 'capacity'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(holder, "run-b");
    }

    #[tokio::test]
    async fn reacquire_by_same_holder_refreshes() {
        let pool = init_memory_database().await.unwrap();

        acquire_lock(&pool, "capacity", "run-a", 30, 200).await.unwrap();
        acquire_lock(&pool, "capacity", "run-a", 30, 200).await.unwrap();

        release_lock(&pool, "capacity", "run-a").await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM advisory_locks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
