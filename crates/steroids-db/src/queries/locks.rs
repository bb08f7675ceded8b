//! Query functions for the `task_locks` table.
//!
//! One active lock per task. Acquisition steals expired locks; refresh
//! and release are guarded by the owning runner id so a runner that lost
//! its lock cannot silently keep mutating.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::TaskLock;

/// Acquire (or re-acquire, or steal-if-expired) the lock on a task.
///
/// Returns `true` when this runner holds the lock afterwards.
pub async fn acquire(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    runner_id: Uuid,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<bool> {
    let expires_at = now + ttl;
    let result = sqlx::query(
        "INSERT INTO task_locks (task_id, runner_id, acquired_at, expires_at, heartbeat_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(task_id) DO UPDATE SET \
             runner_id = excluded.runner_id, \
             acquired_at = excluded.acquired_at, \
             expires_at = excluded.expires_at, \
             heartbeat_at = excluded.heartbeat_at \
         WHERE task_locks.runner_id = excluded.runner_id \
            OR task_locks.expires_at <= excluded.acquired_at",
    )
    .bind(task_id)
    .bind(runner_id)
    .bind(now)
    .bind(expires_at)
    .bind(now)
    .execute(ex)
    .await
    .context("failed to acquire task lock")?;

    Ok(result.rows_affected() == 1)
}

/// Refresh an owned lock, extending the expiry. 0 rows means the lock is
/// gone or owned by another runner.
pub async fn refresh(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    runner_id: Uuid,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<u64> {
    let expires_at = now + ttl;
    let result = sqlx::query(
        "UPDATE task_locks SET expires_at = ?, heartbeat_at = ? \
         WHERE task_id = ? AND runner_id = ?",
    )
    .bind(expires_at)
    .bind(now)
    .bind(task_id)
    .bind(runner_id)
    .execute(ex)
    .await
    .context("failed to refresh task lock")?;

    Ok(result.rows_affected())
}

/// Release an owned lock.
pub async fn release(
    ex: impl SqliteExecutor<'_>,
    task_id: Uuid,
    runner_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query("DELETE FROM task_locks WHERE task_id = ? AND runner_id = ?")
        .bind(task_id)
        .bind(runner_id)
        .execute(ex)
        .await
        .context("failed to release task lock")?;

    Ok(result.rows_affected())
}

/// Delete a lock regardless of owner (recovery sweep).
pub async fn force_release(ex: impl SqliteExecutor<'_>, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM task_locks WHERE task_id = ?")
        .bind(task_id)
        .execute(ex)
        .await
        .context("failed to force-release task lock")?;

    Ok(result.rows_affected())
}

/// Fetch the lock row for a task, if any.
pub async fn get(pool: &SqlitePool, task_id: Uuid) -> Result<Option<TaskLock>> {
    let lock = sqlx::query_as::<_, TaskLock>("SELECT * FROM task_locks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task lock")?;

    Ok(lock)
}

/// All lock rows (recovery sweep input).
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<TaskLock>> {
    let locks = sqlx::query_as::<_, TaskLock>("SELECT * FROM task_locks ORDER BY acquired_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list task locks")?;

    Ok(locks)
}
