//! Query functions for the global `runners` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{Runner, RunnerStatus};

/// Register a runner process.
pub async fn register(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    pid: Option<i64>,
    project_path: &str,
    parallel_session_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Runner> {
    let runner = sqlx::query_as::<_, Runner>(
        "INSERT INTO runners (id, pid, project_path, parallel_session_id, heartbeat_at, started_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(pid)
    .bind(project_path)
    .bind(parallel_session_id)
    .bind(now)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to register runner")?;

    Ok(runner)
}

/// Fetch a runner by id.
pub async fn get(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<Option<Runner>> {
    let runner = sqlx::query_as::<_, Runner>("SELECT * FROM runners WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch runner")?;

    Ok(runner)
}

/// All runner rows.
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Runner>> {
    let runners = sqlx::query_as::<_, Runner>("SELECT * FROM runners ORDER BY started_at ASC")
        .fetch_all(pool)
        .await
        .context("failed to list runners")?;

    Ok(runners)
}

/// Bump the heartbeat and optionally the current task pointer.
pub async fn heartbeat(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    current_task_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runners SET heartbeat_at = ?, current_task_id = ? WHERE id = ?",
    )
    .bind(now)
    .bind(current_task_id)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to heartbeat runner")?;

    Ok(result.rows_affected())
}

/// Set a runner's status.
pub async fn set_status(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    status: RunnerStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE runners SET status = ?, heartbeat_at = ? WHERE id = ?")
        .bind(status)
        .bind(now)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to set runner status")?;

    Ok(result.rows_affected())
}

/// Delete a runner row.
pub async fn delete(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM runners WHERE id = ?")
        .bind(id)
        .execute(ex)
        .await
        .context("failed to delete runner")?;

    Ok(result.rows_affected())
}

/// Delete runner rows by id, returning the count removed.
pub async fn delete_many(pool: &SqlitePool, ids: &[Uuid]) -> Result<u64> {
    let mut removed = 0u64;
    for id in ids {
        removed += delete(pool, *id).await?;
    }
    Ok(removed)
}

/// Whether the project has an active non-parallel runner: a row with
/// status != 'stopped', a fresh heartbeat, and no parallel session.
pub async fn active_runner_exists(
    pool: &SqlitePool,
    project_path: &str,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runners \
         WHERE project_path = ? \
           AND status != 'stopped' \
           AND heartbeat_at > ? \
           AND parallel_session_id IS NULL",
    )
    .bind(project_path)
    .bind(heartbeat_cutoff)
    .fetch_one(pool)
    .await
    .context("failed to probe for active runner")?;

    Ok(row.0 > 0)
}

/// Runners registered for a project.
pub async fn list_for_project(pool: &SqlitePool, project_path: &str) -> Result<Vec<Runner>> {
    let runners = sqlx::query_as::<_, Runner>(
        "SELECT * FROM runners WHERE project_path = ? ORDER BY started_at ASC",
    )
    .bind(project_path)
    .fetch_all(pool)
    .await
    .context("failed to list project runners")?;

    Ok(runners)
}
