//! Query functions for the `task_invocations` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{InvocationRole, InvocationStatus, TaskInvocation};

/// Record the start of an actor invocation.
pub async fn start_invocation(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    task_id: Uuid,
    role: InvocationRole,
    provider: &str,
    model: &str,
    rejection_number: Option<i64>,
    now: DateTime<Utc>,
) -> Result<TaskInvocation> {
    let invocation = sqlx::query_as::<_, TaskInvocation>(
        "INSERT INTO task_invocations \
           (id, task_id, role, provider, model, started_at, rejection_number) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(task_id)
    .bind(role)
    .bind(provider)
    .bind(model)
    .bind(now)
    .bind(rejection_number)
    .fetch_one(ex)
    .await
    .context("failed to record invocation start")?;

    Ok(invocation)
}

/// Record the completion (or failure) of an invocation.
#[allow(clippy::too_many_arguments)]
pub async fn complete_invocation(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    exit_code: Option<i64>,
    duration_ms: i64,
    success: bool,
    timed_out: bool,
    session_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let status = if success {
        InvocationStatus::Completed
    } else {
        InvocationStatus::Failed
    };

    let result = sqlx::query(
        "UPDATE task_invocations \
         SET completed_at = ?, exit_code = ?, duration_ms = ?, success = ?, timed_out = ?, \
             session_id = ?, status = ? \
         WHERE id = ?",
    )
    .bind(now)
    .bind(exit_code)
    .bind(duration_ms)
    .bind(success)
    .bind(timed_out)
    .bind(session_id)
    .bind(status)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to record invocation completion")?;

    Ok(result.rows_affected())
}

/// The most recent session id recorded for a (task, role), if any.
///
/// Lets a resumed coder phase continue its previous provider session.
pub async fn latest_session_for_role(
    pool: &SqlitePool,
    task_id: Uuid,
    role: InvocationRole,
) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        "SELECT session_id FROM task_invocations \
         WHERE task_id = ? AND role = ? AND session_id IS NOT NULL \
         ORDER BY started_at DESC LIMIT 1",
    )
    .bind(task_id)
    .bind(role)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest session id")?;

    Ok(row.and_then(|(session_id,)| session_id))
}

/// All invocations for a task, oldest first.
pub async fn list_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<TaskInvocation>> {
    let invocations = sqlx::query_as::<_, TaskInvocation>(
        "SELECT * FROM task_invocations WHERE task_id = ? ORDER BY started_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list invocations")?;

    Ok(invocations)
}

/// The newest still-running invocation for a task, if any.
///
/// Used by the recovery sweep to distinguish a hanging invocation from an
/// orphaned task.
pub async fn latest_running_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
) -> Result<Option<TaskInvocation>> {
    let invocation = sqlx::query_as::<_, TaskInvocation>(
        "SELECT * FROM task_invocations \
         WHERE task_id = ? AND status = 'running' \
         ORDER BY started_at DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest running invocation")?;

    Ok(invocation)
}

/// Mark abandoned `running` invocations older than `cutoff` as failed.
pub async fn fail_stale_running(
    ex: impl SqliteExecutor<'_>,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_invocations \
         SET status = 'failed', completed_at = ? \
         WHERE status = 'running' AND started_at < ?",
    )
    .bind(now)
    .bind(cutoff)
    .execute(ex)
    .await
    .context("failed to fail stale invocations")?;

    Ok(result.rows_affected())
}
