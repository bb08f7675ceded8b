//! Query functions for the global `parallel_sessions` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::models::ParallelSession;

/// Insert a parallel session for a project.
pub async fn insert(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    project_path: &str,
    now: DateTime<Utc>,
) -> Result<ParallelSession> {
    let session = sqlx::query_as::<_, ParallelSession>(
        "INSERT INTO parallel_sessions (id, project_path, created_at) \
         VALUES (?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(project_path)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert parallel session")?;

    Ok(session)
}

/// Delete sessions that no longer have any runner attached.
pub async fn delete_orphaned(ex: impl SqliteExecutor<'_>) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM parallel_sessions \
         WHERE id NOT IN (SELECT parallel_session_id FROM runners \
                          WHERE parallel_session_id IS NOT NULL)",
    )
    .execute(ex)
    .await
    .context("failed to delete orphaned parallel sessions")?;

    Ok(result.rows_affected())
}
