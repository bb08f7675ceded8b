//! Query functions for the append-only `audit` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{ActorType, AuditEntry, TaskStatus};

/// Fields of a new audit entry. `created_at` is stamped by the insert.
#[derive(Debug, Clone)]
pub struct NewAuditEntry<'a> {
    pub task_id: Uuid,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub actor: &'a str,
    pub actor_type: ActorType,
    pub model: Option<&'a str>,
    pub notes: Option<&'a str>,
    pub commit_sha: Option<&'a str>,
}

/// Insert an audit entry and return its monotonic id.
pub async fn insert_entry(
    ex: impl SqliteExecutor<'_>,
    entry: &NewAuditEntry<'_>,
    now: DateTime<Utc>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO audit \
           (task_id, from_status, to_status, actor, actor_type, model, notes, commit_sha, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(entry.task_id)
    .bind(entry.from_status)
    .bind(entry.to_status)
    .bind(entry.actor)
    .bind(entry.actor_type)
    .bind(entry.model)
    .bind(entry.notes)
    .bind(entry.commit_sha)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert audit entry")?;

    Ok(row.0)
}

/// Full audit trail for a task, oldest first.
pub async fn list_for_task(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit WHERE task_id = ? ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list audit entries")?;

    Ok(entries)
}

/// The most recent `limit` audit entries for a task, newest first.
pub async fn latest_for_task(
    pool: &SqlitePool,
    task_id: Uuid,
    limit: i64,
) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit WHERE task_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch latest audit entries")?;

    Ok(entries)
}

/// The most recent orchestrator-written entries for a task, newest first.
///
/// Used by the phase driver to count consecutive parse fallbacks.
pub async fn latest_orchestrator_entries(
    pool: &SqlitePool,
    task_id: Uuid,
    limit: i64,
) -> Result<Vec<AuditEntry>> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "SELECT * FROM audit \
         WHERE task_id = ? AND actor_type = 'orchestrator' \
         ORDER BY id DESC LIMIT ?",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to fetch orchestrator audit entries")?;

    Ok(entries)
}

/// Notes of the newest audit entry that moved the task into `review`
/// (the latest coder submission).
pub async fn latest_submission_notes(pool: &SqlitePool, task_id: Uuid) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        "SELECT notes FROM audit \
         WHERE task_id = ? AND to_status = 'review' \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest submission notes")?;

    Ok(row.and_then(|(notes,)| notes))
}

/// Notes of every rejection (review -> in_progress), oldest first.
pub async fn rejection_notes(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<String>> {
    let rows: Vec<(Option<String>,)> = sqlx::query_as(
        "SELECT notes FROM audit \
         WHERE task_id = ? AND from_status = 'review' AND to_status = 'in_progress' \
         ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch rejection notes")?;

    Ok(rows.into_iter().flat_map(|(notes,)| notes).collect())
}
