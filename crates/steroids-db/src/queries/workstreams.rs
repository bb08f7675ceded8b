//! Query functions for the global `workstreams` table.
//!
//! Claims bump `claim_generation`; lease refreshes are fenced by it.
//! Contention is resolved optimistically: a writer that loses the fence
//! sees zero affected rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::Workstream;

/// Insert a workstream for a project.
pub async fn insert(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    project_path: &str,
    now: DateTime<Utc>,
) -> Result<Workstream> {
    let ws = sqlx::query_as::<_, Workstream>(
        "INSERT INTO workstreams (id, project_path, created_at) \
         VALUES (?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(project_path)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert workstream")?;

    Ok(ws)
}

/// Fetch a workstream by id.
pub async fn get(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<Option<Workstream>> {
    let ws = sqlx::query_as::<_, Workstream>("SELECT * FROM workstreams WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch workstream")?;

    Ok(ws)
}

/// Find an unclaimed (or lease-expired) workstream for the project, or
/// create one.
pub async fn find_or_create(
    pool: &SqlitePool,
    project_path: &str,
    now: DateTime<Utc>,
) -> Result<Workstream> {
    let existing = sqlx::query_as::<_, Workstream>(
        "SELECT * FROM workstreams \
         WHERE project_path = ? \
           AND (status != 'running' OR lease_expires_at IS NULL OR lease_expires_at <= ?) \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(project_path)
    .bind(now)
    .fetch_optional(pool)
    .await
    .context("failed to look up workstream")?;

    match existing {
        Some(ws) => Ok(ws),
        None => insert(pool, Uuid::new_v4(), project_path, now).await,
    }
}

/// Claim a workstream for a runner, bumping the claim generation.
///
/// Succeeds only when the workstream is not running or its lease has
/// expired. Returns the new claim generation, or `None` when another
/// runner holds a live claim.
pub async fn claim(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    runner_id: Uuid,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let lease_expires_at = now + ttl;
    let row: Option<(i64,)> = sqlx::query_as(
        "UPDATE workstreams \
         SET runner_id = ?, status = 'running', \
             claim_generation = claim_generation + 1, \
             lease_expires_at = ? \
         WHERE id = ? \
           AND (status != 'running' OR lease_expires_at IS NULL OR lease_expires_at <= ?) \
         RETURNING claim_generation",
    )
    .bind(runner_id)
    .bind(lease_expires_at)
    .bind(id)
    .bind(now)
    .fetch_optional(ex)
    .await
    .context("failed to claim workstream")?;

    Ok(row.map(|(generation,)| generation))
}

/// Refresh the lease on a claimed workstream.
///
/// The fence: the UPDATE matches only when the workstream is still
/// running under the caller's claim generation. 0 rows means the lease
/// was lost and the caller must abort its phase.
pub async fn refresh_lease(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    claim_generation: i64,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<u64> {
    let lease_expires_at = now + ttl;
    let result = sqlx::query(
        "UPDATE workstreams SET lease_expires_at = ? \
         WHERE id = ? AND status = 'running' AND claim_generation = ?",
    )
    .bind(lease_expires_at)
    .bind(id)
    .bind(claim_generation)
    .execute(ex)
    .await
    .context("failed to refresh workstream lease")?;

    Ok(result.rows_affected())
}

/// Release a claim, returning the workstream to idle.
///
/// Fenced by claim generation so a late release from a superseded claim
/// does not clobber the new holder.
pub async fn release(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    claim_generation: i64,
    now: DateTime<Utc>,
) -> Result<u64> {
    let _ = now;
    let result = sqlx::query(
        "UPDATE workstreams \
         SET status = 'idle', runner_id = NULL, lease_expires_at = NULL \
         WHERE id = ? AND claim_generation = ?",
    )
    .bind(id)
    .bind(claim_generation)
    .execute(ex)
    .await
    .context("failed to release workstream")?;

    Ok(result.rows_affected())
}

/// Workstreams for a project.
pub async fn list_for_project(pool: &SqlitePool, project_path: &str) -> Result<Vec<Workstream>> {
    let rows = sqlx::query_as::<_, Workstream>(
        "SELECT * FROM workstreams WHERE project_path = ? ORDER BY created_at ASC",
    )
    .bind(project_path)
    .fetch_all(pool)
    .await
    .context("failed to list workstreams")?;

    Ok(rows)
}
