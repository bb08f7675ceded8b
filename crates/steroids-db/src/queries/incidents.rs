//! Query functions for the global `incidents` table.
//!
//! Credit-exhaustion incidents are dedup-keyed on
//! (failure_mode, runner_id, provider, model, role) while unresolved; a
//! partial unique index backs the application-level check.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{FailureMode, Incident, IncidentResolution};

/// Fields describing a new incident.
#[derive(Debug, Clone)]
pub struct NewIncident<'a> {
    pub runner_id: Option<Uuid>,
    pub project_path: Option<&'a str>,
    pub failure_mode: FailureMode,
    pub provider: Option<&'a str>,
    pub model: Option<&'a str>,
    pub role: Option<&'a str>,
    pub message: Option<&'a str>,
    pub details: serde_json::Value,
}

/// Outcome of [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved,
    AlreadyResolved,
    NotFound,
}

/// Insert an incident row without dedup (used for already-resolved
/// recovery incidents and other non-keyed classes).
pub async fn insert(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    incident: &NewIncident<'_>,
    resolved: Option<IncidentResolution>,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let resolved_at = resolved.map(|_| now);
    sqlx::query(
        "INSERT INTO incidents \
           (id, runner_id, project_path, failure_mode, provider, model, role, message, details, \
            detected_at, resolved_at, resolution) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(incident.runner_id)
    .bind(incident.project_path)
    .bind(incident.failure_mode)
    .bind(incident.provider)
    .bind(incident.model)
    .bind(incident.role)
    .bind(incident.message)
    .bind(&incident.details)
    .bind(now)
    .bind(resolved_at)
    .bind(resolved)
    .execute(ex)
    .await
    .context("failed to insert incident")?;

    Ok(id)
}

/// Find an unresolved incident matching the dedup key.
pub async fn find_unresolved(
    ex: impl SqliteExecutor<'_>,
    failure_mode: FailureMode,
    runner_id: Option<Uuid>,
    provider: Option<&str>,
    model: Option<&str>,
    role: Option<&str>,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM incidents \
         WHERE failure_mode = ? \
           AND resolved_at IS NULL \
           AND runner_id IS ? AND provider IS ? AND model IS ? AND role IS ? \
         LIMIT 1",
    )
    .bind(failure_mode)
    .bind(runner_id)
    .bind(provider)
    .bind(model)
    .bind(role)
    .fetch_optional(ex)
    .await
    .context("failed to look up unresolved incident")?;

    Ok(row.map(|(id,)| id))
}

/// Record a credit-exhaustion incident, idempotent on the dedup key.
///
/// When a matching unresolved incident already exists its id is returned
/// and nothing is inserted.
pub async fn record_credit_incident(
    pool: &SqlitePool,
    incident: &NewIncident<'_>,
    now: DateTime<Utc>,
) -> Result<Uuid> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    if let Some(existing) = find_unresolved(
        &mut *tx,
        FailureMode::CreditExhaustion,
        incident.runner_id,
        incident.provider,
        incident.model,
        incident.role,
    )
    .await?
    {
        tx.commit().await.context("failed to commit transaction")?;
        return Ok(existing);
    }

    let id = insert(&mut *tx, Uuid::new_v4(), incident, None, now).await?;
    tx.commit().await.context("failed to commit transaction")?;
    Ok(id)
}

/// Resolve an incident. Idempotent: resolving an already-resolved
/// incident is a no-op.
pub async fn resolve(
    pool: &SqlitePool,
    id: Uuid,
    resolution: IncidentResolution,
    now: DateTime<Utc>,
) -> Result<ResolveOutcome> {
    let result = sqlx::query(
        "UPDATE incidents SET resolved_at = ?, resolution = ? \
         WHERE id = ? AND resolved_at IS NULL",
    )
    .bind(now)
    .bind(resolution)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resolve incident")?;

    if result.rows_affected() == 1 {
        return Ok(ResolveOutcome::Resolved);
    }

    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM incidents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to check incident existence")?;

    Ok(match exists {
        Some(_) => ResolveOutcome::AlreadyResolved,
        None => ResolveOutcome::NotFound,
    })
}

/// Unresolved credit-exhaustion incidents, optionally filtered to a
/// project by joining runner ids against the global runners table.
pub async fn active_credit_incidents(
    pool: &SqlitePool,
    project_path: Option<&str>,
) -> Result<Vec<Incident>> {
    let incidents = match project_path {
        Some(path) => {
            sqlx::query_as::<_, Incident>(
                "SELECT i.* FROM incidents i \
                 LEFT JOIN runners r ON r.id = i.runner_id \
                 WHERE i.failure_mode = 'credit_exhaustion' \
                   AND i.resolved_at IS NULL \
                   AND (r.project_path = ? OR i.project_path = ?) \
                 ORDER BY i.detected_at ASC",
            )
            .bind(path)
            .bind(path)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Incident>(
                "SELECT * FROM incidents \
                 WHERE failure_mode = 'credit_exhaustion' AND resolved_at IS NULL \
                 ORDER BY detected_at ASC",
            )
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list active credit incidents")?;

    Ok(incidents)
}

/// All unresolved incidents.
pub async fn list_unresolved(pool: &SqlitePool) -> Result<Vec<Incident>> {
    let incidents = sqlx::query_as::<_, Incident>(
        "SELECT * FROM incidents WHERE resolved_at IS NULL ORDER BY detected_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list unresolved incidents")?;

    Ok(incidents)
}

/// Fetch an incident by id.
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Option<Incident>> {
    let incident = sqlx::query_as::<_, Incident>("SELECT * FROM incidents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch incident")?;

    Ok(incident)
}

/// Count incidents detected since `since` (the sweep's rate limiter).
pub async fn count_since(pool: &SqlitePool, since: DateTime<Utc>) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM incidents WHERE detected_at >= ?")
        .bind(since)
        .fetch_one(pool)
        .await
        .context("failed to count recent incidents")?;

    Ok(row.0)
}
