//! Query functions for the global `projects` registry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::Project;

/// Register a project path. Re-registering an existing path re-enables it
/// and refreshes the name.
pub async fn register(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    name: &str,
    path: &str,
    now: DateTime<Utc>,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (id, name, path, enabled, registered_at) \
         VALUES (?, ?, ?, 1, ?) \
         ON CONFLICT(path) DO UPDATE SET name = excluded.name, enabled = 1 \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(path)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to register project")?;

    Ok(project)
}

/// Remove a project from the registry.
pub async fn unregister(ex: impl SqliteExecutor<'_>, path: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM projects WHERE path = ?")
        .bind(path)
        .execute(ex)
        .await
        .context("failed to unregister project")?;

    Ok(result.rows_affected())
}

/// Enable or disable a project without removing it.
pub async fn set_enabled(ex: impl SqliteExecutor<'_>, path: &str, enabled: bool) -> Result<u64> {
    let result = sqlx::query("UPDATE projects SET enabled = ? WHERE path = ?")
        .bind(enabled)
        .bind(path)
        .execute(ex)
        .await
        .context("failed to toggle project")?;

    Ok(result.rows_affected())
}

/// All enabled projects, in registration order.
pub async fn list_enabled(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE enabled = 1 ORDER BY registered_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list enabled projects")?;

    Ok(projects)
}

/// All projects.
pub async fn list_all(pool: &SqlitePool) -> Result<Vec<Project>> {
    let projects =
        sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY registered_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list projects")?;

    Ok(projects)
}

/// Look up a project by path.
pub async fn get_by_path(pool: &SqlitePool, path: &str) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}
