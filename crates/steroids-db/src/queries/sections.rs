//! Query functions for the `sections` and `section_dependencies` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{Section, SectionDependency};

/// Insert a section. The name is unique per project.
pub async fn insert_section(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    name: &str,
    priority: Option<i64>,
    source_file: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Section> {
    let section = sqlx::query_as::<_, Section>(
        "INSERT INTO sections (id, name, priority, source_file, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(name)
    .bind(priority)
    .bind(source_file)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert section")?;

    Ok(section)
}

/// Fetch a section by ID.
pub async fn get_section(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<Option<Section>> {
    let section = sqlx::query_as::<_, Section>("SELECT * FROM sections WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch section")?;

    Ok(section)
}

/// Fetch a section by its unique name.
pub async fn get_section_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Section>> {
    let section = sqlx::query_as::<_, Section>("SELECT * FROM sections WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch section by name")?;

    Ok(section)
}

/// List all sections in scheduling order.
pub async fn list_sections(pool: &SqlitePool) -> Result<Vec<Section>> {
    let sections = sqlx::query_as::<_, Section>(
        "SELECT * FROM sections \
         ORDER BY (priority IS NULL) ASC, priority DESC, name ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list sections")?;

    Ok(sections)
}

/// Insert a dependency edge. Idempotent via `ON CONFLICT DO NOTHING`.
pub async fn insert_dependency(
    ex: impl SqliteExecutor<'_>,
    section_id: Uuid,
    depends_on_section_id: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO section_dependencies (section_id, depends_on_section_id) \
         VALUES (?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(section_id)
    .bind(depends_on_section_id)
    .execute(ex)
    .await
    .context("failed to insert section dependency")?;

    Ok(())
}

/// List the dependency edges of a section.
pub async fn list_dependencies(
    pool: &SqlitePool,
    section_id: Uuid,
) -> Result<Vec<SectionDependency>> {
    let deps = sqlx::query_as::<_, SectionDependency>(
        "SELECT * FROM section_dependencies WHERE section_id = ?",
    )
    .bind(section_id)
    .fetch_all(pool)
    .await
    .context("failed to list section dependencies")?;

    Ok(deps)
}

/// Whether every task in a section is settled (completed or skipped).
pub async fn section_is_complete(pool: &SqlitePool, section_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE section_id = ? AND status NOT IN ('completed', 'skipped')",
    )
    .bind(section_id)
    .fetch_one(pool)
    .await
    .context("failed to check section completion")?;

    Ok(row.0 == 0)
}

/// (title, status) projection of a section's tasks, used for coordinator
/// context.
pub async fn section_status_projection(
    pool: &SqlitePool,
    section_id: Uuid,
) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT title, status FROM tasks WHERE section_id = ? ORDER BY created_at ASC",
    )
    .bind(section_id)
    .fetch_all(pool)
    .await
    .context("failed to project section task statuses")?;

    Ok(rows)
}
