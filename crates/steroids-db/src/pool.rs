//! SQLite pool construction for the per-project and global databases.
//!
//! Both databases are plain files opened with WAL journaling and a busy
//! timeout; concurrent writers from multiple runner processes are
//! serialized by SQLite itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::debug;

use crate::schema::{GLOBAL_SCHEMA, PROJECT_SCHEMA};

/// Name of the per-project state directory.
pub const STEROIDS_DIR: &str = ".steroids";

/// File name of both database files.
pub const DB_FILE: &str = "steroids.db";

/// Path of a project's state directory: `<project>/.steroids`.
pub fn project_state_dir(project_root: &Path) -> PathBuf {
    project_root.join(STEROIDS_DIR)
}

/// Path of a project's database file: `<project>/.steroids/steroids.db`.
pub fn project_db_path(project_root: &Path) -> PathBuf {
    project_state_dir(project_root).join(DB_FILE)
}

/// Path of the global state directory: `$STEROIDS_HOME` or `~/.steroids`.
pub fn global_state_dir() -> PathBuf {
    if let Ok(home) = std::env::var("STEROIDS_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STEROIDS_DIR)
}

/// Path of the global database file.
pub fn global_db_path() -> PathBuf {
    global_state_dir().join(DB_FILE)
}

/// Whether a project has been initialized (its database file exists).
pub fn project_is_initialized(project_root: &Path) -> bool {
    project_db_path(project_root).exists()
}

async fn open_pool(db_path: &Path, schema: &str) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    sqlx::raw_sql(schema)
        .execute(&pool)
        .await
        .with_context(|| format!("failed to apply schema to {}", db_path.display()))?;

    debug!(db = %db_path.display(), "database ready");
    Ok(pool)
}

/// Open (creating if necessary) the per-project database.
pub async fn open_project_pool(project_root: &Path) -> Result<SqlitePool> {
    open_pool(&project_db_path(project_root), PROJECT_SCHEMA).await
}

/// Open the per-project database only if it already exists.
///
/// Returns `Ok(None)` when the project is not initialized, so callers can
/// map that to the NOT_INITIALIZED exit code instead of silently creating
/// a fresh database.
pub async fn open_existing_project_pool(project_root: &Path) -> Result<Option<SqlitePool>> {
    if !project_is_initialized(project_root) {
        return Ok(None);
    }
    open_pool(&project_db_path(project_root), PROJECT_SCHEMA)
        .await
        .map(Some)
}

/// Open (creating if necessary) the global database at its default path.
pub async fn open_global_pool() -> Result<SqlitePool> {
    open_pool(&global_db_path(), GLOBAL_SCHEMA).await
}

/// Open (creating if necessary) a global database at an explicit path.
///
/// Used by tests and by callers that relocate the global state dir.
pub async fn open_global_pool_at(db_path: &Path) -> Result<SqlitePool> {
    open_pool(db_path, GLOBAL_SCHEMA).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_project_pool_creates_state_dir_and_schema() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = open_project_pool(tmp.path()).await.unwrap();

        assert!(project_db_path(tmp.path()).exists());

        // The schema should be queryable.
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn open_pool_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = open_project_pool(tmp.path()).await.unwrap();
        pool.close().await;
        // A second open re-applies the schema without error.
        let pool = open_project_pool(tmp.path()).await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn open_existing_returns_none_for_uninitialized() {
        let tmp = tempfile::tempdir().unwrap();
        let result = open_existing_project_pool(tmp.path()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn global_pool_at_explicit_path() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("global.db");
        let pool = open_global_pool_at(&db).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runners")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
        pool.close().await;
    }
}
