//! Shared test utilities for steroids integration tests.
//!
//! SQLite needs no server: each test gets its own temp directory holding a
//! freshly-provisioned project database (and, when needed, a global
//! database). Keep the returned [`TestDb`] alive for the duration of the
//! test -- dropping it deletes the files.

use std::path::{Path, PathBuf};

use sqlx::SqlitePool;
use tempfile::TempDir;

use steroids_db::pool;

/// A temp project database (schema applied), plus the directory that
/// backs it.
pub struct TestDb {
    pub pool: SqlitePool,
    pub project_root: PathBuf,
    _dir: TempDir,
}

/// Create a temp project database with the project schema applied.
pub async fn create_project_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let project_root = dir.path().to_path_buf();
    let pool = pool::open_project_pool(&project_root)
        .await
        .expect("failed to open project database");

    TestDb {
        pool,
        project_root,
        _dir: dir,
    }
}

/// A temp global database (schema applied).
pub struct TestGlobalDb {
    pub pool: SqlitePool,
    pub db_path: PathBuf,
    _dir: TempDir,
}

/// Create a temp global database with the global schema applied.
pub async fn create_global_db() -> TestGlobalDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("steroids.db");
    let pool = pool::open_global_pool_at(&db_path)
        .await
        .expect("failed to open global database");

    TestGlobalDb {
        pool,
        db_path,
        _dir: dir,
    }
}

/// Write an executable `#!/bin/sh` script into `dir` and return its path.
///
/// The standard way to fake an actor CLI in tests: the script body echoes
/// whatever stream output the test needs.
pub fn write_fake_cli(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("failed to write fake CLI");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("failed to chmod fake CLI");
    }

    path
}
