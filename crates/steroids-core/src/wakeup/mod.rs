//! Wakeup controller: single-shot discovery of pending work.
//!
//! Cleans stale runner rows, enumerates registered projects, and spawns a
//! detached runner for each project that has pending work and no active
//! non-parallel runner. Safe to invoke from an external scheduler at any
//! cadence; invocations are idempotent at second granularity.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use steroids_db::pool;
use steroids_db::queries::{backoffs, parallel_sessions, projects, runners, tasks};

use crate::lease::pid_alive;

/// Heartbeats older than this mark a runner stale.
const STALE_MINUTES: i64 = 5;

/// Options for one wakeup pass.
#[derive(Debug, Clone, Default)]
pub struct WakeupOptions {
    /// Report what would be started without spawning anything.
    pub dry_run: bool,
    /// Suppress per-project log lines.
    pub quiet: bool,
}

/// Outcome for one project (or for the cleanup step).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WakeupOutcome {
    /// Stale runner rows were removed.
    Cleaned { removed: u64 },
    /// A detached runner was spawned.
    Started { pid: u32 },
    /// Dry-run: a runner would have been spawned.
    WouldStart,
    /// Nothing to do for this project.
    None { reason: String },
}

/// One entry of the wakeup report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeupResult {
    /// Project path; `None` for host-level entries (cleanup, no
    /// projects).
    pub project: Option<String>,
    #[serde(flatten)]
    pub outcome: WakeupOutcome,
}

/// How runner processes are spawned; injected so tests can observe spawn
/// requests without forking.
pub trait RunnerSpawner: Send + Sync {
    fn spawn(&self, project_path: &str) -> Result<u32>;
}

/// Spawns `steroids runners start --parallel --project <path>` detached.
pub struct DetachedSpawner;

impl RunnerSpawner for DetachedSpawner {
    fn spawn(&self, project_path: &str) -> Result<u32> {
        let exe = std::env::current_exe().context("could not locate the steroids binary")?;
        let mut cmd = std::process::Command::new(exe);
        cmd.args(["runners", "start", "--parallel", "--project", project_path])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        // Detach from our process group so the runner survives this
        // process.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().context("failed to spawn runner process")?;
        Ok(child.id())
    }
}

/// Run one wakeup pass against the global database.
pub async fn wakeup(
    global: &SqlitePool,
    spawner: &dyn RunnerSpawner,
    opts: &WakeupOptions,
) -> Result<Vec<WakeupResult>> {
    let now = Utc::now();
    let stale_cutoff = now - Duration::minutes(STALE_MINUTES);
    let mut results = Vec::new();

    // Expired provider cooldowns are dead weight; drop them first.
    backoffs::clear_expired(global, now).await?;

    // 1. Clean stale runners: heartbeat too old or pid gone.
    let mut stale_ids: Vec<Uuid> = Vec::new();
    for runner in runners::list_all(global).await? {
        let heartbeat_stale = runner.heartbeat_at < stale_cutoff;
        let pid_gone = runner.pid.map(|p| !pid_alive(p)).unwrap_or(true);
        if heartbeat_stale || pid_gone {
            stale_ids.push(runner.id);
        }
    }
    let removed = runners::delete_many(global, &stale_ids).await?;
    if removed > 0 {
        parallel_sessions::delete_orphaned(global).await?;
        if !opts.quiet {
            info!(removed, "cleaned stale runners");
        }
    }
    results.push(WakeupResult {
        project: None,
        outcome: WakeupOutcome::Cleaned { removed },
    });

    // 2. Enumerate registered projects.
    let projects = projects::list_enabled(global).await?;
    if projects.is_empty() {
        results.push(WakeupResult {
            project: None,
            outcome: WakeupOutcome::None {
                reason: "No registered projects".to_string(),
            },
        });
        return Ok(results);
    }

    // 3. Probe each project.
    for project in projects {
        let outcome = probe_project(global, &project.path, spawner, opts, stale_cutoff).await;
        match outcome {
            Ok(outcome) => {
                if !opts.quiet {
                    info!(project = %project.path, outcome = ?outcome, "wakeup");
                }
                results.push(WakeupResult {
                    project: Some(project.path),
                    outcome,
                });
            }
            Err(e) => {
                warn!(project = %project.path, error = %e, "wakeup probe failed");
                results.push(WakeupResult {
                    project: Some(project.path),
                    outcome: WakeupOutcome::None {
                        reason: format!("probe failed: {e}"),
                    },
                });
            }
        }
    }

    Ok(results)
}

async fn probe_project(
    global: &SqlitePool,
    project_path: &str,
    spawner: &dyn RunnerSpawner,
    opts: &WakeupOptions,
    stale_cutoff: chrono::DateTime<Utc>,
) -> Result<WakeupOutcome> {
    if !Path::new(project_path).exists() {
        return Ok(WakeupOutcome::None {
            reason: "not found".to_string(),
        });
    }

    if runners::active_runner_exists(global, project_path, stale_cutoff).await? {
        return Ok(WakeupOutcome::None {
            reason: "already active".to_string(),
        });
    }

    let Some(project_pool) =
        pool::open_existing_project_pool(Path::new(project_path)).await?
    else {
        return Ok(WakeupOutcome::None {
            reason: "not initialized".to_string(),
        });
    };

    let pending = tasks::count_active_tasks(&project_pool).await?;
    project_pool.close().await;
    if pending == 0 {
        return Ok(WakeupOutcome::None {
            reason: "No pending tasks".to_string(),
        });
    }

    if opts.dry_run {
        return Ok(WakeupOutcome::WouldStart);
    }

    let pid = spawner.spawn(project_path)?;
    Ok(WakeupOutcome::Started { pid })
}
