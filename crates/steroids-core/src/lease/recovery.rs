//! Recovery sweep: reset tasks stranded by crashed or wedged runners.
//!
//! Split into a pure planner (snapshot in, intended mutations out) and an
//! async applier, so classification is testable against fixtures without
//! a database or live processes.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use steroids_db::models::{
    ActorType, FailureMode, IncidentResolution, Runner, Task, TaskInvocation, TaskLock, TaskStatus,
};
use steroids_db::queries::{audit, incidents, invocations, locks, runners, tasks};

/// Policy knobs for the sweep, snapshotted from the health config.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub auto_recover: bool,
    pub max_recovery_attempts: i64,
    pub max_incidents_per_hour: i64,
    /// How long a task may sit in `in_progress`/`review` without progress
    /// before it is considered stuck.
    pub stuck_threshold: Duration,
    /// How long a running invocation may go without completing before the
    /// runner is considered hanging.
    pub hang_threshold: Duration,
    /// Heartbeats older than this mark a runner stale.
    pub stale_heartbeat: Duration,
    pub lease_ttl: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_recover: true,
            max_recovery_attempts: 3,
            max_incidents_per_hour: 20,
            stuck_threshold: Duration::minutes(30),
            hang_threshold: Duration::minutes(30),
            stale_heartbeat: Duration::minutes(5),
            lease_ttl: Duration::seconds(120),
        }
    }
}

/// Everything the planner needs to classify one project's stuck tasks.
#[derive(Debug, Clone, Default)]
pub struct SweepSnapshot {
    /// Tasks in `in_progress`/`review` past the stuck threshold.
    pub stuck_tasks: Vec<Task>,
    /// All task locks in the project database.
    pub locks: Vec<TaskLock>,
    /// Runner rows from the global database for this project.
    pub runners: Vec<Runner>,
    /// Newest still-running invocation per task.
    pub running_invocations: Vec<TaskInvocation>,
    /// Incidents detected in the trailing hour (rate limiter input).
    pub recent_incident_count: i64,
}

/// One intended mutation for one stranded task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAction {
    pub task_id: Uuid,
    pub failure_mode: FailureMode,
    /// Runner row to delete, if its owner was identified.
    pub runner_id: Option<Uuid>,
    /// Pid to terminate before cleanup, if one is known to exist.
    pub kill_pid: Option<i64>,
    /// Status the task is reset to: `pending`, or `skipped` once the
    /// failure budget is spent.
    pub reset_to: TaskStatus,
}

/// The planner's verdict for a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepPlan {
    pub actions: Vec<RecoveryAction>,
    /// Set when `max_incidents_per_hour` tripped; no rows may be
    /// modified.
    pub rate_limited: bool,
    /// Set when `auto_recover` is off; the sweep is a strict no-op.
    pub disabled: bool,
}

/// Classify stuck tasks into recovery actions. Pure: no IO, pid liveness
/// comes in through `pid_alive`.
pub fn plan_recovery(
    snapshot: &SweepSnapshot,
    config: &RecoveryConfig,
    now: DateTime<Utc>,
    pid_alive: &dyn Fn(i64) -> bool,
) -> SweepPlan {
    if !config.auto_recover {
        return SweepPlan {
            disabled: true,
            ..Default::default()
        };
    }

    if snapshot.recent_incident_count >= config.max_incidents_per_hour {
        return SweepPlan {
            rate_limited: true,
            ..Default::default()
        };
    }

    let locks_by_task: HashMap<Uuid, &TaskLock> =
        snapshot.locks.iter().map(|l| (l.task_id, l)).collect();
    let runners_by_id: HashMap<Uuid, &Runner> =
        snapshot.runners.iter().map(|r| (r.id, r)).collect();
    let invocations_by_task: HashMap<Uuid, &TaskInvocation> = snapshot
        .running_invocations
        .iter()
        .map(|i| (i.task_id, i))
        .collect();

    let mut actions = Vec::new();

    for task in &snapshot.stuck_tasks {
        let lock = locks_by_task.get(&task.id);
        let owner = lock.and_then(|l| runners_by_id.get(&l.runner_id));

        let classified = match (lock, owner) {
            // Lock whose owner runner row is gone, or no lock at all:
            // nobody will ever finish this task.
            (None, _) | (Some(_), None) => Some((FailureMode::OrphanedTask, None, None)),
            (Some(lock), Some(runner)) => {
                let pid_dead = runner.pid.map(|p| !pid_alive(p)).unwrap_or(true);
                let heartbeat_stale = now - runner.heartbeat_at > config.stale_heartbeat;
                let lock_aged = now - lock.acquired_at > config.lease_ttl;

                if lock_aged && (pid_dead || heartbeat_stale) {
                    Some((FailureMode::ZombieRunner, Some(runner.id), runner.pid))
                } else if pid_dead {
                    Some((FailureMode::DeadRunner, Some(runner.id), None))
                } else {
                    // Runner alive; check for a wedged invocation.
                    let hanging = invocations_by_task
                        .get(&task.id)
                        .map(|inv| now - inv.started_at > config.hang_threshold)
                        .unwrap_or(false);
                    hanging.then_some((
                        FailureMode::HangingInvocation,
                        Some(runner.id),
                        runner.pid,
                    ))
                }
            }
        };

        if let Some((failure_mode, runner_id, pid)) = classified {
            let reset_to = if task.failure_count + 1 >= config.max_recovery_attempts {
                TaskStatus::Skipped
            } else {
                TaskStatus::Pending
            };
            let kill_pid = pid.filter(|p| pid_alive(*p));
            actions.push(RecoveryAction {
                task_id: task.id,
                failure_mode,
                runner_id,
                kill_pid,
                reset_to,
            });
        }
    }

    SweepPlan {
        actions,
        rate_limited: false,
        disabled: false,
    }
}

/// Gather the sweep snapshot for one project.
pub async fn collect_snapshot(
    project: &SqlitePool,
    global: &SqlitePool,
    project_path: &str,
    config: &RecoveryConfig,
    now: DateTime<Utc>,
) -> Result<SweepSnapshot> {
    let stuck_cutoff = now - config.stuck_threshold;
    let stuck_tasks = tasks::list_stuck_tasks(project, stuck_cutoff).await?;

    let mut running_invocations = Vec::new();
    for task in &stuck_tasks {
        if let Some(inv) = invocations::latest_running_for_task(project, task.id).await? {
            running_invocations.push(inv);
        }
    }

    Ok(SweepSnapshot {
        stuck_tasks,
        locks: locks::list_all(project).await?,
        runners: runners::list_for_project(global, project_path).await?,
        running_invocations,
        recent_incident_count: incidents::count_since(global, now - Duration::hours(1)).await?,
    })
}

/// Apply a sweep plan: kill pids, delete runner rows, release locks,
/// reset tasks (with audit + failure counter), and record auto-restart
/// incidents.
pub async fn apply_plan(
    project: &SqlitePool,
    global: &SqlitePool,
    project_path: &str,
    plan: &SweepPlan,
    kill: &dyn Fn(i64),
) -> Result<usize> {
    if plan.disabled || plan.rate_limited {
        if plan.rate_limited {
            warn!(project = project_path, "recovery sweep rate-limited, no rows modified");
        }
        return Ok(0);
    }

    let now = Utc::now();

    for action in &plan.actions {
        if let Some(pid) = action.kill_pid {
            kill(pid);
        }

        // Project-side cleanup in one transaction: lock, counters, status,
        // audit.
        let mut tx = project.begin().await.context("failed to begin recovery tx")?;
        locks::force_release(&mut *tx, action.task_id).await?;
        tasks::increment_failure_count(&mut *tx, action.task_id, now).await?;
        let current = tasks::get_task(&mut *tx, action.task_id).await?;
        tasks::set_status(&mut *tx, action.task_id, action.reset_to, now).await?;
        audit::insert_entry(
            &mut *tx,
            &audit::NewAuditEntry {
                task_id: action.task_id,
                from_status: current.map(|t| t.status),
                to_status: action.reset_to,
                actor: "recovery",
                actor_type: ActorType::Automation,
                model: None,
                notes: Some(&format!("recovered from {}", action.failure_mode)),
                commit_sha: None,
            },
            now,
        )
        .await?;
        tx.commit().await.context("failed to commit recovery tx")?;

        // Global-side cleanup.
        if let Some(runner_id) = action.runner_id {
            runners::delete(global, runner_id).await?;
        }
        incidents::insert(
            global,
            Uuid::new_v4(),
            &incidents::NewIncident {
                runner_id: action.runner_id,
                project_path: Some(project_path),
                failure_mode: action.failure_mode,
                provider: None,
                model: None,
                role: None,
                message: Some("recovered by sweep"),
                details: json!({
                    "task_id": action.task_id,
                    "reset_to": action.reset_to,
                }),
            },
            Some(IncidentResolution::AutoRestart),
            now,
        )
        .await?;

        info!(
            task_id = %action.task_id,
            failure_mode = %action.failure_mode,
            reset_to = %action.reset_to,
            "recovered stranded task"
        );
    }

    Ok(plan.actions.len())
}

/// Convenience: collect, plan, and apply in one call.
pub async fn run_sweep(
    project: &SqlitePool,
    global: &SqlitePool,
    project_path: &str,
    config: &RecoveryConfig,
) -> Result<usize> {
    let now = Utc::now();
    let snapshot = collect_snapshot(project, global, project_path, config, now).await?;
    let plan = plan_recovery(&snapshot, config, now, &super::pid_alive);
    let recovered = apply_plan(project, global, project_path, &plan, &super::terminate_pid).await?;

    // Invocation rows left `running` by the recovered tasks will never
    // complete; mark them failed so hang detection does not re-trigger.
    if recovered > 0 {
        invocations::fail_stale_running(project, now - config.hang_threshold, now).await?;
    }

    Ok(recovered)
}

// -----------------------------------------------------------------------
// Tests (pure planner)
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_task(id: Uuid, status: TaskStatus, failure_count: i64) -> Task {
        let now = Utc::now();
        Task {
            id,
            title: "t".to_string(),
            status,
            section_id: None,
            source_file: None,
            rejection_count: 0,
            failure_count,
            coordinator_decision: None,
            coordinator_guidance: None,
            parent_task_id: None,
            promoted: false,
            created_at: now,
            updated_at: now - Duration::hours(1),
            last_failure_at: None,
        }
    }

    fn fixture_lock(task_id: Uuid, runner_id: Uuid, age: Duration) -> TaskLock {
        let now = Utc::now();
        TaskLock {
            task_id,
            runner_id,
            acquired_at: now - age,
            expires_at: now - age + Duration::seconds(120),
            heartbeat_at: now - age,
        }
    }

    fn fixture_runner(id: Uuid, pid: Option<i64>, heartbeat_age: Duration) -> Runner {
        let now = Utc::now();
        Runner {
            id,
            pid,
            status: steroids_db::models::RunnerStatus::Running,
            project_path: "/tmp/p".to_string(),
            current_task_id: None,
            heartbeat_at: now - heartbeat_age,
            parallel_session_id: None,
            started_at: now - Duration::hours(2),
        }
    }

    #[test]
    fn disabled_sweep_is_noop() {
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 0)],
            ..Default::default()
        };
        let config = RecoveryConfig {
            auto_recover: false,
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &config, Utc::now(), &|_| false);
        assert!(plan.disabled);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn rate_limit_short_circuits() {
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 0)],
            recent_incident_count: 20,
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), Utc::now(), &|_| false);
        assert!(plan.rate_limited);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn stuck_task_without_lock_is_orphaned() {
        let task = fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 0);
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![task.clone()],
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), Utc::now(), &|_| true);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].failure_mode, FailureMode::OrphanedTask);
        assert_eq!(plan.actions[0].reset_to, TaskStatus::Pending);
    }

    #[test]
    fn lock_with_missing_runner_is_orphaned() {
        let task = fixture_task(Uuid::new_v4(), TaskStatus::Review, 0);
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![task.clone()],
            locks: vec![fixture_lock(task.id, Uuid::new_v4(), Duration::minutes(10))],
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), Utc::now(), &|_| true);
        assert_eq!(plan.actions[0].failure_mode, FailureMode::OrphanedTask);
    }

    #[test]
    fn stale_heartbeat_and_dead_pid_with_aged_lock_is_zombie() {
        let task = fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 0);
        let runner = fixture_runner(Uuid::new_v4(), Some(4242), Duration::minutes(10));
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![task.clone()],
            locks: vec![fixture_lock(task.id, runner.id, Duration::minutes(10))],
            runners: vec![runner.clone()],
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), Utc::now(), &|_| false);
        assert_eq!(plan.actions[0].failure_mode, FailureMode::ZombieRunner);
        assert_eq!(plan.actions[0].runner_id, Some(runner.id));
        // Pid is dead, so nothing to kill.
        assert_eq!(plan.actions[0].kill_pid, None);
    }

    #[test]
    fn dead_pid_with_fresh_lock_is_dead_runner() {
        let task = fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 0);
        let runner = fixture_runner(Uuid::new_v4(), Some(4242), Duration::seconds(10));
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![task.clone()],
            locks: vec![fixture_lock(task.id, runner.id, Duration::seconds(30))],
            runners: vec![runner.clone()],
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), Utc::now(), &|_| false);
        assert_eq!(plan.actions[0].failure_mode, FailureMode::DeadRunner);
    }

    #[test]
    fn live_runner_with_wedged_invocation_is_hanging() {
        let task = fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 0);
        let runner = fixture_runner(Uuid::new_v4(), Some(1), Duration::seconds(10));
        let now = Utc::now();
        let invocation = TaskInvocation {
            id: Uuid::new_v4(),
            task_id: task.id,
            role: steroids_db::models::InvocationRole::Coder,
            provider: "claude".to_string(),
            model: "m".to_string(),
            started_at: now - Duration::hours(1),
            completed_at: None,
            exit_code: None,
            duration_ms: None,
            success: false,
            timed_out: false,
            session_id: None,
            rejection_number: None,
            status: steroids_db::models::InvocationStatus::Running,
        };
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![task.clone()],
            locks: vec![fixture_lock(task.id, runner.id, Duration::seconds(30))],
            runners: vec![runner.clone()],
            running_invocations: vec![invocation],
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), now, &|_| true);
        assert_eq!(plan.actions[0].failure_mode, FailureMode::HangingInvocation);
        assert_eq!(plan.actions[0].kill_pid, Some(1));
    }

    #[test]
    fn healthy_runner_is_left_alone() {
        let task = fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 0);
        let runner = fixture_runner(Uuid::new_v4(), Some(1), Duration::seconds(10));
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![task.clone()],
            locks: vec![fixture_lock(task.id, runner.id, Duration::seconds(30))],
            runners: vec![runner],
            ..Default::default()
        };
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), Utc::now(), &|_| true);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn failure_budget_escalates_to_skipped() {
        let task = fixture_task(Uuid::new_v4(), TaskStatus::InProgress, 2);
        let snapshot = SweepSnapshot {
            stuck_tasks: vec![task],
            ..Default::default()
        };
        // max_recovery_attempts = 3, failure_count 2 + 1 reaches it.
        let plan = plan_recovery(&snapshot, &RecoveryConfig::default(), Utc::now(), &|_| true);
        assert_eq!(plan.actions[0].reset_to, TaskStatus::Skipped);
    }
}
