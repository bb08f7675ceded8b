//! The runner loop: one OS process driving select -> phase for one
//! project.
//!
//! A runner registers itself in the global database, claims a workstream
//! (bumping its claim generation), heartbeats in the background, and
//! loops the phase driver until no eligible work remains. Credit
//! exhaustion pauses the loop until the incident is resolved or the
//! config file changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use steroids_db::models::{IncidentResolution, RunnerStatus, TaskStatus};
use steroids_db::pool;
use steroids_db::queries::{incidents, parallel_sessions, runners, workstreams};

use crate::config::{ConfigFile, PhaseConfig, config_mtime};
use crate::git::GitWorkspace;
use crate::hooks::{HookEvent, HookSink, ProjectRef};
use crate::lease::recovery::{RecoveryConfig, run_sweep};
use crate::lease::{LeaseError, TaskLease, WorkstreamLease};
use crate::phase::{CreditExhaustion, PhaseDriver};
use crate::provider::ProviderRegistry;
use crate::selector::select_next_task;
use crate::state;

/// Options for one runner process.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub project_root: PathBuf,
    /// Register under a parallel session (spawned by wakeup).
    pub parallel: bool,
    /// Interval between background heartbeats.
    pub heartbeat_interval: Duration,
    /// Poll interval while paused on credit exhaustion.
    pub pause_poll_interval: Duration,
    /// Stop after this many loop iterations (tests). `None` runs until
    /// the queue drains.
    pub max_iterations: Option<u64>,
}

impl RunnerOptions {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            parallel: false,
            heartbeat_interval: Duration::from_secs(30),
            pause_poll_interval: Duration::from_secs(15),
            max_iterations: None,
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    QueueDrained,
    LeaseLost,
    Cancelled,
    IterationLimit,
}

/// Outcome of a runner run.
#[derive(Debug, Clone)]
pub struct RunnerSummary {
    pub runner_id: Uuid,
    pub iterations: u64,
    pub stop_reason: StopReason,
}

/// Run the loop to completion.
pub async fn run_runner(
    opts: RunnerOptions,
    registry: Arc<ProviderRegistry>,
    config: ConfigFile,
    hooks: Arc<dyn HookSink>,
    global: SqlitePool,
    cancel: CancellationToken,
) -> Result<RunnerSummary> {
    let project_root = opts.project_root.clone();
    let project_path = project_root.to_string_lossy().into_owned();

    let project = pool::open_existing_project_pool(&project_root)
        .await?
        .with_context(|| format!("project at {project_path} is not initialized"))?;

    let runner_id = Uuid::new_v4();
    let pid = std::process::id() as i64;

    let parallel_session_id = if opts.parallel {
        let id = Uuid::new_v4();
        parallel_sessions::insert(&global, id, &project_path, Utc::now()).await?;
        Some(id)
    } else {
        None
    };

    runners::register(
        &global,
        runner_id,
        Some(pid),
        &project_path,
        parallel_session_id,
        Utc::now(),
    )
    .await?;
    info!(runner_id = %runner_id, project = %project_path, "runner registered");

    // Startup recovery sweep for this project.
    let recovery = RecoveryConfig {
        auto_recover: config.health.auto_recover,
        max_recovery_attempts: config.health.max_recovery_attempts,
        max_incidents_per_hour: config.health.max_incidents_per_hour,
        ..Default::default()
    };
    if let Err(e) = run_sweep(&project, &global, &project_path, &recovery).await {
        warn!(error = %e, "startup recovery sweep failed");
    }

    // Claim a workstream; without one this runner must not mutate state.
    let ws = workstreams::find_or_create(&global, &project_path, Utc::now()).await?;
    let Some(workstream) = WorkstreamLease::claim(&global, ws.id, runner_id).await? else {
        runners::delete(&global, runner_id).await?;
        bail!("workstream {} is already claimed; exiting", ws.id);
    };

    // Background heartbeat.
    let heartbeat = {
        let global = global.clone();
        let cancel = cancel.clone();
        let interval = opts.heartbeat_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = runners::heartbeat(&global, runner_id, None, Utc::now()).await {
                            warn!(error = %e, "runner heartbeat failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    };

    let project_ref = ProjectRef {
        name: project_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| project_path.clone()),
        path: project_path.clone(),
    };

    let mut iterations = 0u64;
    let stop_reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if let Some(limit) = opts.max_iterations {
            if iterations >= limit {
                break StopReason::IterationLimit;
            }
        }
        iterations += 1;

        let Some(selection) = select_next_task(&project, runner_id).await? else {
            info!(runner_id = %runner_id, "no eligible work remaining");
            break StopReason::QueueDrained;
        };

        let Some(lock) = TaskLease::acquire(&project, selection.task.id, runner_id).await? else {
            // Another runner got there first; look again.
            continue;
        };
        runners::heartbeat(&global, runner_id, Some(selection.task.id), Utc::now()).await?;

        let task = if selection.task.status == TaskStatus::Pending {
            state::start_task(&project, selection.task.id, "runner").await?
        } else {
            selection.task.clone()
        };

        let driver = PhaseDriver {
            project: project.clone(),
            global: global.clone(),
            providers: Arc::clone(&registry),
            config: PhaseConfig::from_config(&config),
            ai: config.ai.clone(),
            runner_id,
            workstream: workstream.clone(),
            git: GitWorkspace::new(&project_root),
            hooks: Arc::clone(&hooks),
            project_ref: project_ref.clone(),
        };

        let phase_result = match task.status {
            TaskStatus::InProgress => driver.run_coder_phase(&task, selection.action).await,
            TaskStatus::Review => driver.run_reviewer_phase(&task).await,
            other => {
                warn!(task_id = %task.id, status = %other, "selected task in unexpected status");
                lock.release(&project).await?;
                continue;
            }
        };

        match phase_result {
            Ok(None) => {}
            Ok(Some(exhaustion)) => {
                pause_on_credit_exhaustion(
                    &global,
                    runner_id,
                    &project_path,
                    &project_ref,
                    hooks.as_ref(),
                    &exhaustion,
                    opts.pause_poll_interval,
                    &cancel,
                )
                .await?;
            }
            Err(LeaseError::WorkstreamLost { .. }) | Err(LeaseError::TaskLockLost { .. }) => {
                // Fatal: stop mutating and let the recovery sweep take
                // over the task.
                warn!(runner_id = %runner_id, task_id = %task.id, "lease lost, stopping runner");
                break StopReason::LeaseLost;
            }
            Err(LeaseError::Other(e)) => {
                warn!(task_id = %task.id, error = %e, "phase failed, retrying next iteration");
            }
        }

        lock.release(&project).await?;
        runners::heartbeat(&global, runner_id, None, Utc::now()).await?;

        // Brief pause so fast-failing phases cannot hot-loop.
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            _ = cancel.cancelled() => {}
        }
    };

    // Shutdown: stop the heartbeat, release the claim, mark stopped.
    cancel.cancel();
    let _ = heartbeat.await;
    workstream.release(&global).await?;
    runners::set_status(&global, runner_id, RunnerStatus::Stopped, Utc::now()).await?;
    info!(runner_id = %runner_id, iterations, reason = ?stop_reason, "runner stopped");

    // One summary line per session in the daily run log.
    if let Ok(dir) = crate::logs::daily_log_dir(&project_root, Utc::now()) {
        let line = format!(
            "{} runner={runner_id} iterations={iterations} stop={stop_reason:?}\n",
            Utc::now().to_rfc3339()
        );
        let path = dir.join("runners.log");
        if let Err(e) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()))
        {
            warn!(error = %e, "failed to append daily run log");
        }
    }

    Ok(RunnerSummary {
        runner_id,
        iterations,
        stop_reason,
    })
}

/// Record the (dedup-keyed) incident, fire the hook, and poll until the
/// incident is resolved or the config file changes.
#[allow(clippy::too_many_arguments)]
async fn pause_on_credit_exhaustion(
    global: &SqlitePool,
    runner_id: Uuid,
    project_path: &str,
    project_ref: &ProjectRef,
    hooks: &dyn HookSink,
    exhaustion: &CreditExhaustion,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let role = exhaustion.role.to_string();
    let incident_id = incidents::record_credit_incident(
        global,
        &incidents::NewIncident {
            runner_id: Some(runner_id),
            project_path: Some(project_path),
            failure_mode: steroids_db::models::FailureMode::CreditExhaustion,
            provider: Some(&exhaustion.provider),
            model: Some(&exhaustion.model),
            role: Some(&role),
            message: Some(&exhaustion.message),
            details: json!({
                "provider": exhaustion.provider,
                "model": exhaustion.model,
                "role": role,
                "message": exhaustion.message,
            }),
        },
        Utc::now(),
    )
    .await?;

    hooks.emit(
        project_ref,
        HookEvent::CreditExhausted {
            provider: exhaustion.provider.clone(),
            model: exhaustion.model.clone(),
            role: role.clone(),
            message: exhaustion.message.clone(),
        },
    );

    runners::set_status(global, runner_id, RunnerStatus::Paused, Utc::now()).await?;
    warn!(
        runner_id = %runner_id,
        provider = %exhaustion.provider,
        "paused on credit exhaustion; waiting for resolution or config change"
    );

    let config_mtime_at_pause = config_mtime();
    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Explicit user resolution (dismiss / retry) clears the pause.
        let incident = incidents::get(global, incident_id).await?;
        if incident.is_none_or(|i| i.resolved_at.is_some()) {
            break;
        }

        // A config change also resolves the incident.
        if config_mtime() != config_mtime_at_pause {
            let _ = incidents::resolve(
                global,
                incident_id,
                IncidentResolution::ConfigChanged,
                Utc::now(),
            )
            .await?;
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = cancel.cancelled() => break,
        }
    }

    runners::set_status(global, runner_id, RunnerStatus::Running, Utc::now()).await?;
    steroids_db::queries::backoffs::clear(global, &exhaustion.provider).await?;
    hooks.emit(
        project_ref,
        HookEvent::CreditResolved {
            provider: exhaustion.provider.clone(),
            model: exhaustion.model.clone(),
            role,
            message: exhaustion.message.clone(),
        },
    );
    info!(runner_id = %runner_id, "credit pause lifted, resuming");
    Ok(())
}
