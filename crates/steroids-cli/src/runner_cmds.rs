//! `steroids runners ...` and `steroids wakeup` commands.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use steroids_core::config::load_config;
use steroids_core::hooks::LogSink;
use steroids_core::provider::ProviderRegistry;
use steroids_core::provider::claude::ClaudeProvider;
use steroids_core::runner::{RunnerOptions, run_runner};
use steroids_core::wakeup::{DetachedSpawner, WakeupOptions, wakeup};
use steroids_db::pool;
use steroids_db::queries::runners;

use crate::output::{CliError, emit_success};

/// `steroids runners start [--parallel] --project <path>`
pub async fn run_start(project: &Path, parallel: bool, json_mode: bool) -> Result<(), CliError> {
    if !pool::project_is_initialized(project) {
        return Err(CliError::NotInitialized(project.display().to_string()));
    }

    let config = load_config()?;
    let global = pool::open_global_pool().await?;

    let mut registry = ProviderRegistry::new();
    registry.register(ClaudeProvider::new());

    let mut options = RunnerOptions::new(project);
    options.parallel = parallel;
    options.heartbeat_interval =
        std::time::Duration::from_secs(config.runners.heartbeat_interval_secs);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let summary = run_runner(
        options,
        Arc::new(registry),
        config,
        Arc::new(LogSink),
        global.clone(),
        cancel,
    )
    .await
    .map_err(|e| {
        // A claimed workstream is the runner-level resource lock.
        if e.to_string().contains("already claimed") {
            CliError::ResourceLocked(e.to_string())
        } else {
            CliError::General(e)
        }
    })?;

    global.close().await;

    emit_success(
        json_mode,
        json!({
            "runner_id": summary.runner_id,
            "iterations": summary.iterations,
            "stop_reason": format!("{:?}", summary.stop_reason),
        }),
        || {
            println!(
                "Runner {} stopped after {} iteration(s): {:?}",
                summary.runner_id, summary.iterations, summary.stop_reason
            );
        },
    );
    Ok(())
}

/// `steroids runners list`
pub async fn run_list(json_mode: bool) -> Result<(), CliError> {
    let global = pool::open_global_pool().await?;
    let all = runners::list_all(&global).await?;
    global.close().await;

    emit_success(json_mode, json!({ "runners": &all }), || {
        for runner in &all {
            println!(
                "{}  {:<8} pid={} heartbeat={} {}",
                runner.id,
                runner.status,
                runner.pid.map_or("-".to_string(), |p| p.to_string()),
                runner.heartbeat_at.format("%H:%M:%S"),
                runner.project_path
            );
        }
        println!("{} runner(s)", all.len());
    });
    Ok(())
}

/// `steroids runners stop <id>`: SIGTERM the process and drop the row.
pub async fn run_stop(runner_id: &str, json_mode: bool) -> Result<(), CliError> {
    let id = Uuid::parse_str(runner_id)
        .with_context(|| format!("invalid runner ID: {runner_id}"))
        .map_err(CliError::General)?;

    let global = pool::open_global_pool().await?;
    let runner = runners::get(&global, id)
        .await?
        .with_context(|| format!("runner {runner_id} not found"))?;

    if let Some(pid) = runner.pid {
        steroids_core::lease::terminate_pid(pid);
    }
    runners::set_status(&global, id, steroids_db::models::RunnerStatus::Stopped, Utc::now())
        .await?;
    runners::delete(&global, id).await?;
    global.close().await;

    emit_success(json_mode, json!({ "stopped": runner_id }), || {
        println!("Runner {runner_id} stopped.");
    });
    Ok(())
}

/// `steroids wakeup [--dry-run] [--quiet]`
pub async fn run_wakeup(dry_run: bool, quiet: bool, json_mode: bool) -> Result<(), CliError> {
    let global = pool::open_global_pool().await?;
    let results = wakeup(
        &global,
        &DetachedSpawner,
        &WakeupOptions { dry_run, quiet },
    )
    .await?;
    global.close().await;

    emit_success(json_mode, json!({ "results": &results }), || {
        for result in &results {
            let project = result.project.as_deref().unwrap_or("(host)");
            println!("{project}: {:?}", result.outcome);
        }
    });
    Ok(())
}
