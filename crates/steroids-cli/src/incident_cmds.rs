//! `steroids incidents ...` and `steroids projects ...` commands.

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use steroids_db::models::IncidentResolution;
use steroids_db::pool;
use steroids_db::queries::{backoffs, incidents, projects};

use crate::output::{CliError, emit_success};

pub async fn run_incident_list(json_mode: bool) -> Result<(), CliError> {
    let global = pool::open_global_pool().await?;
    let open = incidents::list_unresolved(&global).await?;
    let cooldowns = backoffs::list_all(&global).await?;
    global.close().await;

    emit_success(
        json_mode,
        json!({ "incidents": &open, "backoffs": &cooldowns }),
        || {
            for incident in &open {
                println!(
                    "{}  {:<20} provider={} model={} role={} since={}",
                    incident.id,
                    incident.failure_mode,
                    incident.provider.as_deref().unwrap_or("-"),
                    incident.model.as_deref().unwrap_or("-"),
                    incident.role.as_deref().unwrap_or("-"),
                    incident.detected_at.format("%Y-%m-%d %H:%M"),
                );
            }
            println!("{} open incident(s)", open.len());
            for backoff in &cooldowns {
                println!(
                    "cooldown: {} ({}) until {}",
                    backoff.provider,
                    backoff.reason,
                    backoff.until.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        },
    );
    Ok(())
}

pub async fn run_incident_resolve(
    incident_id: &str,
    resolution: &str,
    json_mode: bool,
) -> Result<(), CliError> {
    let id = Uuid::parse_str(incident_id)
        .with_context(|| format!("invalid incident ID: {incident_id}"))
        .map_err(CliError::General)?;
    let resolution = resolution
        .parse::<IncidentResolution>()
        .map_err(|e| CliError::General(anyhow::anyhow!(e)))?;

    let global = pool::open_global_pool().await?;
    let outcome = incidents::resolve(&global, id, resolution, Utc::now()).await?;
    global.close().await;

    emit_success(
        json_mode,
        json!({ "incident": incident_id, "outcome": format!("{outcome:?}") }),
        || match outcome {
            incidents::ResolveOutcome::Resolved => println!("Incident {incident_id} resolved."),
            incidents::ResolveOutcome::AlreadyResolved => {
                println!("Incident {incident_id} was already resolved.")
            }
            incidents::ResolveOutcome::NotFound => println!("Incident {incident_id} not found."),
        },
    );
    Ok(())
}

pub async fn run_project_register(
    path: &str,
    name: Option<&str>,
    json_mode: bool,
) -> Result<(), CliError> {
    let canonical = std::fs::canonicalize(path)
        .with_context(|| format!("project path {path} does not exist"))
        .map_err(CliError::General)?;
    let path_str = canonical.to_string_lossy().into_owned();
    let name = name
        .map(str::to_string)
        .or_else(|| {
            canonical
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| path_str.clone());

    let global = pool::open_global_pool().await?;
    let project = projects::register(&global, Uuid::new_v4(), &name, &path_str, Utc::now()).await?;
    global.close().await;

    emit_success(json_mode, json!({ "project": &project }), || {
        println!("Registered project {} at {}", project.name, project.path);
    });
    Ok(())
}

pub async fn run_project_unregister(path: &str, json_mode: bool) -> Result<(), CliError> {
    let path_str = std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string());

    let global = pool::open_global_pool().await?;
    let removed = projects::unregister(&global, &path_str).await?;
    global.close().await;

    if removed == 0 {
        return Err(CliError::General(anyhow::anyhow!(
            "project {path_str} is not registered"
        )));
    }
    emit_success(json_mode, json!({ "unregistered": &path_str }), || {
        println!("Unregistered project {path_str}.");
    });
    Ok(())
}

pub async fn run_project_set_enabled(
    path: &str,
    enabled: bool,
    json_mode: bool,
) -> Result<(), CliError> {
    let path_str = std::fs::canonicalize(path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string());

    let global = pool::open_global_pool().await?;
    let changed = projects::set_enabled(&global, &path_str, enabled).await?;
    global.close().await;

    if changed == 0 {
        return Err(CliError::General(anyhow::anyhow!(
            "project {path_str} is not registered"
        )));
    }
    let verb = if enabled { "enabled" } else { "disabled" };
    emit_success(json_mode, json!({ "project": &path_str, "enabled": enabled }), || {
        println!("Project {path_str} {verb}.");
    });
    Ok(())
}

pub async fn run_project_list(json_mode: bool) -> Result<(), CliError> {
    let global = pool::open_global_pool().await?;
    let all = projects::list_all(&global).await?;
    global.close().await;

    emit_success(json_mode, json!({ "projects": &all }), || {
        for project in &all {
            let state = if project.enabled { "enabled" } else { "disabled" };
            println!("{}  {:<8} {} ({})", project.id, state, project.path, project.name);
        }
        println!("{} project(s)", all.len());
    });
    Ok(())
}
