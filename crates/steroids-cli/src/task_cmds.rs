//! `steroids tasks ...` and `steroids sections ...` commands.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use steroids_db::models::TaskStatus;
use steroids_db::queries::{audit, invocations, sections, tasks};

use crate::output::{CliError, emit_success};
use crate::{TaskCommands, open_project};

pub async fn run_task_command(
    command: TaskCommands,
    project: &Path,
    json_mode: bool,
) -> Result<(), CliError> {
    let pool = open_project(project).await?;
    let result = dispatch(command, &pool, json_mode).await;
    pool.close().await;
    result
}

async fn dispatch(
    command: TaskCommands,
    pool: &sqlx::SqlitePool,
    json_mode: bool,
) -> Result<(), CliError> {
    match command {
        TaskCommands::Add { title, section } => {
            let section_id = match section {
                Some(name) => Some(
                    sections::get_section_by_name(pool, &name)
                        .await?
                        .with_context(|| format!("section '{name}' not found"))?
                        .id,
                ),
                None => None,
            };
            let task =
                steroids_core::state::create_task(pool, &title, section_id, None, None).await?;
            emit_success(json_mode, json!({ "task": &task }), || {
                println!("Created task {} ({})", task.id, task.title);
            });
        }
        TaskCommands::List { status } => {
            let status = status
                .map(|s| s.parse::<TaskStatus>())
                .transpose()
                .map_err(|e| CliError::General(anyhow::anyhow!(e)))?;
            let tasks = tasks::list_tasks(pool, status).await?;
            emit_success(json_mode, json!({ "tasks": &tasks }), || {
                for task in &tasks {
                    println!(
                        "{}  {:<12} rej={} {}",
                        task.id, task.status, task.rejection_count, task.title
                    );
                }
                println!("{} task(s)", tasks.len());
            });
        }
        TaskCommands::Show { task_id } => {
            let id = parse_uuid(&task_id)?;
            let task = tasks::get_task(pool, id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            let trail = audit::list_for_task(pool, id).await?;
            let runs = invocations::list_for_task(pool, id).await?;
            emit_success(
                json_mode,
                json!({ "task": &task, "audit": &trail, "invocations": &runs }),
                || {
                    println!("{}: {}", task.id, task.title);
                    println!(
                        "  status={} rejections={} failures={}",
                        task.status, task.rejection_count, task.failure_count
                    );
                    for entry in &trail {
                        let from = entry
                            .from_status
                            .map(|s| s.to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  [{}] {} -> {} by {} ({})",
                            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                            from,
                            entry.to_status,
                            entry.actor,
                            entry.notes.as_deref().unwrap_or("")
                        );
                    }
                    for run in &runs {
                        println!(
                            "  run [{}] {} {}/{} {} ({}ms)",
                            run.started_at.format("%Y-%m-%d %H:%M:%S"),
                            run.role,
                            run.provider,
                            run.model,
                            run.status,
                            run.duration_ms.unwrap_or(0)
                        );
                    }
                },
            );
        }
        TaskCommands::Promote { task_id } => {
            let id = parse_uuid(&task_id)?;
            let rows = tasks::set_promoted(pool, id, Utc::now()).await?;
            if rows == 0 {
                return Err(CliError::General(anyhow::anyhow!("task {task_id} not found")));
            }
            emit_success(json_mode, json!({ "promoted": &task_id }), || {
                println!("Task {task_id} promoted for implementation.");
            });
        }
    }
    Ok(())
}

pub async fn run_section_command(
    command: crate::SectionCommands,
    project: &Path,
    json_mode: bool,
) -> Result<(), CliError> {
    let pool = open_project(project).await?;
    let result = match command {
        crate::SectionCommands::Add { name, priority } => {
            let section =
                sections::insert_section(&pool, Uuid::new_v4(), &name, priority, None, Utc::now())
                    .await?;
            emit_success(json_mode, json!({ "section": &section }), || {
                println!("Created section {} ({})", section.id, section.name);
            });
            Ok(())
        }
        crate::SectionCommands::List => {
            let all = sections::list_sections(&pool).await?;
            let mut rows = Vec::new();
            for section in &all {
                let complete = sections::section_is_complete(&pool, section.id).await?;
                rows.push(json!({ "section": section, "complete": complete }));
            }
            emit_success(json_mode, json!({ "sections": rows }), || {
                for section in &all {
                    println!(
                        "{}  prio={} {}",
                        section.id,
                        section.priority.map_or("-".to_string(), |p| p.to_string()),
                        section.name
                    );
                }
            });
            Ok(())
        }
    };
    pool.close().await;
    result
}

fn parse_uuid(s: &str) -> Result<Uuid, CliError> {
    Uuid::parse_str(s)
        .with_context(|| format!("invalid task ID: {s}"))
        .map_err(CliError::General)
}
