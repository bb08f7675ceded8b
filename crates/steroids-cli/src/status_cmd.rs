//! `steroids status`: per-section task counts and active locks.

use std::path::Path;

use serde_json::json;

use steroids_db::queries::{locks, sections, tasks};

use crate::output::{CliError, emit_success};
use crate::open_project;

pub async fn run_status(project: &Path, json_mode: bool) -> Result<(), CliError> {
    let pool = open_project(project).await?;

    let all_sections = sections::list_sections(&pool).await?;
    let mut section_rows = Vec::new();
    for section in &all_sections {
        let section_tasks = tasks::list_tasks_in_section(&pool, section.id).await?;
        let mut counts = std::collections::BTreeMap::new();
        for task in &section_tasks {
            *counts.entry(task.status.to_string()).or_insert(0u64) += 1;
        }
        section_rows.push(json!({
            "name": section.name,
            "priority": section.priority,
            "counts": counts,
            "total": section_tasks.len(),
        }));
    }

    let all_tasks = tasks::list_tasks(&pool, None).await?;
    let sectionless = all_tasks.iter().filter(|t| t.section_id.is_none()).count();
    let active_locks = locks::list_all(&pool).await?;

    let data = json!({
        "sections": &section_rows,
        "sectionless_tasks": sectionless,
        "total_tasks": all_tasks.len(),
        "active_locks": &active_locks,
    });

    emit_success(json_mode, data, || {
        println!("Project: {}", project.display());
        for row in &section_rows {
            println!(
                "  {} (prio {}): {}",
                row["name"].as_str().unwrap_or("?"),
                row["priority"],
                row["counts"]
            );
        }
        if sectionless > 0 {
            println!("  (no section): {sectionless} task(s)");
        }
        println!("{} task(s) total, {} active lock(s)", all_tasks.len(), active_locks.len());
    });

    pool.close().await;
    Ok(())
}
