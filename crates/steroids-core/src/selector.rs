//! Task selection for the runner loop.
//!
//! Thin wrapper over the store's next-task query that labels the result
//! with the phase action: fresh `pending` work starts, anything already
//! in flight resumes.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use steroids_db::models::{Task, TaskStatus};
use steroids_db::queries::tasks;

/// What the phase driver should do with the selected task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Start,
    Resume,
}

/// A scheduling decision.
#[derive(Debug, Clone)]
pub struct Selection {
    pub task: Task,
    pub action: NextAction,
}

/// Pick the next eligible task for this runner, honoring section
/// priority, section dependencies, status, and lease state.
pub async fn select_next_task(
    project: &SqlitePool,
    runner_id: Uuid,
) -> Result<Option<Selection>> {
    let task = tasks::find_next_task(project, runner_id, Utc::now()).await?;

    Ok(task.map(|task| {
        let action = if task.status == TaskStatus::Pending {
            NextAction::Start
        } else {
            NextAction::Resume
        };
        Selection { task, action }
    }))
}
