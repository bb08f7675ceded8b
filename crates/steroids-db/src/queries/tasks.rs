//! Query functions for the `tasks` table, including the scheduler's
//! next-task selection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};
use uuid::Uuid;

use crate::models::{Task, TaskStatus};

/// Insert a new task row and return it.
pub async fn insert_task(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    title: &str,
    section_id: Option<Uuid>,
    source_file: Option<&str>,
    parent_task_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, title, section_id, source_file, parent_task_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(id)
    .bind(title)
    .bind(section_id)
    .bind(source_file)
    .bind(parent_task_id)
    .bind(now)
    .bind(now)
    .fetch_one(ex)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(ex: impl SqliteExecutor<'_>, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(ex)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks, optionally filtered by status, ordered by creation time.
pub async fn list_tasks(pool: &SqlitePool, status: Option<TaskStatus>) -> Result<Vec<Task>> {
    let tasks = match status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = ? ORDER BY created_at ASC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>("SELECT * FROM tasks ORDER BY created_at ASC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// List tasks belonging to a section, ordered by creation time.
pub async fn list_tasks_in_section(pool: &SqlitePool, section_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE section_id = ? ORDER BY created_at ASC",
    )
    .bind(section_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks in section")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Optimistic: the WHERE clause pins the expected `from` status, so the
/// returned row count is 0 when the task moved underneath the caller.
pub async fn transition_status(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(ex)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Set a task's status unconditionally (recovery paths).
pub async fn set_status(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    to: TaskStatus,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
        .bind(to)
        .bind(now)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to set task status")?;

    Ok(result.rows_affected())
}

/// Increment the rejection counter.
pub async fn increment_rejection_count(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET rejection_count = rejection_count + 1, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to increment rejection count")?;

    Ok(result.rows_affected())
}

/// Increment the failure counter and stamp `last_failure_at`.
pub async fn increment_failure_count(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET failure_count = failure_count + 1, last_failure_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to increment failure count")?;

    Ok(result.rows_affected())
}

/// Cache the coordinator's decision and guidance on the task.
pub async fn set_coordinator_cache(
    ex: impl SqliteExecutor<'_>,
    id: Uuid,
    decision: &str,
    guidance: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET coordinator_decision = ?, coordinator_guidance = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(decision)
    .bind(guidance)
    .bind(now)
    .bind(id)
    .execute(ex)
    .await
    .context("failed to cache coordinator guidance")?;

    Ok(result.rows_affected())
}

/// Set the human promotion flag on a follow-up task.
pub async fn set_promoted(ex: impl SqliteExecutor<'_>, id: Uuid, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET promoted = 1, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(ex)
        .await
        .context("failed to promote task")?;

    Ok(result.rows_affected())
}

/// Count tasks that still represent pending work for the wakeup probe.
pub async fn count_active_tasks(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE status IN ('pending', 'in_progress', 'review')",
    )
    .fetch_one(pool)
    .await
    .context("failed to count active tasks")?;

    Ok(row.0)
}

/// Tasks stuck in `in_progress` or `review` since before `cutoff`.
///
/// Input to the recovery sweep's classification pass.
pub async fn list_stuck_tasks(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('in_progress', 'review') AND updated_at < ? \
         ORDER BY updated_at ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stuck tasks")?;

    Ok(tasks)
}

/// Walk the `parent_task_id` chain and return the follow-up depth of a
/// task. Root tasks have depth 0.
pub async fn get_follow_up_depth(pool: &SqlitePool, id: Uuid) -> Result<i64> {
    let mut depth = 0i64;
    let mut current = id;

    loop {
        let parent: Option<(Option<Uuid>,)> =
            sqlx::query_as("SELECT parent_task_id FROM tasks WHERE id = ?")
                .bind(current)
                .fetch_optional(pool)
                .await
                .context("failed to read parent task")?;

        match parent {
            Some((Some(parent_id),)) => {
                depth += 1;
                current = parent_id;
                // A cycle in parent links would be a data bug; cap the walk.
                if depth > 64 {
                    anyhow::bail!("follow-up chain for task {id} exceeds 64 levels");
                }
            }
            _ => return Ok(depth),
        }
    }
}

/// Select the next eligible task for a runner.
///
/// Eligibility:
/// - status is `pending` (start) or `in_progress`/`review` (resume);
/// - the task's section, if any, has no unmet dependency -- a dependency
///   is unmet while the depended-on section still has any task that is
///   neither `completed` nor `skipped`;
/// - no other runner holds an unexpired lock on the task;
/// - pending follow-up tasks require the promotion flag before they are
///   scheduled.
///
/// Ordering: section priority DESC with NULLs last, then section name,
/// then task creation time. Sectionless tasks sort with the NULL-priority
/// group.
pub async fn find_next_task(
    pool: &SqlitePool,
    runner_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT t.* \
         FROM tasks t \
         LEFT JOIN sections s ON s.id = t.section_id \
         WHERE t.status IN ('pending', 'in_progress', 'review') \
           AND (t.status != 'pending' OR t.parent_task_id IS NULL OR t.promoted = 1) \
           AND NOT EXISTS ( \
               SELECT 1 FROM section_dependencies sd \
               JOIN tasks dep ON dep.section_id = sd.depends_on_section_id \
               WHERE sd.section_id = t.section_id \
                 AND dep.status NOT IN ('completed', 'skipped') \
           ) \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_locks l \
               WHERE l.task_id = t.id AND l.expires_at > ? AND l.runner_id != ? \
           ) \
         ORDER BY (s.priority IS NULL) ASC, s.priority DESC, s.name ASC, t.created_at ASC \
         LIMIT 1",
    )
    .bind(now)
    .bind(runner_id)
    .fetch_optional(pool)
    .await
    .context("failed to select next task")?;

    Ok(task)
}
