//! Transactional store operations.
//!
//! Couples every task status change with its audit row in one SQLite
//! transaction, enforcing the allowed transition graph and optimistic
//! status checks. Row-level queries live in `steroids_db::queries`; this
//! module owns atomicity.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use steroids_db::models::{ActorType, Task, TaskStatus};
use steroids_db::queries::{audit, incidents, tasks};

/// Metadata attached to an audited transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionMeta<'a> {
    pub actor: &'a str,
    pub actor_type: Option<ActorType>,
    pub model: Option<&'a str>,
    pub notes: Option<&'a str>,
    pub commit_sha: Option<&'a str>,
}

/// Check whether `from -> to` is an edge of the task state machine.
///
/// ```text
/// pending     -> in_progress
/// in_progress -> review | failed
/// review      -> completed | in_progress (reject) | disputed | skipped
/// ```
///
/// Recovery resets (any -> pending) bypass this graph and go through the
/// recovery sweep.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::InProgress)
            | (TaskStatus::InProgress, TaskStatus::Review)
            | (TaskStatus::InProgress, TaskStatus::Failed)
            | (TaskStatus::Review, TaskStatus::Completed)
            | (TaskStatus::Review, TaskStatus::InProgress)
            | (TaskStatus::Review, TaskStatus::Disputed)
            | (TaskStatus::Review, TaskStatus::Skipped)
    )
}

/// Execute a status transition and write its audit row atomically.
///
/// Optimistic: fails when the task's current status no longer matches
/// `from`. Returns the updated task.
pub async fn transition_task(
    pool: &SqlitePool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    meta: &TransitionMeta<'_>,
) -> Result<Task> {
    if !is_valid_transition(from, to) {
        bail!("invalid state transition: {from} -> {to} for task {task_id}");
    }

    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows = tasks::transition_status(&mut *tx, task_id, from, to, now).await?;
    if rows == 0 {
        let task = tasks::get_task(&mut *tx, task_id).await?;
        match task {
            None => bail!("task {task_id} not found"),
            Some(t) => bail!(
                "optimistic status check failed: task {task_id} has status {}, expected {from}",
                t.status
            ),
        }
    }

    audit::insert_entry(
        &mut *tx,
        &audit::NewAuditEntry {
            task_id,
            from_status: Some(from),
            to_status: to,
            actor: meta.actor,
            actor_type: meta.actor_type.unwrap_or(ActorType::Automation),
            model: meta.model,
            notes: meta.notes,
            commit_sha: meta.commit_sha,
        },
        now,
    )
    .await?;

    let task = tasks::get_task(&mut *tx, task_id)
        .await?
        .with_context(|| format!("task {task_id} vanished mid-transaction"))?;

    tx.commit().await.context("failed to commit transition")?;
    Ok(task)
}

/// Promote a pending task to `in_progress` under the scheduler's lease.
pub async fn start_task(pool: &SqlitePool, task_id: Uuid, actor: &str) -> Result<Task> {
    transition_task(
        pool,
        task_id,
        TaskStatus::Pending,
        TaskStatus::InProgress,
        &TransitionMeta {
            actor,
            actor_type: Some(ActorType::Automation),
            ..Default::default()
        },
    )
    .await
}

/// Approve a task: `review -> completed`, recording the commit sha.
pub async fn approve_task(
    pool: &SqlitePool,
    task_id: Uuid,
    actor: &str,
    notes: Option<&str>,
    commit_sha: Option<&str>,
) -> Result<Task> {
    transition_task(
        pool,
        task_id,
        TaskStatus::Review,
        TaskStatus::Completed,
        &TransitionMeta {
            actor,
            actor_type: Some(ActorType::Orchestrator),
            notes,
            commit_sha,
            ..Default::default()
        },
    )
    .await
}

/// Reject a task: `review -> in_progress`, incrementing the rejection
/// counter and storing the rejection note, all in one transaction.
pub async fn reject_task(
    pool: &SqlitePool,
    task_id: Uuid,
    actor: &str,
    note: Option<&str>,
) -> Result<Task> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows =
        tasks::transition_status(&mut *tx, task_id, TaskStatus::Review, TaskStatus::InProgress, now)
            .await?;
    if rows == 0 {
        let task = tasks::get_task(&mut *tx, task_id).await?;
        match task {
            None => bail!("task {task_id} not found"),
            Some(t) => bail!(
                "cannot reject task {task_id}: status is {}, expected review",
                t.status
            ),
        }
    }

    tasks::increment_rejection_count(&mut *tx, task_id, now).await?;

    audit::insert_entry(
        &mut *tx,
        &audit::NewAuditEntry {
            task_id,
            from_status: Some(TaskStatus::Review),
            to_status: TaskStatus::InProgress,
            actor,
            actor_type: ActorType::Orchestrator,
            model: None,
            notes: note,
            commit_sha: None,
        },
        now,
    )
    .await?;

    let task = tasks::get_task(&mut *tx, task_id)
        .await?
        .with_context(|| format!("task {task_id} vanished mid-transaction"))?;

    tx.commit().await.context("failed to commit rejection")?;
    Ok(task)
}

/// Create a task (optionally as a follow-up child of `parent_task_id`).
///
/// Creation is not a transition; no audit row is written until the task
/// first moves out of `pending`.
pub async fn create_task(
    pool: &SqlitePool,
    title: &str,
    section_id: Option<Uuid>,
    source_file: Option<&str>,
    parent_task_id: Option<Uuid>,
) -> Result<Task> {
    tasks::insert_task(
        pool,
        Uuid::new_v4(),
        title,
        section_id,
        source_file,
        parent_task_id,
        Utc::now(),
    )
    .await
}

/// Create a follow-up task under a parent, inheriting the parent's
/// section.
pub async fn create_follow_up_task(pool: &SqlitePool, parent: &Task, title: &str) -> Result<Task> {
    create_task(pool, title, parent.section_id, parent.source_file.as_deref(), Some(parent.id))
        .await
}

/// Append a free-form audit entry (no status change involved).
pub async fn add_audit_entry(
    pool: &SqlitePool,
    entry: &audit::NewAuditEntry<'_>,
) -> Result<i64> {
    audit::insert_entry(pool, entry, Utc::now()).await
}

/// Follow-up depth of a task (0 for root tasks).
pub async fn get_follow_up_depth(pool: &SqlitePool, task_id: Uuid) -> Result<i64> {
    tasks::get_follow_up_depth(pool, task_id).await
}

/// Notes of the latest coder submission, if any.
pub async fn get_latest_submission_notes(pool: &SqlitePool, task_id: Uuid) -> Result<Option<String>> {
    audit::latest_submission_notes(pool, task_id).await
}

/// All rejection notes for a task, oldest first.
pub async fn get_task_rejections(pool: &SqlitePool, task_id: Uuid) -> Result<Vec<String>> {
    audit::rejection_notes(pool, task_id).await
}

/// Record a credit-exhaustion incident in the global database, dedup-keyed
/// on (runner, provider, model, role) while unresolved.
pub async fn record_credit_incident(
    global: &SqlitePool,
    incident: &incidents::NewIncident<'_>,
) -> Result<Uuid> {
    incidents::record_credit_incident(global, incident, Utc::now()).await
}

/// Unresolved credit incidents, optionally filtered to one project.
pub async fn get_active_credit_incidents(
    global: &SqlitePool,
    project_path: Option<&str>,
) -> Result<Vec<steroids_db::models::Incident>> {
    incidents::active_credit_incidents(global, project_path).await
}

/// Resolve a credit incident; a second resolution is a no-op.
pub async fn resolve_credit_incident(
    global: &SqlitePool,
    id: Uuid,
    resolution: steroids_db::models::IncidentResolution,
) -> Result<incidents::ResolveOutcome> {
    incidents::resolve(global, id, resolution, Utc::now()).await
}
