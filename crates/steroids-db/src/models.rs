use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Review,
    Completed,
    Disputed,
    Skipped,
    Failed,
}

impl TaskStatus {
    /// Statuses that count as "done" for section dependency gating.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Disputed => "disputed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "disputed" => Ok(Self::Disputed),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Who (or what) performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Human,
    Orchestrator,
    Coordinator,
    Automation,
}

impl fmt::Display for ActorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Human => "human",
            Self::Orchestrator => "orchestrator",
            Self::Coordinator => "coordinator",
            Self::Automation => "automation",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Role of an actor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationRole {
    Coder,
    Reviewer,
    Orchestrator,
    Coordinator,
}

impl fmt::Display for InvocationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Orchestrator => "orchestrator",
            Self::Coordinator => "coordinator",
        };
        f.write_str(s)
    }
}

impl FromStr for InvocationRole {
    type Err = InvocationRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coder" => Ok(Self::Coder),
            "reviewer" => Ok(Self::Reviewer),
            "orchestrator" => Ok(Self::Orchestrator),
            "coordinator" => Ok(Self::Coordinator),
            other => Err(InvocationRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvocationRole`] string.
#[derive(Debug, Clone)]
pub struct InvocationRoleParseError(pub String);

impl fmt::Display for InvocationRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invocation role: {:?}", self.0)
    }
}

impl std::error::Error for InvocationRoleParseError {}

// ---------------------------------------------------------------------------

/// Status of a single actor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Recoverable or surfaced failure classes recorded as incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    CreditExhaustion,
    OrphanedTask,
    HangingInvocation,
    ZombieRunner,
    DeadRunner,
    RateLimit,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreditExhaustion => "credit_exhaustion",
            Self::OrphanedTask => "orphaned_task",
            Self::HangingInvocation => "hanging_invocation",
            Self::ZombieRunner => "zombie_runner",
            Self::DeadRunner => "dead_runner",
            Self::RateLimit => "rate_limit",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureMode {
    type Err = FailureModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit_exhaustion" => Ok(Self::CreditExhaustion),
            "orphaned_task" => Ok(Self::OrphanedTask),
            "hanging_invocation" => Ok(Self::HangingInvocation),
            "zombie_runner" => Ok(Self::ZombieRunner),
            "dead_runner" => Ok(Self::DeadRunner),
            "rate_limit" => Ok(Self::RateLimit),
            other => Err(FailureModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FailureMode`] string.
#[derive(Debug, Clone)]
pub struct FailureModeParseError(pub String);

impl fmt::Display for FailureModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid failure mode: {:?}", self.0)
    }
}

impl std::error::Error for FailureModeParseError {}

// ---------------------------------------------------------------------------

/// How an incident was closed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IncidentResolution {
    ConfigChanged,
    Dismissed,
    Manual,
    Retry,
    AutoRestart,
}

impl fmt::Display for IncidentResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConfigChanged => "config_changed",
            Self::Dismissed => "dismissed",
            Self::Manual => "manual",
            Self::Retry => "retry",
            Self::AutoRestart => "auto_restart",
        };
        f.write_str(s)
    }
}

impl FromStr for IncidentResolution {
    type Err = IncidentResolutionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config_changed" => Ok(Self::ConfigChanged),
            "dismissed" => Ok(Self::Dismissed),
            "manual" => Ok(Self::Manual),
            "retry" => Ok(Self::Retry),
            "auto_restart" => Ok(Self::AutoRestart),
            other => Err(IncidentResolutionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`IncidentResolution`] string.
#[derive(Debug, Clone)]
pub struct IncidentResolutionParseError(pub String);

impl fmt::Display for IncidentResolutionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid incident resolution: {:?}", self.0)
    }
}

impl std::error::Error for IncidentResolutionParseError {}

// ---------------------------------------------------------------------------

/// Status of a supervised runner process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Lifecycle state of a workstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkstreamStatus {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for WorkstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row structs -- per-project database
// ---------------------------------------------------------------------------

/// A task -- the unit of work driven through the coder/reviewer loop.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    pub section_id: Option<Uuid>,
    pub source_file: Option<String>,
    pub rejection_count: i64,
    pub failure_count: i64,
    /// Cached coordinator verdict, reused between escalation thresholds.
    pub coordinator_decision: Option<String>,
    pub coordinator_guidance: Option<String>,
    /// Set when this task was created as a follow-up of another task.
    pub parent_task_id: Option<Uuid>,
    /// Human promotion flag required for deep follow-up tasks.
    pub promoted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// An ordered grouping of tasks with a scheduling priority.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Section {
    pub id: Uuid,
    pub name: String,
    pub priority: Option<i64>,
    pub source_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An edge in the section dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SectionDependency {
    pub section_id: Uuid,
    pub depends_on_section_id: Uuid,
}

/// One row of the append-only per-task audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub task_id: Uuid,
    pub from_status: Option<TaskStatus>,
    pub to_status: TaskStatus,
    pub actor: String,
    pub actor_type: ActorType,
    pub model: Option<String>,
    pub notes: Option<String>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One actor run against a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskInvocation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub role: InvocationRole,
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub duration_ms: Option<i64>,
    pub success: bool,
    pub timed_out: bool,
    /// Provider session id, used to resume interrupted coder sessions.
    pub session_id: Option<String>,
    pub rejection_number: Option<i64>,
    pub status: InvocationStatus,
}

/// Exclusive time-bounded reservation of a task by a runner.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskLock {
    pub task_id: Uuid,
    pub runner_id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Row structs -- global database
// ---------------------------------------------------------------------------

/// A supervised runner process registered on this host.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Runner {
    pub id: Uuid,
    pub pid: Option<i64>,
    pub status: RunnerStatus,
    pub project_path: String,
    pub current_task_id: Option<Uuid>,
    pub heartbeat_at: DateTime<Utc>,
    pub parallel_session_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
}

/// A parallel execution session grouping several runners.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ParallelSession {
    pub id: Uuid,
    pub project_path: String,
    pub created_at: DateTime<Utc>,
}

/// A parallel execution channel within a project.
///
/// `claim_generation` increases monotonically on every claim and fences
/// lease refreshes: a refresh with a stale generation affects zero rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workstream {
    pub id: Uuid,
    pub project_path: String,
    pub runner_id: Option<Uuid>,
    pub status: WorkstreamStatus,
    pub claim_generation: i64,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A registered project discovered by the wakeup controller.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub enabled: bool,
    pub registered_at: DateTime<Utc>,
}

/// A durable record of a recoverable or surfaced failure.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Incident {
    pub id: Uuid,
    pub runner_id: Option<Uuid>,
    pub project_path: Option<String>,
    pub failure_mode: FailureMode,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub role: Option<String>,
    pub message: Option<String>,
    /// Structured blob with provider/model/role/message context.
    pub details: serde_json::Value,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<IncidentResolution>,
}

/// Per-provider cooldown after a rate limit or credit exhaustion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProviderBackoff {
    pub provider: String,
    pub reason: String,
    pub until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
