//! Embedded SQL schemas for the per-project and global databases.
//!
//! SQLite has no server to migrate against, so both schemas are applied
//! idempotently (`CREATE TABLE IF NOT EXISTS`) every time a pool is opened.

/// Per-project schema: tasks, sections, audit trail, invocations, locks.
///
/// Stored at `<project>/.steroids/steroids.db`. Each project owns its file
/// exclusively.
pub const PROJECT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sections (
    id            BLOB PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE,
    priority      INTEGER,
    source_file   TEXT,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS section_dependencies (
    section_id            BLOB NOT NULL REFERENCES sections(id),
    depends_on_section_id BLOB NOT NULL REFERENCES sections(id),
    PRIMARY KEY (section_id, depends_on_section_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id                   BLOB PRIMARY KEY,
    title                TEXT NOT NULL,
    status               TEXT NOT NULL DEFAULT 'pending'
                         CHECK (status IN ('pending','in_progress','review','completed','disputed','skipped','failed')),
    section_id           BLOB REFERENCES sections(id),
    source_file          TEXT,
    rejection_count      INTEGER NOT NULL DEFAULT 0 CHECK (rejection_count >= 0),
    failure_count        INTEGER NOT NULL DEFAULT 0 CHECK (failure_count >= 0),
    coordinator_decision TEXT,
    coordinator_guidance TEXT,
    parent_task_id       BLOB REFERENCES tasks(id),
    promoted             INTEGER NOT NULL DEFAULT 0,
    created_at           TEXT NOT NULL,
    updated_at           TEXT NOT NULL,
    last_failure_at      TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_section ON tasks(section_id);

CREATE TABLE IF NOT EXISTS audit (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id     BLOB NOT NULL REFERENCES tasks(id),
    from_status TEXT,
    to_status   TEXT NOT NULL,
    actor       TEXT NOT NULL,
    actor_type  TEXT NOT NULL
                CHECK (actor_type IN ('human','orchestrator','coordinator','automation')),
    model       TEXT,
    notes       TEXT,
    commit_sha  TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_task ON audit(task_id, id);

CREATE TABLE IF NOT EXISTS task_invocations (
    id               BLOB PRIMARY KEY,
    task_id          BLOB NOT NULL REFERENCES tasks(id),
    role             TEXT NOT NULL
                     CHECK (role IN ('coder','reviewer','orchestrator','coordinator')),
    provider         TEXT NOT NULL,
    model            TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    completed_at     TEXT,
    exit_code        INTEGER,
    duration_ms      INTEGER,
    success          INTEGER NOT NULL DEFAULT 0,
    timed_out        INTEGER NOT NULL DEFAULT 0,
    session_id       TEXT,
    rejection_number INTEGER,
    status           TEXT NOT NULL DEFAULT 'running'
                     CHECK (status IN ('running','completed','failed'))
);

CREATE INDEX IF NOT EXISTS idx_invocations_task ON task_invocations(task_id, started_at);

CREATE TABLE IF NOT EXISTS task_locks (
    task_id      BLOB PRIMARY KEY REFERENCES tasks(id),
    runner_id    BLOB NOT NULL,
    acquired_at  TEXT NOT NULL,
    expires_at   TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL
);
"#;

/// Global schema: runners, sessions, workstreams, projects, incidents,
/// provider backoffs.
///
/// Stored at `~/.steroids/steroids.db`, shared by every runner process on
/// the host.
pub const GLOBAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runners (
    id                  BLOB PRIMARY KEY,
    pid                 INTEGER,
    status              TEXT NOT NULL DEFAULT 'running'
                        CHECK (status IN ('running','paused','stopped')),
    project_path        TEXT NOT NULL,
    current_task_id     BLOB,
    heartbeat_at        TEXT NOT NULL,
    parallel_session_id BLOB,
    started_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runners_project ON runners(project_path);

CREATE TABLE IF NOT EXISTS parallel_sessions (
    id           BLOB PRIMARY KEY,
    project_path TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workstreams (
    id               BLOB PRIMARY KEY,
    project_path     TEXT NOT NULL,
    runner_id        BLOB,
    status           TEXT NOT NULL DEFAULT 'idle'
                     CHECK (status IN ('idle','running','stopped')),
    claim_generation INTEGER NOT NULL DEFAULT 0,
    lease_expires_at TEXT,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_workstreams_project ON workstreams(project_path);

CREATE TABLE IF NOT EXISTS projects (
    id            BLOB PRIMARY KEY,
    name          TEXT NOT NULL,
    path          TEXT NOT NULL UNIQUE,
    enabled       INTEGER NOT NULL DEFAULT 1,
    registered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
    id           BLOB PRIMARY KEY,
    runner_id    BLOB,
    project_path TEXT,
    failure_mode TEXT NOT NULL
                 CHECK (failure_mode IN ('credit_exhaustion','orphaned_task','hanging_invocation','zombie_runner','dead_runner','rate_limit')),
    provider     TEXT,
    model        TEXT,
    role         TEXT,
    message      TEXT,
    details      TEXT NOT NULL DEFAULT '{}',
    detected_at  TEXT NOT NULL,
    resolved_at  TEXT,
    resolution   TEXT
                 CHECK (resolution IS NULL OR resolution IN ('config_changed','dismissed','manual','retry','auto_restart'))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_unresolved_dedup
    ON incidents(failure_mode, runner_id, provider, model, role)
    WHERE resolved_at IS NULL AND failure_mode = 'credit_exhaustion';

CREATE INDEX IF NOT EXISTS idx_incidents_detected ON incidents(detected_at);

CREATE TABLE IF NOT EXISTS provider_backoffs (
    provider   TEXT PRIMARY KEY,
    reason     TEXT NOT NULL,
    until      TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;
