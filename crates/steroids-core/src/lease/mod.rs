//! Leases: generation-fenced workstream claims and per-task locks.
//!
//! Both are coarse-grained with a 120 s TTL, refreshed at every phase
//! boundary and before any long side effect. Losing the fence is fatal to
//! the current phase -- the caller must stop mutating state and let the
//! recovery sweep pick up the task.

pub mod recovery;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use steroids_db::queries::{locks, workstreams};

/// Lease TTL applied to workstream claims and task locks.
pub fn lease_ttl() -> Duration {
    Duration::seconds(120)
}

/// Raised when a fence check fails: the caller no longer holds its lease
/// and must abort the current phase instead of continuing to mutate.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease lost on workstream {workstream_id} (claim generation {claim_generation})")]
    WorkstreamLost {
        workstream_id: Uuid,
        claim_generation: i64,
    },
    #[error("lease lost on task {task_id} (runner {runner_id})")]
    TaskLockLost { task_id: Uuid, runner_id: Uuid },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A claimed workstream lease held by one runner.
///
/// The claim generation recorded here is the fence: any refresh that does
/// not match the row's current generation affects zero rows and surfaces
/// as [`LeaseError::WorkstreamLost`].
#[derive(Debug, Clone)]
pub struct WorkstreamLease {
    pub workstream_id: Uuid,
    pub runner_id: Uuid,
    pub claim_generation: i64,
}

impl WorkstreamLease {
    /// Claim a workstream for a runner. Returns `None` when another
    /// runner holds a live claim.
    pub async fn claim(
        global: &SqlitePool,
        workstream_id: Uuid,
        runner_id: Uuid,
    ) -> Result<Option<Self>> {
        let generation =
            workstreams::claim(global, workstream_id, runner_id, lease_ttl(), Utc::now())
                .await
                .context("workstream claim failed")?;

        Ok(generation.map(|claim_generation| Self {
            workstream_id,
            runner_id,
            claim_generation,
        }))
    }

    /// Refresh the lease. Fenced by claim generation.
    pub async fn refresh(&self, global: &SqlitePool) -> Result<(), LeaseError> {
        let rows = workstreams::refresh_lease(
            global,
            self.workstream_id,
            self.claim_generation,
            lease_ttl(),
            Utc::now(),
        )
        .await
        .map_err(LeaseError::Other)?;

        if rows != 1 {
            return Err(LeaseError::WorkstreamLost {
                workstream_id: self.workstream_id,
                claim_generation: self.claim_generation,
            });
        }
        Ok(())
    }

    /// Release the claim, returning the workstream to idle. A stale
    /// release (superseded generation) is a harmless no-op.
    pub async fn release(&self, global: &SqlitePool) -> Result<()> {
        workstreams::release(global, self.workstream_id, self.claim_generation, Utc::now())
            .await
            .context("workstream release failed")?;
        Ok(())
    }
}

/// An exclusive task lock held by one runner.
#[derive(Debug, Clone, Copy)]
pub struct TaskLease {
    pub task_id: Uuid,
    pub runner_id: Uuid,
}

impl TaskLease {
    /// Acquire the lock on a task (stealing an expired one). Returns
    /// `None` when another runner holds a live lock.
    pub async fn acquire(
        project: &SqlitePool,
        task_id: Uuid,
        runner_id: Uuid,
    ) -> Result<Option<Self>> {
        let acquired = locks::acquire(project, task_id, runner_id, lease_ttl(), Utc::now())
            .await
            .context("task lock acquisition failed")?;

        Ok(acquired.then_some(Self { task_id, runner_id }))
    }

    /// Refresh the lock, extending its expiry.
    pub async fn refresh(&self, project: &SqlitePool) -> Result<(), LeaseError> {
        let rows = locks::refresh(project, self.task_id, self.runner_id, lease_ttl(), Utc::now())
            .await
            .map_err(LeaseError::Other)?;

        if rows != 1 {
            return Err(LeaseError::TaskLockLost {
                task_id: self.task_id,
                runner_id: self.runner_id,
            });
        }
        Ok(())
    }

    /// Release the lock.
    pub async fn release(&self, project: &SqlitePool) -> Result<()> {
        locks::release(project, self.task_id, self.runner_id)
            .await
            .context("task lock release failed")?;
        Ok(())
    }
}

// -----------------------------------------------------------------------
// Pid probes
// -----------------------------------------------------------------------

/// Whether a pid exists (signal 0 probe).
#[cfg(unix)]
pub fn pid_alive(pid: i64) -> bool {
    // SAFETY: kill with signal 0 only checks for existence.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: i64) -> bool {
    false
}

/// Best-effort SIGTERM to a pid.
#[cfg(unix)]
pub fn terminate_pid(pid: i64) {
    // SAFETY: sending SIGTERM to an arbitrary pid is safe; failure is
    // reported via errno and ignored here.
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn terminate_pid(_pid: i64) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_two_minutes() {
        assert_eq!(lease_ttl().num_seconds(), 120);
    }

    #[cfg(unix)]
    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i64));
    }

    #[cfg(unix)]
    #[test]
    fn bogus_pid_is_dead() {
        // Pid 1 is always alive on Unix, so probe well above pid_max.
        assert!(!pid_alive(999_999_999));
    }
}
