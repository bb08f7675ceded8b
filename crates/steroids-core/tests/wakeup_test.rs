//! Integration tests for the wakeup controller.

use std::sync::Mutex;

use chrono::{Duration, Utc};
use uuid::Uuid;

use steroids_core::wakeup::{RunnerSpawner, WakeupOptions, WakeupOutcome, wakeup};
use steroids_db::models::TaskStatus;
use steroids_db::queries::{projects, runners, tasks};
use steroids_test_utils::{TestDb, create_global_db, create_project_db};

/// Records spawn requests instead of forking processes.
#[derive(Default)]
struct RecordingSpawner {
    spawned: Mutex<Vec<String>>,
}

impl RunnerSpawner for RecordingSpawner {
    fn spawn(&self, project_path: &str) -> anyhow::Result<u32> {
        let mut spawned = self.spawned.lock().unwrap();
        spawned.push(project_path.to_string());
        Ok(4000 + spawned.len() as u32)
    }
}

async fn register(global: &sqlx::SqlitePool, db: &TestDb, name: &str) -> String {
    let path = db.project_root.to_string_lossy().into_owned();
    projects::register(global, Uuid::new_v4(), name, &path, Utc::now()).await.unwrap();
    path
}

async fn seed_tasks(db: &TestDb, statuses: &[TaskStatus]) {
    for (i, status) in statuses.iter().enumerate() {
        let task = tasks::insert_task(
            &db.pool,
            Uuid::new_v4(),
            &format!("task {i}"),
            None,
            None,
            None,
            Utc::now(),
        )
        .await
        .unwrap();
        if *status != TaskStatus::Pending {
            tasks::set_status(&db.pool, task.id, *status, Utc::now()).await.unwrap();
        }
    }
}

fn outcome_for<'a>(
    results: &'a [steroids_core::wakeup::WakeupResult],
    project: &str,
) -> &'a WakeupOutcome {
    &results
        .iter()
        .find(|r| r.project.as_deref() == Some(project))
        .expect("result for project")
        .outcome
}

#[tokio::test]
async fn mixed_projects_start_only_where_work_is_pending() {
    let global = create_global_db().await;

    // P1: pending tasks. P2: everything completed. P3: in_progress only.
    let p1 = create_project_db().await;
    let p2 = create_project_db().await;
    let p3 = create_project_db().await;
    seed_tasks(&p1, &[TaskStatus::Pending; 5]).await;
    seed_tasks(&p2, &[TaskStatus::Completed, TaskStatus::Completed]).await;
    seed_tasks(&p3, &[TaskStatus::InProgress]).await;

    let p1_path = register(&global.pool, &p1, "p1").await;
    let p2_path = register(&global.pool, &p2, "p2").await;
    let p3_path = register(&global.pool, &p3, "p3").await;

    let spawner = RecordingSpawner::default();
    let results = wakeup(&global.pool, &spawner, &WakeupOptions::default()).await.unwrap();

    assert!(matches!(outcome_for(&results, &p1_path), WakeupOutcome::Started { .. }));
    assert_eq!(
        outcome_for(&results, &p2_path),
        &WakeupOutcome::None {
            reason: "No pending tasks".to_string()
        }
    );
    assert!(matches!(outcome_for(&results, &p3_path), WakeupOutcome::Started { .. }));

    let spawned = spawner.spawned.lock().unwrap();
    assert_eq!(spawned.len(), 2);
    assert!(spawned.contains(&p1_path));
    assert!(spawned.contains(&p3_path));
}

#[tokio::test]
async fn active_runner_suppresses_spawn() {
    let global = create_global_db().await;
    let p1 = create_project_db().await;
    seed_tasks(&p1, &[TaskStatus::Pending]).await;
    let p1_path = register(&global.pool, &p1, "p1").await;

    // A live non-parallel runner: fresh heartbeat, our own (alive) pid.
    runners::register(
        &global.pool,
        Uuid::new_v4(),
        Some(std::process::id() as i64),
        &p1_path,
        None,
        Utc::now(),
    )
    .await
    .unwrap();

    let spawner = RecordingSpawner::default();
    let results = wakeup(&global.pool, &spawner, &WakeupOptions::default()).await.unwrap();

    assert_eq!(
        outcome_for(&results, &p1_path),
        &WakeupOutcome::None {
            reason: "already active".to_string()
        }
    );
    assert!(spawner.spawned.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stale_runners_are_cleaned_first() {
    let global = create_global_db().await;
    let p1 = create_project_db().await;
    seed_tasks(&p1, &[TaskStatus::Pending]).await;
    let p1_path = register(&global.pool, &p1, "p1").await;

    // A runner with a stale heartbeat and a dead pid.
    let stale = runners::register(
        &global.pool,
        Uuid::new_v4(),
        Some(999_999_999),
        &p1_path,
        None,
        Utc::now() - Duration::minutes(10),
    )
    .await
    .unwrap();

    let spawner = RecordingSpawner::default();
    let results = wakeup(&global.pool, &spawner, &WakeupOptions::default()).await.unwrap();

    // The stale row was removed, so the project spawns.
    let cleaned = results
        .iter()
        .find(|r| matches!(r.outcome, WakeupOutcome::Cleaned { .. }))
        .unwrap();
    assert_eq!(cleaned.outcome, WakeupOutcome::Cleaned { removed: 1 });
    assert!(matches!(outcome_for(&results, &p1_path), WakeupOutcome::Started { .. }));
    assert!(runners::get(&global.pool, stale.id).await.unwrap().is_none());
}

#[tokio::test]
async fn dry_run_reports_without_spawning() {
    let global = create_global_db().await;
    let p1 = create_project_db().await;
    seed_tasks(&p1, &[TaskStatus::Pending]).await;
    let p1_path = register(&global.pool, &p1, "p1").await;

    let spawner = RecordingSpawner::default();
    let opts = WakeupOptions {
        dry_run: true,
        quiet: true,
    };
    let results = wakeup(&global.pool, &spawner, &opts).await.unwrap();

    assert_eq!(outcome_for(&results, &p1_path), &WakeupOutcome::WouldStart);
    assert!(spawner.spawned.lock().unwrap().is_empty());
}

#[tokio::test]
async fn no_registered_projects_yields_synthetic_result() {
    let global = create_global_db().await;
    let spawner = RecordingSpawner::default();
    let results = wakeup(&global.pool, &spawner, &WakeupOptions::default()).await.unwrap();

    assert!(results.iter().any(|r| {
        matches!(&r.outcome, WakeupOutcome::None { reason } if reason == "No registered projects")
    }));
}

#[tokio::test]
async fn missing_project_path_is_reported() {
    let global = create_global_db().await;
    projects::register(
        &global.pool,
        Uuid::new_v4(),
        "ghost",
        "/nonexistent/ghost-project",
        Utc::now(),
    )
    .await
    .unwrap();

    let spawner = RecordingSpawner::default();
    let results = wakeup(&global.pool, &spawner, &WakeupOptions::default()).await.unwrap();

    assert_eq!(
        outcome_for(&results, "/nonexistent/ghost-project"),
        &WakeupOutcome::None {
            reason: "not found".to_string()
        }
    );
}

#[tokio::test]
async fn wakeup_is_idempotent_without_external_change() {
    let global = create_global_db().await;
    let p2 = create_project_db().await;
    seed_tasks(&p2, &[TaskStatus::Completed]).await;
    let p2_path = register(&global.pool, &p2, "p2").await;

    let spawner = RecordingSpawner::default();
    let opts = WakeupOptions {
        dry_run: true,
        quiet: true,
    };
    let first = wakeup(&global.pool, &spawner, &opts).await.unwrap();
    let second = wakeup(&global.pool, &spawner, &opts).await.unwrap();
    assert_eq!(first, second);
    let _ = p2_path;
}
