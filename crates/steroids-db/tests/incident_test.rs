//! Integration tests for incident dedup and resolution idempotence.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use steroids_db::models::{FailureMode, IncidentResolution};
use steroids_db::queries::{incidents, runners};
use steroids_test_utils::create_global_db;

fn credit_incident<'a>(runner_id: Uuid) -> incidents::NewIncident<'a> {
    incidents::NewIncident {
        runner_id: Some(runner_id),
        project_path: Some("/tmp/project"),
        failure_mode: FailureMode::CreditExhaustion,
        provider: Some("claude"),
        model: Some("claude-sonnet-4-5"),
        role: Some("coder"),
        message: Some("Insufficient credits"),
        details: json!({"message": "Insufficient credits"}),
    }
}

#[tokio::test]
async fn record_credit_incident_is_idempotent_on_dedup_key() {
    let db = create_global_db().await;
    let runner_id = Uuid::new_v4();

    let first = incidents::record_credit_incident(&db.pool, &credit_incident(runner_id), Utc::now())
        .await
        .unwrap();
    let second =
        incidents::record_credit_incident(&db.pool, &credit_incident(runner_id), Utc::now())
            .await
            .unwrap();

    assert_eq!(first, second, "same dedup key must return the same id");

    let open = incidents::list_unresolved(&db.pool).await.unwrap();
    assert_eq!(open.len(), 1, "exactly one row inserted");
}

#[tokio::test]
async fn different_role_is_a_different_incident() {
    let db = create_global_db().await;
    let runner_id = Uuid::new_v4();

    let coder = incidents::record_credit_incident(&db.pool, &credit_incident(runner_id), Utc::now())
        .await
        .unwrap();

    let mut reviewer_incident = credit_incident(runner_id);
    reviewer_incident.role = Some("reviewer");
    let reviewer =
        incidents::record_credit_incident(&db.pool, &reviewer_incident, Utc::now())
            .await
            .unwrap();

    assert_ne!(coder, reviewer);
    assert_eq!(incidents::list_unresolved(&db.pool).await.unwrap().len(), 2);
}

#[tokio::test]
async fn resolving_reopens_the_dedup_slot() {
    let db = create_global_db().await;
    let runner_id = Uuid::new_v4();

    let first = incidents::record_credit_incident(&db.pool, &credit_incident(runner_id), Utc::now())
        .await
        .unwrap();
    incidents::resolve(&db.pool, first, IncidentResolution::Retry, Utc::now())
        .await
        .unwrap();

    let second =
        incidents::record_credit_incident(&db.pool, &credit_incident(runner_id), Utc::now())
            .await
            .unwrap();
    assert_ne!(first, second, "a resolved incident no longer dedups");
}

#[tokio::test]
async fn resolve_is_idempotent() {
    let db = create_global_db().await;
    let id = incidents::record_credit_incident(
        &db.pool,
        &credit_incident(Uuid::new_v4()),
        Utc::now(),
    )
    .await
    .unwrap();

    let first = incidents::resolve(&db.pool, id, IncidentResolution::Dismissed, Utc::now())
        .await
        .unwrap();
    assert_eq!(first, incidents::ResolveOutcome::Resolved);

    // Second resolution with a different resolution value is a no-op.
    let second = incidents::resolve(&db.pool, id, IncidentResolution::Retry, Utc::now())
        .await
        .unwrap();
    assert_eq!(second, incidents::ResolveOutcome::AlreadyResolved);

    let incident = incidents::get(&db.pool, id).await.unwrap().unwrap();
    assert_eq!(incident.resolution, Some(IncidentResolution::Dismissed));
}

#[tokio::test]
async fn resolve_missing_incident_reports_not_found() {
    let db = create_global_db().await;
    let outcome = incidents::resolve(
        &db.pool,
        Uuid::new_v4(),
        IncidentResolution::Manual,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(outcome, incidents::ResolveOutcome::NotFound);
}

#[tokio::test]
async fn active_credit_incidents_filter_by_project() {
    let db = create_global_db().await;

    let runner_a = runners::register(
        &db.pool,
        Uuid::new_v4(),
        Some(1),
        "/projects/alpha",
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    let runner_b = runners::register(
        &db.pool,
        Uuid::new_v4(),
        Some(2),
        "/projects/beta",
        None,
        Utc::now(),
    )
    .await
    .unwrap();

    let mut a = credit_incident(runner_a.id);
    a.project_path = None;
    incidents::record_credit_incident(&db.pool, &a, Utc::now()).await.unwrap();
    let mut b = credit_incident(runner_b.id);
    b.project_path = None;
    incidents::record_credit_incident(&db.pool, &b, Utc::now()).await.unwrap();

    let alpha = incidents::active_credit_incidents(&db.pool, Some("/projects/alpha"))
        .await
        .unwrap();
    assert_eq!(alpha.len(), 1);
    assert_eq!(alpha[0].runner_id, Some(runner_a.id));

    // No filter returns everything unresolved.
    let all = incidents::active_credit_incidents(&db.pool, None).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn count_since_supports_the_rate_limiter() {
    let db = create_global_db().await;
    for i in 0..3 {
        let mut incident = credit_incident(Uuid::new_v4());
        incident.role = Some("coder");
        let _ = i;
        incidents::insert(
            &db.pool,
            Uuid::new_v4(),
            &incident,
            Some(IncidentResolution::AutoRestart),
            Utc::now(),
        )
        .await
        .unwrap();
    }

    let recent = incidents::count_since(&db.pool, Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(recent, 3);

    let future = incidents::count_since(&db.pool, Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(future, 0);
}
