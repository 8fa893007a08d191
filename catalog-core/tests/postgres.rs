use std::sync::Arc;
use std::time::Duration as StdDuration;

use catalog_core::{
    EntityKind, FollowUpTask, IngestConfig, IngestService, MemoryTaskQueue, PgRepository,
    PgTaskQueue, RetentionConfig, RetryPolicy, ReviewQueue, ReviewStatus, TaskQueue, TaskStatus,
};
use common::{complete_listing, days_from_now, from_source, sparse_listing};
use sqlx::PgPool;

mod common;

fn service(db: &PgPool) -> (IngestService, ReviewQueue) {
    let repo = Arc::new(PgRepository::from_pool(db.clone()));
    let service = IngestService::new(
        repo.clone(),
        Arc::new(MemoryTaskQueue::new()),
        IngestConfig::default(),
    );
    let review = ReviewQueue::new(repo, IngestConfig::default(), RetentionConfig::default());
    (service, review)
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_ingest_deduplicates(db: PgPool) {
    let (service, _) = service(&db);
    let start = days_from_now(14);

    let first = service
        .ingest(
            from_source(complete_listing("Jazz Night", "The Rex", start), "tickets.example.com", "881"),
            Some("req-1"),
        )
        .await
        .unwrap();
    assert!(!first.is_duplicate);

    let replay = service
        .ingest(
            from_source(complete_listing("Jazz Night", "The Rex", start), "tickets.example.com", "881"),
            Some("req-1"),
        )
        .await
        .unwrap();
    assert!(replay.is_duplicate);
    assert_eq!(replay.event.id, first.event.id);

    let rebroadcast = service
        .ingest(complete_listing("Jazz Night", "The Rex", start), None)
        .await
        .unwrap();
    assert!(rebroadcast.is_duplicate);
    assert_eq!(rebroadcast.event.uid, first.event.uid);

    let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(events, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_content_duplicate_merges_fields(db: PgPool) {
    let (service, _) = service(&db);
    let start = days_from_now(9);

    let mut listing = complete_listing("Jazz Night", "The Rex", start);
    listing.image = None;
    service
        .ingest(from_source(listing, "a.example.com", "1"), None)
        .await
        .unwrap();

    let mut official = from_source(
        complete_listing("Jazz Night", "The Rex", start),
        "venue.example.com",
        "2",
    );
    official.description = Some("Official blurb".to_owned());
    official.keywords = vec!["jazz".to_owned()];
    if let Some(source) = official.source.as_mut() {
        source.trust_level = Some(8);
    }
    let merged = service.ingest(official, None).await.unwrap();

    assert!(merged.is_duplicate);
    assert!(merged.is_merged);
    assert_eq!(merged.event.description.as_deref(), Some("Official blurb"));
    assert_eq!(
        merged.event.image_url.as_deref(),
        Some("https://img.example.com/poster.jpg")
    );
    assert_eq!(merged.event.keywords, vec!["jazz".to_owned()]);

    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_sources")
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(links, 2);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_review_round_trip(db: PgPool) {
    let (service, review) = service(&db);
    let result = service
        .ingest(sparse_listing("Open Mic", "Tranzac", days_from_now(3)), None)
        .await
        .unwrap();
    assert!(result.needs_review);

    let pending = review
        .list(Some(ReviewStatus::Pending), 10, None)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let rejected = review.reject(pending[0].id, "moderator", "spam").await.unwrap();
    assert_eq!(rejected.status, ReviewStatus::Rejected);

    let reason: String = sqlx::query_scalar("SELECT reason FROM event_tombstones WHERE event_id = $1")
        .bind(result.event.id)
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(reason, "rejected");

    let err = service
        .ingest(sparse_listing("Open Mic", "Tranzac", days_from_now(3)), None)
        .await
        .unwrap_err();
    assert!(matches!(err, catalog_core::IngestError::PreviouslyRejected { .. }));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_task_queue_retries_then_fails(db: PgPool) {
    let queue = PgTaskQueue::new(db.clone()).with_retry_policy(
        RetryPolicy::new(1, StdDuration::from_secs(0), None),
        2,
    );
    let task = FollowUpTask::ReconcileEntity {
        entity: EntityKind::Place,
        entity_id: 7,
    };
    queue.enqueue(task.clone()).await.unwrap();

    let claimed = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(claimed.kind, "reconcile_entity");
    assert_eq!(claimed.parameters.0, task);
    assert_eq!(claimed.attempt, 1);
    assert!(queue.dequeue().await.unwrap().is_none());

    assert_eq!(
        queue.fail(&claimed, "timeout").await.unwrap(),
        TaskStatus::Available
    );

    let retried = queue.dequeue().await.unwrap().unwrap();
    assert_eq!(retried.id, claimed.id);
    assert_eq!(retried.attempt, 2);
    assert_eq!(retried.last_error.as_deref(), Some("timeout"));
    assert_eq!(
        queue.fail(&retried, "timeout").await.unwrap(),
        TaskStatus::Failed
    );
    assert!(queue.dequeue().await.unwrap().is_none());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_pg_task_queue_completes(db: PgPool) {
    let queue = PgTaskQueue::new(db.clone());
    queue
        .enqueue(FollowUpTask::GeocodePlace {
            place_id: 1,
            event_id: 2,
        })
        .await
        .unwrap();

    let claimed = queue.dequeue().await.unwrap().unwrap();
    queue.complete(claimed.id).await.unwrap();

    let status: TaskStatus = sqlx::query_scalar("SELECT status FROM catalog_tasks WHERE id = $1")
        .bind(claimed.id)
        .fetch_one(&db)
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Completed);
}
