use std::sync::Arc;

use catalog_core::{
    EventInput, IngestConfig, IngestService, MemoryRepository, MemoryTaskQueue, PlaceInput,
    RetentionConfig, ReviewQueue,
};
use catalog_janitor::{
    app_context::{AppContext, AppState},
    config::JanitorSettings,
    janitor::{CleanupResult, Janitor},
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

fn listing(name: &str, start: DateTime<Utc>) -> EventInput {
    EventInput {
        name: name.to_owned(),
        start_date: Some(start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        end_date: Some((start + Duration::hours(2)).to_rfc3339_opts(SecondsFormat::Secs, true)),
        location: Some(PlaceInput {
            name: "Tranzac".to_owned(),
            address_locality: Some("Toronto".to_owned()),
            address_region: Some("ON".to_owned()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn settings() -> JanitorSettings {
    JanitorSettings {
        id: "test_janitor".to_string(),
        cleanup_interval: Duration::seconds(30),
        ingest: IngestConfig::default(),
        retention: RetentionConfig::default(),
    }
}

#[tokio::test]
async fn janitor_test() {
    let repo = MemoryRepository::new();
    let service = IngestService::new(
        Arc::new(repo.clone()),
        Arc::new(MemoryTaskQueue::new()),
        IngestConfig::default(),
    );
    let review = ReviewQueue::new(
        Arc::new(repo.clone()),
        IngestConfig::default(),
        RetentionConfig::default(),
    );
    let janitor = Janitor::new(Arc::new(repo.clone()), settings());
    let now = Utc::now();

    // Nothing to do on an empty catalog
    let result = janitor.run_once(now).await.unwrap();
    assert_eq!(result, CleanupResult::default());

    // Listings with neither description nor image land in the review queue
    let soon = now + Duration::days(1);
    let later = now + Duration::days(30);
    service
        .ingest(listing("Open Mic", soon), Some("req-1"))
        .await
        .unwrap();
    service
        .ingest(listing("Zine Fair", later), None)
        .await
        .unwrap();

    let result = janitor.run_once(now).await.unwrap();
    assert_eq!(result.pending_reviews, 2);
    assert_eq!(result.expired_pending, 0);

    // Once the first listing has started without a decision, it is retired
    let result = janitor.run_once(soon + Duration::minutes(5)).await.unwrap();
    assert_eq!(result.expired_pending, 1);
    assert_eq!(result.pending_reviews, 1);
    assert_eq!(repo.tombstones().await[0].reason, "unreviewed");

    // A day on, the idempotency key from the first submission has expired too
    assert_eq!(result.idempotency_deleted, 1);
    assert!(repo.idempotency_keys().await.is_empty());

    // Rejections stick around for a week after the event
    let entry = review.list(None, 10, None).await.unwrap()[0].clone();
    review.reject(entry.id, "moderator", "spam").await.unwrap();
    let ended = later + Duration::hours(2);

    let result = janitor.run_once(ended + Duration::days(6)).await.unwrap();
    assert_eq!(result.rejected_deleted, 0);

    let result = janitor.run_once(ended + Duration::days(8)).await.unwrap();
    assert_eq!(result.rejected_deleted, 1);
    assert_eq!(result.pending_reviews, 0);

    let result = janitor.run_once(ended + Duration::days(8)).await.unwrap();
    assert_eq!(result, CleanupResult::default());
}

#[tokio::test]
async fn test_liveness_tracks_successful_runs() {
    let janitor = Janitor::new(Arc::new(MemoryRepository::new()), settings());
    let context = AppContext::new(janitor, false);
    let now = Utc::now();

    assert!(context.state.is_alive(now).await);
    assert!(!context.state.is_alive(now + Duration::minutes(3)).await);

    let mut status = context.state.get_status().await;
    status.last_successful_run = Some(now + Duration::minutes(3));
    context.state.set_status(status).await;
    assert!(context.state.is_alive(now + Duration::minutes(4)).await);

    let state = AppState::new(Duration::seconds(30));
    assert!(state.get_status().await.last_result.is_none());
}
