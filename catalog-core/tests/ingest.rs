use std::sync::Arc;

use catalog_core::{
    DuplicateKind, EntityKind, EventInput, FollowUpTask, IngestConfig, IngestError,
    LifecycleState, ReviewStatus, WarningCode,
};
use chrono::Duration;
use common::{
    complete_listing, days_from_now, from_source, harness, harness_with, sparse_listing,
    with_occurrences,
};

mod common;

#[tokio::test]
async fn test_idempotent_replay_returns_same_event() {
    let h = harness();
    let input = complete_listing("Jazz Night", "The Rex", days_from_now(10));

    let first = h.service.ingest(input.clone(), Some("req-1")).await.unwrap();
    assert!(!first.is_duplicate);

    let replay = h.service.ingest(input, Some("req-1")).await.unwrap();
    assert!(replay.is_duplicate);
    assert_eq!(replay.duplicate_kind, Some(DuplicateKind::IdempotentReplay));
    assert_eq!(replay.event.id, first.event.id);
    assert_eq!(h.repo.events().await.len(), 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_payload_conflicts() {
    let h = harness();
    let start = days_from_now(10);

    let first = h
        .service
        .ingest(complete_listing("Jazz Night", "The Rex", start), Some("req-1"))
        .await
        .unwrap();

    let err = h
        .service
        .ingest(complete_listing("Blues Night", "The Rex", start), Some("req-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Conflict { ref key } if key == "req-1"));

    let events = h.repo.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], first.event);
}

#[tokio::test]
async fn test_source_identity_wins_over_content_changes() {
    let h = harness();
    let start = days_from_now(10);
    let original = from_source(
        complete_listing("Jazz Night", "The Rex", start),
        "tickets.example.com",
        "evt-42",
    );

    let first = h.service.ingest(original.clone(), None).await.unwrap();

    let mut edited = original;
    edited.description = Some("Now with a special guest".to_owned());
    let second = h.service.ingest(edited, None).await.unwrap();

    assert!(second.is_duplicate);
    assert_eq!(second.duplicate_kind, Some(DuplicateKind::SourceDuplicate));
    assert_eq!(second.event.id, first.event.id);
    assert_eq!(h.repo.events().await.len(), 1);
}

#[tokio::test]
async fn test_content_fingerprint_dedups_across_sources() {
    let h = harness();
    let start = days_from_now(10);

    let first = h
        .service
        .ingest(
            from_source(complete_listing("Jazz Night", "The Rex", start), "a.example.com", "1"),
            None,
        )
        .await
        .unwrap();

    // Same listing with different spacing and case, from another feed
    let mut other = complete_listing("  jazz   NIGHT ", "the rex", start);
    other.description = Some("Different blurb".to_owned());
    let second = h
        .service
        .ingest(from_source(other, "b.example.com", "xyz"), None)
        .await
        .unwrap();

    assert!(!first.is_duplicate);
    assert!(second.is_duplicate);
    assert_eq!(second.duplicate_kind, Some(DuplicateKind::ContentDuplicate));
    assert_eq!(second.event.id, first.event.id);
    assert_eq!(h.repo.events().await.len(), 1);

    // The second feed is now linked, so its id resolves by source identity
    let third = h
        .service
        .ingest(
            from_source(complete_listing("Jazz Night", "The Rex", start + Duration::days(1)), "b.example.com", "xyz"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(third.duplicate_kind, Some(DuplicateKind::SourceDuplicate));
    assert_eq!(third.event.id, first.event.id);
}

#[tokio::test]
async fn test_sparse_listing_is_drafted_with_one_pending_entry() {
    let h = harness();

    let result = h
        .service
        .ingest(sparse_listing("Open Mic", "Tranzac", days_from_now(5)), None)
        .await
        .unwrap();

    assert!(result.needs_review);
    assert_eq!(result.event.lifecycle_state, LifecycleState::Draft);
    let codes: Vec<WarningCode> = result.warnings.iter().map(|w| w.code).collect();
    assert!(codes.contains(&WarningCode::MissingDescription));
    assert!(codes.contains(&WarningCode::MissingImage));

    let entries = h.repo.review_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, ReviewStatus::Pending);
    assert_eq!(entries[0].event_id, result.event.id);
}

#[tokio::test]
async fn test_far_future_listing_needs_review_even_when_complete() {
    let h = harness();

    let result = h
        .service
        .ingest(complete_listing("Gala", "Massey Hall", days_from_now(800)), None)
        .await
        .unwrap();

    assert!(result.needs_review);
    assert_eq!(result.event.lifecycle_state, LifecycleState::Draft);
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(result.warnings[0].code, WarningCode::TooFarFuture);
}

#[tokio::test]
async fn test_require_image_flags_missing_image() {
    let h = harness_with(IngestConfig {
        require_image: true,
        ..Default::default()
    });
    let mut input = complete_listing("Poetry Slam", "Tranzac", days_from_now(5));
    input.image = None;

    let result = h.service.ingest(input, None).await.unwrap();
    assert!(result.needs_review);
    assert!(result.event.confidence < 0.9);
}

#[tokio::test]
async fn test_occurrences_fan_out() {
    let h = harness();
    let first = days_from_now(20);
    let input = with_occurrences(
        complete_listing("Hamlet", "Tarragon Theatre", first),
        &[first, first + Duration::days(1), first + Duration::days(2)],
    );

    let result = h.service.ingest(input, None).await.unwrap();

    let occurrences = h.repo.occurrences().await;
    assert_eq!(occurrences.len(), 3);
    assert!(occurrences.iter().all(|o| o.event_id == result.event.id));
    assert!(occurrences.iter().all(|o| o.timezone == "America/Toronto"));
    assert!(occurrences.iter().all(|o| o.venue_id == result.event.primary_venue_id));
}

#[tokio::test]
async fn test_single_start_persists_one_occurrence() {
    let h = harness();
    h.service
        .ingest(complete_listing("Hamlet", "Tarragon Theatre", days_from_now(20)), None)
        .await
        .unwrap();
    assert_eq!(h.repo.occurrences().await.len(), 1);
}

#[tokio::test]
async fn test_failed_occurrence_leaves_nothing_behind() {
    let h = harness();
    h.repo.fail_occurrence_inserts_after(Some(1)).await;
    let first = days_from_now(20);
    let input = with_occurrences(
        from_source(complete_listing("Hamlet", "Tarragon Theatre", first), "a.example.com", "h1"),
        &[first, first + Duration::days(1)],
    );

    let err = h.service.ingest(input, Some("req-h")).await.unwrap_err();
    assert!(err.is_transient());

    assert!(h.repo.events().await.is_empty());
    assert!(h.repo.occurrences().await.is_empty());
    assert!(h.repo.idempotency_keys().await.is_empty());
    assert!(h.repo.places().await.is_empty());
    assert!(h.tasks.recorded().await.is_empty());
}

#[tokio::test]
async fn test_validation_errors_name_the_field() {
    let h = harness();

    let mut input = complete_listing("Hamlet", "Tarragon Theatre", days_from_now(20));
    input.name = "   ".to_owned();
    let err = h.service.ingest(input, None).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { ref field, .. } if field == "name"));

    let mut input = complete_listing("Hamlet", "Tarragon Theatre", days_from_now(20));
    input.end_date = input.start_date.clone();
    let err = h.service.ingest(input, None).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { ref field, .. } if field == "endDate"));

    let mut input = complete_listing("Hamlet", "Tarragon Theatre", days_from_now(20));
    input.location = None;
    let err = h.service.ingest(input, None).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { ref field, .. } if field == "location"));

    assert!(h.repo.events().await.is_empty());
}

#[tokio::test]
async fn test_same_venue_is_reused() {
    let h = harness();
    let start = days_from_now(15);

    let first = h
        .service
        .ingest(complete_listing("Jazz Night", "The Rex Hotel & Jazz Bar", start), None)
        .await
        .unwrap();
    let second = h
        .service
        .ingest(
            complete_listing("Comedy Hour", "the rex hotel and jazz bar", start + Duration::days(3)),
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.repo.places().await.len(), 1);
    assert_eq!(first.event.primary_venue_id, second.event.primary_venue_id);
}

#[tokio::test]
async fn test_similar_venue_name_reuses_closest_place() {
    let h = harness();
    let start = days_from_now(15);

    let first = h
        .service
        .ingest(complete_listing("Jazz Night", "The Rex Hotel Jazz Bar", start), None)
        .await
        .unwrap();
    let second = h
        .service
        .ingest(
            complete_listing("Comedy Hour", "Rex Hotel Jazz Bar", start + Duration::days(3)),
            None,
        )
        .await
        .unwrap();

    assert_eq!(h.repo.places().await.len(), 1);
    assert_eq!(first.event.primary_venue_id, second.event.primary_venue_id);
}

#[tokio::test]
async fn test_near_duplicate_is_flagged_for_review() {
    let h = harness();
    let start = days_from_now(12);

    let first = h
        .service
        .ingest(complete_listing("Jazz Night", "Tranzac", start), None)
        .await
        .unwrap();
    let second = h
        .service
        .ingest(complete_listing("Jazz Nite", "Tranzac", start), None)
        .await
        .unwrap();

    assert!(!second.is_duplicate);
    assert!(second.needs_review);
    let warning = second
        .warnings
        .iter()
        .find(|w| w.code == WarningCode::PotentialDuplicate)
        .unwrap();
    assert_eq!(warning.candidates[0].event_id, first.event.id);
}

#[tokio::test]
async fn test_rejected_listing_cannot_be_resubmitted_with_same_issues() {
    let h = harness();
    let start = days_from_now(5);
    let input = from_source(sparse_listing("Open Mic", "Tranzac", start), "a.example.com", "om-1");

    let first = h.service.ingest(input.clone(), None).await.unwrap();
    let entry = &h.repo.review_entries().await[0];
    h.review.reject(entry.id, "moderator", "spam").await.unwrap();

    let err = h.service.ingest(input.clone(), None).await.unwrap_err();
    match err {
        IngestError::PreviouslyRejected {
            reason,
            reviewed_by,
            ..
        } => {
            assert_eq!(reason, "spam");
            assert_eq!(reviewed_by, "moderator");
        }
        other => panic!("unexpected error {other:?}"),
    }

    // Fixing one of the problems changes the warning codes and is accepted
    let mut fixed = input;
    fixed.image = Some("https://img.example.com/open-mic.jpg".to_owned());
    let resubmitted = h.service.ingest(fixed, None).await.unwrap();
    assert_ne!(resubmitted.event.id, first.event.id);
    assert!(!resubmitted.is_duplicate);
}

#[tokio::test]
async fn test_pending_draft_is_auto_approved_by_clean_resubmission() {
    let h = harness();
    let start = days_from_now(5);
    let sparse = from_source(sparse_listing("Open Mic", "Tranzac", start), "a.example.com", "om-2");

    let first = h.service.ingest(sparse.clone(), None).await.unwrap();
    assert!(first.needs_review);

    let mut complete = sparse;
    complete.description = Some("Bring your guitar".to_owned());
    let second = h.service.ingest(complete, None).await.unwrap();

    assert!(second.is_duplicate);
    assert!(!second.needs_review);
    assert_eq!(second.event.id, first.event.id);
    assert_eq!(second.event.lifecycle_state, LifecycleState::Active);

    let entries = h.repo.review_entries().await;
    assert_eq!(entries[0].status, ReviewStatus::Approved);
    assert_eq!(entries[0].reviewed_by.as_deref(), Some("system"));
}

#[tokio::test]
async fn test_redelivered_near_duplicate_stays_in_review() {
    let h = harness();
    let start = days_from_now(12);

    let original = h
        .service
        .ingest(complete_listing("Jazz Night", "Tranzac", start), None)
        .await
        .unwrap();
    let lookalike = complete_listing("Jazz Nite", "Tranzac", start);
    let first = h.service.ingest(lookalike.clone(), None).await.unwrap();
    assert!(first.needs_review);

    // Scrapers deliver the same listing again; that settles nothing
    let again = h.service.ingest(lookalike, None).await.unwrap();
    assert!(again.is_duplicate);
    assert!(again.needs_review);
    assert_eq!(again.event.id, first.event.id);
    assert_eq!(again.event.lifecycle_state, LifecycleState::Draft);
    let warning = again
        .warnings
        .iter()
        .find(|w| w.code == WarningCode::PotentialDuplicate)
        .unwrap();
    assert_eq!(warning.candidates[0].event_id, original.event.id);

    let entries = h.repo.review_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, ReviewStatus::Pending);
    assert!(entries[0].reviewed_by.is_none());
}

#[tokio::test]
async fn test_resubmission_refreshes_pending_warnings() {
    let h = harness();
    let start = days_from_now(800);
    let sparse = from_source(sparse_listing("Winter Fair", "Tranzac", start), "a.example.com", "wf-1");

    let first = h.service.ingest(sparse.clone(), None).await.unwrap();
    assert!(first.needs_review);
    assert_eq!(
        h.repo.review_entries().await[0].warning_codes(),
        vec![
            WarningCode::MissingDescription,
            WarningCode::MissingImage,
            WarningCode::TooFarFuture
        ]
    );

    // Still too far out, but the description gap is closed
    let mut better = sparse;
    better.description = Some("Crafts and cider".to_owned());
    let second = h.service.ingest(better, None).await.unwrap();

    assert!(second.is_duplicate);
    assert!(second.needs_review);
    let codes: Vec<WarningCode> = second.warnings.iter().map(|w| w.code).collect();
    assert_eq!(codes, vec![WarningCode::MissingImage, WarningCode::TooFarFuture]);

    let entries = h.repo.review_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, ReviewStatus::Pending);
    assert_eq!(
        entries[0].warning_codes(),
        vec![WarningCode::MissingImage, WarningCode::TooFarFuture]
    );
}

#[tokio::test]
async fn test_content_duplicate_merges_fields_by_trust() {
    let h = harness();
    let start = days_from_now(9);

    let mut listing = complete_listing("Jazz Night", "The Rex", start);
    listing.image = None;
    let first = h
        .service
        .ingest(from_source(listing, "a.example.com", "1"), None)
        .await
        .unwrap();
    assert_eq!(first.event.description.as_deref(), Some("Jazz Night live on stage"));

    // Equal trust: gaps are filled, the stored description stays
    let mut peer = complete_listing("Jazz Night", "The Rex", start);
    peer.description = Some("Peer blurb".to_owned());
    peer.keywords = vec!["jazz".to_owned()];
    let second = h
        .service
        .ingest(from_source(peer, "b.example.com", "2"), None)
        .await
        .unwrap();
    assert_eq!(second.duplicate_kind, Some(DuplicateKind::ContentDuplicate));
    assert!(second.is_merged);
    assert_eq!(second.event.description.as_deref(), Some("Jazz Night live on stage"));
    assert_eq!(
        second.event.image_url.as_deref(),
        Some("https://img.example.com/poster.jpg")
    );
    assert_eq!(second.event.keywords, vec!["jazz".to_owned()]);

    // A more trusted source overwrites filled fields
    let mut official = from_source(
        complete_listing("Jazz Night", "The Rex", start),
        "venue.example.com",
        "3",
    );
    official.description = Some("Official blurb".to_owned());
    if let Some(source) = official.source.as_mut() {
        source.trust_level = Some(8);
    }
    let third = h.service.ingest(official, None).await.unwrap();
    assert!(third.is_merged);
    assert_eq!(third.event.description.as_deref(), Some("Official blurb"));

    // Less trusted than the venue itself: nothing changes
    let mut rumor = from_source(
        complete_listing("Jazz Night", "The Rex", start),
        "d.example.com",
        "4",
    );
    rumor.description = Some("Rumor blurb".to_owned());
    if let Some(source) = rumor.source.as_mut() {
        source.trust_level = Some(3);
    }
    let fourth = h.service.ingest(rumor, None).await.unwrap();
    assert!(!fourth.is_merged);
    assert_eq!(fourth.event.description.as_deref(), Some("Official blurb"));

    let events = h.repo.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].description.as_deref(), Some("Official blurb"));
}

#[tokio::test]
async fn test_concurrent_submissions_create_one_event() {
    let h = harness();
    let input = complete_listing("Jazz Night", "The Rex", days_from_now(9));
    let service = Arc::new(h.service.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            let input = input.clone();
            tokio::spawn(async move { service.ingest(input, None).await })
        })
        .collect();

    let mut event_ids = Vec::new();
    let mut created = 0;
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        if !result.is_duplicate {
            created += 1;
        }
        event_ids.push(result.event.id);
    }

    assert_eq!(created, 1);
    event_ids.dedup();
    assert_eq!(event_ids.len(), 1);
    assert_eq!(h.repo.events().await.len(), 1);
}

#[tokio::test]
async fn test_follow_up_tasks_are_enqueued_after_commit() {
    let h = harness();

    let result = h
        .service
        .ingest(complete_listing("Jazz Night", "The Rex", days_from_now(9)), None)
        .await
        .unwrap();

    let venue_id = result.event.primary_venue_id.unwrap();
    let tasks = h.tasks.recorded().await;
    assert!(tasks.contains(&FollowUpTask::ReconcileEntity {
        entity: EntityKind::Place,
        entity_id: venue_id,
    }));
    assert!(tasks.contains(&FollowUpTask::GeocodePlace {
        place_id: venue_id,
        event_id: result.event.id,
    }));
}

#[tokio::test]
async fn test_task_queue_failures_do_not_fail_ingestion() {
    let h = harness();
    h.tasks.set_failing(true);

    let result = h
        .service
        .ingest(complete_listing("Jazz Night", "The Rex", days_from_now(9)), None)
        .await
        .unwrap();

    assert_eq!(result.event.lifecycle_state, LifecycleState::Active);
    assert_eq!(h.repo.events().await.len(), 1);
}

#[tokio::test]
async fn test_batch_reports_each_item() {
    let h = harness();
    let start = days_from_now(30);
    let mut broken: EventInput = complete_listing("Broken", "Tranzac", start);
    broken.start_date = Some("next tuesday".to_owned());

    let summary = h
        .service
        .ingest_batch(vec![
            complete_listing("Jazz Night", "The Rex", start),
            sparse_listing("Open Mic", "Tranzac", start + Duration::days(1)),
            broken,
            complete_listing("Jazz Night", "The Rex", start),
        ])
        .await;

    assert_eq!(summary.items.len(), 4);
    assert_eq!(summary.created, 1);
    assert_eq!(summary.review, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.duplicates, 1);
}
