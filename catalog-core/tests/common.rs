use std::sync::Arc;

use catalog_core::{
    EventInput, IngestConfig, IngestService, MemoryRepository, MemoryTaskQueue, OccurrenceInput,
    PlaceInput, RetentionConfig, ReviewQueue, SourceInput,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};

#[allow(dead_code)]
pub struct Harness {
    pub repo: MemoryRepository,
    pub tasks: MemoryTaskQueue,
    pub service: IngestService,
    pub review: ReviewQueue,
}

#[allow(dead_code)]
pub fn harness() -> Harness {
    harness_with(IngestConfig::default())
}

#[allow(dead_code)]
pub fn harness_with(config: IngestConfig) -> Harness {
    let repo = MemoryRepository::new();
    let tasks = MemoryTaskQueue::new();
    let service = IngestService::new(
        Arc::new(repo.clone()),
        Arc::new(tasks.clone()),
        config.clone(),
    );
    let review = ReviewQueue::new(Arc::new(repo.clone()), config, RetentionConfig::default());
    Harness {
        repo,
        tasks,
        service,
        review,
    }
}

#[allow(dead_code)]
pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// Whole seconds, so the same instant always renders to the same string
#[allow(dead_code)]
pub fn days_from_now(days: i64) -> DateTime<Utc> {
    let at = Utc::now() + Duration::days(days);
    DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at)
}

/// A listing with description and image, published without review.
#[allow(dead_code)]
pub fn complete_listing(name: &str, venue: &str, start: DateTime<Utc>) -> EventInput {
    EventInput {
        name: name.to_owned(),
        description: Some(format!("{name} live on stage")),
        start_date: Some(rfc3339(start)),
        end_date: Some(rfc3339(start + Duration::hours(3))),
        location: Some(PlaceInput {
            name: venue.to_owned(),
            address_locality: Some("Toronto".to_owned()),
            address_region: Some("ON".to_owned()),
            ..Default::default()
        }),
        image: Some("https://img.example.com/poster.jpg".to_owned()),
        url: Some("https://example.com/events/1".to_owned()),
        ..Default::default()
    }
}

/// A listing with neither description nor image.
#[allow(dead_code)]
pub fn sparse_listing(name: &str, venue: &str, start: DateTime<Utc>) -> EventInput {
    EventInput {
        description: None,
        image: None,
        ..complete_listing(name, venue, start)
    }
}

#[allow(dead_code)]
pub fn from_source(mut input: EventInput, source: &str, event_id: &str) -> EventInput {
    input.source = Some(SourceInput {
        name: source.to_owned(),
        url: format!("https://{source}/events/{event_id}"),
        event_id: Some(event_id.to_owned()),
        ..Default::default()
    });
    input
}

#[allow(dead_code)]
pub fn with_occurrences(mut input: EventInput, starts: &[DateTime<Utc>]) -> EventInput {
    input.start_date = None;
    input.end_date = None;
    input.occurrences = starts
        .iter()
        .map(|start| OccurrenceInput {
            start_date: rfc3339(*start),
            end_date: Some(rfc3339(*start + Duration::hours(2))),
            ..Default::default()
        })
        .collect();
    input
}
