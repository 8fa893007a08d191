use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::json;

use crate::config::IngestConfig;
use crate::error::StoreError;
use crate::input::EventInput;
use crate::repository::Transaction;
use crate::types::{DuplicateCandidate, Event, NewTombstone, ReviewWarning, WarningCode};

pub const REASON_DUPLICATE_MERGED: &str = "duplicate_merged";
pub const REASON_REJECTED: &str = "rejected";
pub const REASON_UNREVIEWED: &str = "unreviewed";

const BASE_CONFIDENCE: f64 = 0.9;
const QUALITY_PENALTY: f64 = 0.2;
const REVIEW_PENALTY: f64 = 0.1;

/// Outcome of the lifecycle decision for a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub warnings: Vec<ReviewWarning>,
    pub needs_review: bool,
    pub confidence: f64,
    pub quality_score: f64,
}

/// Quality checks that do not need the store.
///
/// A listing is held for review when it has neither description nor image,
/// when it starts further out than `far_future_days`, or, with
/// `require_image`, when the image alone is missing.
pub fn assess(
    input: &EventInput,
    first_start: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &IngestConfig,
) -> Assessment {
    let has_description = input.description.is_some();
    let has_image = input.image.is_some();
    let too_far = first_start > now + Duration::days(config.far_future_days);

    let mut warnings = Vec::new();
    if !has_description {
        warnings.push(ReviewWarning::new(
            WarningCode::MissingDescription,
            "description",
            "Event is missing a description.",
        ));
    }
    if !has_image {
        warnings.push(ReviewWarning::new(
            WarningCode::MissingImage,
            "image",
            "Event is missing an image.",
        ));
    }
    if too_far {
        warnings.push(ReviewWarning::new(
            WarningCode::TooFarFuture,
            "startDate",
            "Event starts more than two years from now.",
        ));
    }

    let needs_review =
        (!has_description && !has_image) || too_far || (config.require_image && !has_image);

    let mut confidence = BASE_CONFIDENCE;
    if !has_description {
        confidence -= QUALITY_PENALTY;
    }
    if config.require_image && !has_image {
        confidence -= QUALITY_PENALTY;
    }
    if too_far {
        confidence -= QUALITY_PENALTY;
    }
    if needs_review {
        confidence -= REVIEW_PENALTY;
    }

    Assessment {
        warnings,
        needs_review,
        confidence: confidence.max(0.0),
        quality_score: quality_score(input),
    }
}

impl Assessment {
    /// Adds a potential duplicate warning, which always forces review.
    pub fn flag_duplicates(&mut self, candidates: Vec<DuplicateCandidate>) {
        if candidates.is_empty() {
            return;
        }
        let mut warning = ReviewWarning::new(
            WarningCode::PotentialDuplicate,
            "name",
            "A similar event is already listed at this venue on the same day.",
        );
        warning.candidates = candidates;
        self.warnings.push(warning);
        if !self.needs_review {
            self.needs_review = true;
            self.confidence = (self.confidence - REVIEW_PENALTY).max(0.0);
        }
    }
}

// Share of optional descriptive fields that are filled in.
fn quality_score(input: &EventInput) -> f64 {
    let present = [
        input.description.is_some(),
        input.image.is_some(),
        input.url.is_some(),
        !input.keywords.is_empty(),
        input.organizer.is_some(),
    ];
    let filled = present.iter().filter(|p| **p).count();
    filled as f64 / present.len() as f64
}

/// Last known public representation of a removed event.
pub fn tombstone_payload(
    event: &Event,
    event_uri: &str,
    reason: &str,
    deleted_at: DateTime<Utc>,
    superseded_by: Option<&str>,
) -> serde_json::Value {
    let mut payload = json!({
        "@context": "https://schema.org",
        "@type": "Event",
        "@id": event_uri,
        "name": event.name,
        "eventStatus": "https://schema.org/EventCancelled",
        "sel:tombstone": true,
        "sel:deletedAt": deleted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "sel:deletionReason": reason,
    });
    if let Some(superseded_by) = superseded_by {
        payload["sel:supersededBy"] = json!(superseded_by);
    }
    payload
}

/// Soft-deletes an event and writes its tombstone in the caller's transaction.
pub async fn retire_event(
    tx: &mut dyn Transaction,
    event: &Event,
    reason: &str,
    now: DateTime<Utc>,
    config: &IngestConfig,
) -> Result<Event, StoreError> {
    let retired = tx.soft_delete_event(event.id, reason, now).await?;
    let payload = tombstone_payload(&retired, &config.event_uri(&retired.uid), reason, now, None);
    tx.create_tombstone(NewTombstone {
        event_id: retired.id,
        event_uid: retired.uid,
        deleted_at: now,
        reason: reason.to_owned(),
        superseded_by_uri: None,
        payload,
    })
    .await?;
    Ok(retired)
}

/// Folds `duplicate` into `primary` and writes a tombstone pointing at the survivor.
/// Returns the updated primary.
pub async fn fold_event(
    tx: &mut dyn Transaction,
    duplicate: &Event,
    primary: &Event,
    now: DateTime<Utc>,
    config: &IngestConfig,
) -> Result<Event, StoreError> {
    let merged = tx.merge_events(duplicate.id, primary.id, now).await?;
    let superseded_by = config.event_uri(&primary.uid);
    let payload = tombstone_payload(
        duplicate,
        &config.event_uri(&duplicate.uid),
        REASON_DUPLICATE_MERGED,
        now,
        Some(&superseded_by),
    );
    tx.create_tombstone(NewTombstone {
        event_id: duplicate.id,
        event_uid: duplicate.uid,
        deleted_at: now,
        reason: REASON_DUPLICATE_MERGED.to_owned(),
        superseded_by_uri: Some(superseded_by),
        payload,
    })
    .await?;
    Ok(merged)
}
