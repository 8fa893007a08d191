use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{IngestConfig, RetentionConfig};
use crate::error::{IngestError, StoreError};
use crate::identity::follow_redirects;
use crate::lifecycle::{fold_event, retire_event, REASON_REJECTED, REASON_UNREVIEWED};
use crate::metrics_consts::{REVIEW_FLAGGED, REVIEW_TRANSITIONS};
use crate::repository::{Repository, Transaction};
use crate::types::{
    DuplicateCandidate, Event, LifecycleState, NewReviewEntry, Occurrence, ReviewCounts,
    ReviewDecision, ReviewEntry, ReviewStatus, ReviewWarning, WarningCode,
};

pub const MAX_PAGE_SIZE: i64 = 500;

/// Opens a pending entry for an event, superseding its earlier approved and
/// merged entries. Fails with a uniqueness violation if one is already pending.
pub async fn open_entry(
    tx: &mut dyn Transaction,
    entry: NewReviewEntry,
) -> Result<ReviewEntry, StoreError> {
    tx.supersede_review_entries(entry.event_id).await?;
    tx.create_review_entry(entry).await
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionResult {
    pub rejected_deleted: u64,
    pub expired_pending: u64,
    pub reviewed_deleted: u64,
}

/// Moderation backlog: listing, decisions and retention.
#[derive(Clone)]
pub struct ReviewQueue {
    repo: Arc<dyn Repository>,
    config: IngestConfig,
    retention: RetentionConfig,
}

impl ReviewQueue {
    pub fn new(repo: Arc<dyn Repository>, config: IngestConfig, retention: RetentionConfig) -> Self {
        Self {
            repo,
            config,
            retention,
        }
    }

    pub async fn get(&self, id: i64) -> Result<ReviewEntry, IngestError> {
        let mut tx = self.repo.begin().await?;
        let entry = tx.get_review_entry(id).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Entries ordered by id, starting after `after_id`.
    pub async fn list(
        &self,
        status: Option<ReviewStatus>,
        limit: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<ReviewEntry>, IngestError> {
        let mut tx = self.repo.begin().await?;
        let entries = tx
            .list_review_entries(status, limit.clamp(1, MAX_PAGE_SIZE), after_id)
            .await?;
        tx.commit().await?;
        Ok(entries)
    }

    pub async fn counts(&self) -> Result<ReviewCounts, IngestError> {
        let mut tx = self.repo.begin().await?;
        let counts = tx.count_review_entries().await?;
        tx.commit().await?;
        Ok(counts)
    }

    /// Publishes the event. With `record_not_duplicates`, every flagged
    /// candidate is remembered as distinct so later scans skip the pair.
    pub async fn approve(
        &self,
        id: i64,
        reviewer: &str,
        notes: Option<String>,
        record_not_duplicates: bool,
    ) -> Result<ReviewEntry, IngestError> {
        let mut tx = self.repo.begin().await?;
        let entry = pending_entry(tx.as_mut(), id, "approve").await?;
        let event = tx.get_event(entry.event_id).await?;
        if event.lifecycle_state == LifecycleState::Deleted {
            return Err(IngestError::validation("event", "has been deleted"));
        }

        tx.set_event_lifecycle(event.id, LifecycleState::Active)
            .await?;
        if record_not_duplicates {
            for candidate in duplicate_candidates(&entry.warnings.0) {
                tx.insert_not_duplicate(event.id, candidate.event_id, reviewer)
                    .await?;
            }
        }

        let decided = tx
            .decide_review_entry(
                id,
                ReviewDecision {
                    status: ReviewStatus::Approved,
                    reviewer: reviewer.to_owned(),
                    notes,
                    rejection_reason: None,
                    merged_into_id: None,
                    reviewed_at: Utc::now(),
                },
            )
            .await?;
        tx.commit().await?;

        metrics::counter!(REVIEW_TRANSITIONS, "action" => "approve").increment(1);
        info!(review_id = id, event_id = event.id, reviewer, "approved review entry");
        Ok(decided)
    }

    /// Deletes the event and leaves a tombstone. The reason is shown to resubmitters.
    pub async fn reject(
        &self,
        id: i64,
        reviewer: &str,
        reason: &str,
    ) -> Result<ReviewEntry, IngestError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(IngestError::validation("reason", "is required"));
        }

        let mut tx = self.repo.begin().await?;
        let entry = pending_entry(tx.as_mut(), id, "reject").await?;
        let event = tx.get_event(entry.event_id).await?;
        let now = Utc::now();
        if event.lifecycle_state != LifecycleState::Deleted {
            retire_event(tx.as_mut(), &event, REASON_REJECTED, now, &self.config).await?;
        }

        let decided = tx
            .decide_review_entry(
                id,
                ReviewDecision {
                    status: ReviewStatus::Rejected,
                    reviewer: reviewer.to_owned(),
                    notes: None,
                    rejection_reason: Some(reason.to_owned()),
                    merged_into_id: None,
                    reviewed_at: now,
                },
            )
            .await?;
        tx.commit().await?;

        metrics::counter!(REVIEW_TRANSITIONS, "action" => "reject").increment(1);
        info!(review_id = id, event_id = event.id, reviewer, "rejected review entry");
        Ok(decided)
    }

    /// Folds the pending event into `primary` and records the merge on the entry.
    pub async fn merge(
        &self,
        id: i64,
        reviewer: &str,
        primary: Uuid,
    ) -> Result<ReviewEntry, IngestError> {
        let mut tx = self.repo.begin().await?;
        let entry = pending_entry(tx.as_mut(), id, "merge").await?;
        let duplicate = tx.get_event(entry.event_id).await?;
        let primary = tx.get_event_by_uid(primary).await?;
        let primary = follow_redirects(tx.as_mut(), primary).await?;

        if primary.id == duplicate.id {
            return Err(IngestError::validation(
                "primary",
                "cannot merge an event into itself",
            ));
        }
        if primary.lifecycle_state == LifecycleState::Deleted {
            return Err(IngestError::validation("primary", "has been deleted"));
        }

        let now = Utc::now();
        fold_event(tx.as_mut(), &duplicate, &primary, now, &self.config).await?;

        let decided = tx
            .decide_review_entry(
                id,
                ReviewDecision {
                    status: ReviewStatus::Merged,
                    reviewer: reviewer.to_owned(),
                    notes: None,
                    rejection_reason: None,
                    merged_into_id: Some(primary.id),
                    reviewed_at: now,
                },
            )
            .await?;
        tx.commit().await?;

        metrics::counter!(REVIEW_TRANSITIONS, "action" => "merge").increment(1);
        info!(
            review_id = id,
            duplicate = %duplicate.uid,
            primary = %primary.uid,
            reviewer,
            "merged review entry"
        );
        Ok(decided)
    }

    /// Opens a pending entry for an existing event. An event that is already
    /// pending keeps its current entry.
    pub async fn flag(
        &self,
        event: Uuid,
        warnings: Vec<ReviewWarning>,
    ) -> Result<ReviewEntry, IngestError> {
        let mut tx = self.repo.begin().await?;
        let event = tx.get_event_by_uid(event).await?;
        if event.lifecycle_state == LifecycleState::Deleted {
            return Err(IngestError::validation("event", "has been deleted"));
        }
        if let Some(pending) = tx.find_pending_review(event.id).await? {
            return Ok(pending);
        }

        let entry = open_event_entry(tx.as_mut(), &event, warnings).await?;
        tx.commit().await?;

        metrics::counter!(REVIEW_FLAGGED).increment(1);
        info!(review_id = entry.id, event_id = event.id, "flagged event for review");
        Ok(entry)
    }

    /// Looks for other live events at the same venue on the same day with a
    /// similar name. Pairs a reviewer marked as distinct are ignored. Returns
    /// the new pending entry when the event was flagged.
    pub async fn scan_near_duplicates(
        &self,
        event: Uuid,
    ) -> Result<Option<ReviewEntry>, IngestError> {
        let threshold = self.config.near_duplicate_threshold;
        if threshold <= 0.0 {
            return Ok(None);
        }

        let mut tx = self.repo.begin().await?;
        let event = tx.get_event_by_uid(event).await?;
        let Some(venue_id) = event.primary_venue_id else {
            return Ok(None);
        };
        if event.lifecycle_state == LifecycleState::Deleted
            || tx.find_pending_review(event.id).await?.is_some()
        {
            return Ok(None);
        }

        let occurrences = tx.list_occurrences(event.id).await?;
        let mut found: BTreeMap<i64, DuplicateCandidate> = BTreeMap::new();
        for occurrence in &occurrences {
            let candidates = tx
                .find_near_duplicate_events(&event.name, venue_id, occurrence.start_time, threshold)
                .await?;
            for candidate in candidates {
                if candidate.event_id == event.id
                    || tx.is_not_duplicate(event.id, candidate.event_id).await?
                {
                    continue;
                }
                let keep = found
                    .get(&candidate.event_id)
                    .map_or(true, |seen| seen.similarity < candidate.similarity);
                if keep {
                    found.insert(candidate.event_id, candidate);
                }
            }
        }
        if found.is_empty() {
            return Ok(None);
        }

        let mut candidates: Vec<DuplicateCandidate> = found.into_values().collect();
        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        let mut warning = ReviewWarning::new(
            WarningCode::PotentialDuplicate,
            "name",
            "A similar event is already listed at this venue on the same day.",
        );
        warning.candidates = candidates;

        let entry = open_event_entry(tx.as_mut(), &event, vec![warning]).await?;
        tx.commit().await?;

        metrics::counter!(REVIEW_FLAGGED).increment(1);
        info!(review_id = entry.id, event_id = event.id, "flagged near-duplicate event");
        Ok(Some(entry))
    }

    /// Applies the retention rules. Each step runs in its own transaction, so a
    /// failure in one leaves the others applied. Running it twice is harmless.
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<RetentionResult, IngestError> {
        let mut result = RetentionResult::default();

        let mut tx = self.repo.begin().await?;
        result.rejected_deleted = tx
            .delete_rejected_reviews_before(now - self.retention.rejected_grace)
            .await?;
        tx.commit().await?;

        let mut tx = self.repo.begin().await?;
        for entry in tx.list_expired_pending_reviews(now).await? {
            let event = tx.get_event(entry.event_id).await;
            match event {
                Ok(event) if event.lifecycle_state != LifecycleState::Deleted => {
                    retire_event(tx.as_mut(), &event, REASON_UNREVIEWED, now, &self.config)
                        .await?;
                }
                Ok(_) => {}
                Err(StoreError::NotFound) => {
                    warn!(review_id = entry.id, event_id = entry.event_id, "review entry without event");
                }
                Err(e) => return Err(e.into()),
            }
            tx.delete_review_entry(entry.id).await?;
            result.expired_pending += 1;
        }
        tx.commit().await?;

        let mut tx = self.repo.begin().await?;
        result.reviewed_deleted = tx
            .delete_reviewed_before(now - self.retention.reviewed_retention)
            .await?;
        tx.commit().await?;

        info!(
            rejected_deleted = result.rejected_deleted,
            expired_pending = result.expired_pending,
            reviewed_deleted = result.reviewed_deleted,
            "review retention sweep finished"
        );
        Ok(result)
    }
}

async fn pending_entry(
    tx: &mut dyn Transaction,
    id: i64,
    action: &str,
) -> Result<ReviewEntry, IngestError> {
    let entry = tx.get_review_entry(id).await?;
    if entry.status != ReviewStatus::Pending {
        return Err(IngestError::InvalidTransition {
            from: entry.status,
            action: action.to_owned(),
        });
    }
    Ok(entry)
}

async fn open_event_entry(
    tx: &mut dyn Transaction,
    event: &Event,
    warnings: Vec<ReviewWarning>,
) -> Result<ReviewEntry, StoreError> {
    let occurrences = tx.list_occurrences(event.id).await?;
    let (event_start, event_end) = schedule_bounds(&occurrences, event.created_at);
    open_entry(
        tx,
        NewReviewEntry {
            event_id: event.id,
            warnings,
            source_id: None,
            source_external_id: None,
            dedup_hash: Some(event.dedup_hash.clone()),
            event_start,
            event_end,
        },
    )
    .await
}

// Earliest start and latest end of a schedule.
fn schedule_bounds(
    occurrences: &[Occurrence],
    fallback: DateTime<Utc>,
) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    let start = occurrences
        .iter()
        .map(|o| o.start_time)
        .min()
        .unwrap_or(fallback);
    let end = occurrences.iter().filter_map(|o| o.end_time).max();
    (start, end)
}

fn duplicate_candidates(warnings: &[ReviewWarning]) -> impl Iterator<Item = &DuplicateCandidate> {
    warnings
        .iter()
        .filter(|w| w.code == WarningCode::PotentialDuplicate)
        .flat_map(|w| w.candidates.iter())
}
