use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::entities::{canonical_place, resolve_organization, resolve_place};
use crate::error::IngestError;
use crate::fingerprint::{dedup_hash, request_hash, venue_key};
use crate::idempotency;
use crate::identity::{self, DuplicateKind, IdentityMatch, IdentityProbe};
use crate::input::EventInput;
use crate::lifecycle::{assess, Assessment};
use crate::metrics_consts::{
    INGEST_ATTEMPT, INGEST_BATCH_SIZE, INGEST_CONFLICT_RETRIES, INGEST_DUPLICATES,
    INGEST_OUTCOME, INGEST_TIME, TASK_ENQUEUED, TASK_ENQUEUE_FAILED,
};
use crate::normalize::normalize_input;
use crate::repository::{Repository, Transaction};
use crate::review::open_entry;
use crate::tasks::{EntityKind, FollowUpTask, TaskQueue};
use crate::types::{
    warning_codes, DuplicateCandidate, Event, EventUpdate, LifecycleState, NewEvent,
    NewEventSource, NewOccurrence, NewReviewEntry, NewSource, PlaceRecord, ReviewDecision,
    ReviewStatus, ReviewWarning,
};
use crate::validation::{base_url, validate, ValidatedEvent};

pub const SYSTEM_REVIEWER: &str = "system";
const DEFAULT_TRUST_LEVEL: i32 = 5;
const BATCH_CONCURRENCY: usize = 4;

/// What happened to one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResult {
    pub event: Event,
    pub is_duplicate: bool,
    pub duplicate_kind: Option<DuplicateKind>,
    /// A content duplicate contributed fields to the existing event.
    pub is_merged: bool,
    pub needs_review: bool,
    pub warnings: Vec<ReviewWarning>,
}

impl IngestResult {
    pub fn outcome(&self) -> &'static str {
        if self.is_duplicate {
            "duplicate"
        } else if self.needs_review {
            "review"
        } else {
            "created"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItemOutcome {
    Created {
        event: Uuid,
    },
    Review {
        event: Uuid,
        warnings: Vec<ReviewWarning>,
    },
    Duplicate {
        event: Uuid,
        kind: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub items: Vec<BatchItemOutcome>,
    pub created: usize,
    pub review: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl From<IngestResult> for BatchItemOutcome {
    fn from(result: IngestResult) -> Self {
        if result.is_duplicate {
            BatchItemOutcome::Duplicate {
                event: result.event.uid,
                kind: result
                    .duplicate_kind
                    .map(|k| k.as_str())
                    .unwrap_or_default()
                    .to_owned(),
            }
        } else if result.needs_review {
            BatchItemOutcome::Review {
                event: result.event.uid,
                warnings: result.warnings,
            }
        } else {
            BatchItemOutcome::Created {
                event: result.event.uid,
            }
        }
    }
}

impl BatchSummary {
    fn push(&mut self, outcome: BatchItemOutcome) {
        match outcome {
            BatchItemOutcome::Created { .. } => self.created += 1,
            BatchItemOutcome::Review { .. } => self.review += 1,
            BatchItemOutcome::Duplicate { .. } => self.duplicates += 1,
            BatchItemOutcome::Failed { .. } => self.failed += 1,
        }
        self.items.push(outcome);
    }
}

/// Per-submission values computed once and reused across conflict retries.
struct Submission<'a> {
    input: &'a EventInput,
    schedule: &'a ValidatedEvent,
    idempotency_key: Option<&'a str>,
    request_hash: &'a str,
    dedup_hash: &'a str,
}

/// Entry point of the pipeline: turns untrusted listings into canonical events.
#[derive(Clone)]
pub struct IngestService {
    repo: Arc<dyn Repository>,
    tasks: Arc<dyn TaskQueue>,
    config: IngestConfig,
}

impl IngestService {
    pub fn new(repo: Arc<dyn Repository>, tasks: Arc<dyn TaskQueue>, config: IngestConfig) -> Self {
        Self {
            repo,
            tasks,
            config,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingests one listing. Duplicates are successes with `is_duplicate` set.
    pub async fn ingest(
        &self,
        input: EventInput,
        idempotency_key: Option<&str>,
    ) -> Result<IngestResult, IngestError> {
        let started = Instant::now();
        metrics::counter!(INGEST_ATTEMPT).increment(1);

        let result = self.ingest_inner(input, idempotency_key).await;

        let outcome = match &result {
            Ok(result) => result.outcome(),
            Err(_) => "failed",
        };
        metrics::counter!(INGEST_OUTCOME, "outcome" => outcome).increment(1);
        metrics::histogram!(INGEST_TIME).record(started.elapsed().as_millis() as f64);
        result
    }

    /// Ingests every item on its own. One failure never affects another item.
    pub async fn ingest_batch(&self, items: Vec<EventInput>) -> BatchSummary {
        metrics::histogram!(INGEST_BATCH_SIZE).record(items.len() as f64);

        let outcomes: Vec<BatchItemOutcome> = stream::iter(items)
            .map(|input| async move {
                match self.ingest(input, None).await {
                    Ok(result) => BatchItemOutcome::from(result),
                    Err(e) => BatchItemOutcome::Failed {
                        error: e.to_string(),
                    },
                }
            })
            .buffered(BATCH_CONCURRENCY)
            .collect()
            .await;

        let mut summary = BatchSummary::default();
        for outcome in outcomes {
            summary.push(outcome);
        }
        info!(
            created = summary.created,
            review = summary.review,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "batch ingested"
        );
        summary
    }

    async fn ingest_inner(
        &self,
        input: EventInput,
        idempotency_key: Option<&str>,
    ) -> Result<IngestResult, IngestError> {
        let input = normalize_input(input);
        let schedule = validate(&input, &self.config)?;
        let request_hash = request_hash(&input)?;
        let dedup_hash = dedup_hash(&input.name, &venue_key(&input), schedule.first_start());
        let idempotency_key = idempotency_key.map(str::trim).filter(|k| !k.is_empty());

        let submission = Submission {
            input: &input,
            schedule: &schedule,
            idempotency_key,
            request_hash: &request_hash,
            dedup_hash: &dedup_hash,
        };

        let mut retries = 0;
        loop {
            match self.try_ingest(&submission).await {
                Ok((result, follow_ups)) => {
                    self.enqueue_follow_ups(follow_ups).await;
                    return Ok(result);
                }
                // Another writer committed the same identity first; resolve again to find it
                Err(IngestError::Store(error))
                    if error.is_unique_violation() && retries < self.config.max_conflict_retries =>
                {
                    retries += 1;
                    metrics::counter!(INGEST_CONFLICT_RETRIES).increment(1);
                    debug!(%error, retries, "lost a uniqueness race, retrying");
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn try_ingest(
        &self,
        submission: &Submission<'_>,
    ) -> Result<(IngestResult, Vec<FollowUpTask>), IngestError> {
        let input = submission.input;
        let now = Utc::now();
        let mut tx = self.repo.begin().await?;

        let source = match &input.source {
            Some(source) => Some(
                tx.get_or_create_source(NewSource {
                    name: source.name.clone(),
                    base_url: base_url(&source.url)?,
                    trust_level: source.trust_level.unwrap_or(DEFAULT_TRUST_LEVEL),
                    license_url: source.license.clone(),
                    license_type: source.license.as_deref().map(|l| license_status(l).to_owned()),
                })
                .await?,
            ),
            None => None,
        };
        let source_ref = source.as_ref().zip(
            input
                .source
                .as_ref()
                .and_then(|s| s.event_id.as_deref()),
        );
        let source_identity = source_ref.map(|(source, event_id)| (source.id, event_id));

        let probe = IdentityProbe {
            idempotency_key: submission.idempotency_key,
            request_hash: submission.request_hash,
            source: source_identity,
            dedup_hash: submission.dedup_hash,
        };
        let identity = identity::resolve(tx.as_mut(), probe).await?;
        if let IdentityMatch::Duplicate(kind, event) = identity {
            let source_id = source.as_ref().map(|s| s.id);
            let result = self
                .settle_duplicate(tx, submission, kind, event, source_id, now)
                .await?;
            return Ok((result, Vec::new()));
        }

        let mut follow_ups = Vec::new();
        let mut assessment = assess(input, submission.schedule.first_start(), now, &self.config);

        let venue = match &input.location {
            Some(place) => {
                let resolved =
                    resolve_place(tx.as_mut(), place, self.config.place_similarity_threshold)
                        .await?;
                if resolved.created() {
                    follow_ups.push(FollowUpTask::ReconcileEntity {
                        entity: EntityKind::Place,
                        entity_id: resolved.record.id,
                    });
                }
                Some(resolved.record)
            }
            None => None,
        };
        let organizer = match &input.organizer {
            Some(organization) => {
                let resolved = resolve_organization(
                    tx.as_mut(),
                    organization,
                    self.config.organization_similarity_threshold,
                )
                .await?;
                if resolved.created() {
                    follow_ups.push(FollowUpTask::ReconcileEntity {
                        entity: EntityKind::Organization,
                        entity_id: resolved.record.id,
                    });
                }
                Some(resolved.record)
            }
            None => None,
        };

        if let Some(venue) = &venue {
            let candidates = self
                .near_duplicates(tx.as_mut(), &input.name, venue.id, submission.schedule, None)
                .await?;
            assessment.flag_duplicates(candidates);
        }

        if assessment.needs_review {
            check_previous_rejection(tx.as_mut(), source_identity, submission.dedup_hash, &assessment, now)
                .await?;
        }

        let license_url = input
            .license
            .clone()
            .or_else(|| input.source.as_ref().and_then(|s| s.license.clone()))
            .unwrap_or_else(|| self.config.default_license_url.clone());
        let event = tx
            .create_event(NewEvent {
                name: input.name.clone(),
                description: input.description.clone(),
                license_status: license_status(&license_url).to_owned(),
                license_url,
                dedup_hash: submission.dedup_hash.to_owned(),
                lifecycle_state: if assessment.needs_review {
                    LifecycleState::Draft
                } else {
                    LifecycleState::Active
                },
                event_domain: input
                    .event_domain
                    .clone()
                    .unwrap_or_else(|| self.config.default_event_domain.clone()),
                organizer_id: organizer.as_ref().map(|o| o.id),
                primary_venue_id: venue.as_ref().map(|v| v.id),
                virtual_url: input.virtual_location.as_ref().map(|v| v.url.clone()),
                image_url: input.image.clone(),
                public_url: input.url.clone(),
                keywords: input.keywords.clone(),
                confidence: assessment.confidence,
                quality_score: assessment.quality_score,
            })
            .await?;

        for (i, occurrence) in submission.schedule.occurrences.iter().enumerate() {
            let venue_id = match occurrence.venue_ref.as_deref() {
                Some(reference) => Some(occurrence_venue(tx.as_mut(), i, reference).await?.id),
                None => venue.as_ref().map(|v| v.id),
            };
            tx.create_occurrence(
                event.id,
                NewOccurrence {
                    start_time: occurrence.start,
                    end_time: occurrence.end,
                    timezone: occurrence.timezone.clone(),
                    venue_id,
                    virtual_url: occurrence
                        .virtual_url
                        .clone()
                        .or_else(|| event.virtual_url.clone()),
                },
            )
            .await?;
        }

        if let Some((source, source_event_id)) = source_ref {
            tx.create_event_source(NewEventSource {
                event_id: event.id,
                source_id: source.id,
                source_event_id: source_event_id.to_owned(),
                source_url: input.url.clone(),
                payload: serde_json::to_value(input)?,
                payload_hash: submission.request_hash.to_owned(),
            })
            .await?;
        }

        if let Some(key) = submission.idempotency_key {
            idempotency::record(tx.as_mut(), key, submission.request_hash, event.id).await?;
        }

        if assessment.needs_review {
            open_entry(
                tx.as_mut(),
                NewReviewEntry {
                    event_id: event.id,
                    warnings: assessment.warnings.clone(),
                    source_id: source_identity.map(|(id, _)| id),
                    source_external_id: source_identity.map(|(_, ext)| ext.to_owned()),
                    dedup_hash: Some(submission.dedup_hash.to_owned()),
                    event_start: submission.schedule.first_start(),
                    event_end: submission.schedule.last_end(),
                },
            )
            .await?;
        } else if let Some(venue) = venue.as_ref().filter(|v| !v.has_coordinates()) {
            follow_ups.push(FollowUpTask::GeocodePlace {
                place_id: venue.id,
                event_id: event.id,
            });
        }

        tx.commit().await?;

        info!(
            event = %event.uid,
            lifecycle = %event.lifecycle_state,
            needs_review = assessment.needs_review,
            "ingested event"
        );
        Ok((
            IngestResult {
                event,
                is_duplicate: false,
                duplicate_kind: None,
                is_merged: false,
                needs_review: assessment.needs_review,
                warnings: assessment.warnings,
            },
            follow_ups,
        ))
    }

    /// Finishes a submission that matched an existing event: records the key,
    /// merges and links a new source, and settles a pending draft. The draft is
    /// auto-approved only when a fresh look finds no review triggers, near
    /// duplicates included; otherwise its entry gets the fresh warnings.
    async fn settle_duplicate(
        &self,
        mut tx: Box<dyn Transaction>,
        submission: &Submission<'_>,
        kind: DuplicateKind,
        mut event: Event,
        source_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<IngestResult, IngestError> {
        metrics::counter!(INGEST_DUPLICATES, "kind" => kind.as_str()).increment(1);
        let input = submission.input;

        if kind != DuplicateKind::IdempotentReplay {
            if let Some(key) = submission.idempotency_key {
                idempotency::record(tx.as_mut(), key, submission.request_hash, event.id).await?;
            }
        }

        let mut is_merged = false;
        if kind == DuplicateKind::ContentDuplicate {
            // Trust of the sources linked so far, before this one joins them
            let existing_trust = tx.get_event_trust_level(event.id).await?;
            let new_trust = match source_id {
                Some(id) => tx.get_source_trust_level(id).await?,
                None => DEFAULT_TRUST_LEVEL,
            };
            let update = merge_fields(&event, input, existing_trust, new_trust);
            if !update.is_empty() {
                event = tx.update_event(event.id, &update).await?;
                is_merged = true;
                info!(
                    event = %event.uid,
                    existing_trust,
                    new_trust,
                    "merged fields from duplicate submission"
                );
            }

            if let (Some(source_id), Some(source_event_id)) = (
                source_id,
                input.source.as_ref().and_then(|s| s.event_id.as_deref()),
            ) {
                let link = NewEventSource {
                    event_id: event.id,
                    source_id,
                    source_event_id: source_event_id.to_owned(),
                    source_url: input.url.clone(),
                    payload: serde_json::to_value(input)?,
                    payload_hash: submission.request_hash.to_owned(),
                };
                // Conflicts are reported without aborting the transaction, other errors do abort it
                match tx.create_event_source(link).await {
                    Ok(()) => debug!(event_id = event.id, source_id, "linked source to existing event"),
                    Err(error) if error.is_unique_violation() => {
                        warn!(event_id = event.id, source_id, %error, "could not link source to existing event")
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }

        let mut warnings = Vec::new();
        if event.lifecycle_state == LifecycleState::Draft {
            if let Some(pending) = tx.find_pending_review(event.id).await? {
                if kind == DuplicateKind::IdempotentReplay {
                    warnings = pending.warnings.0;
                } else {
                    let mut assessment =
                        assess(input, submission.schedule.first_start(), now, &self.config);
                    if let Some(venue_id) = event.primary_venue_id {
                        let candidates = self
                            .near_duplicates(
                                tx.as_mut(),
                                &event.name,
                                venue_id,
                                submission.schedule,
                                Some(event.id),
                            )
                            .await?;
                        assessment.flag_duplicates(candidates);
                    }

                    if assessment.needs_review {
                        let entry = tx
                            .update_review_warnings(pending.id, &assessment.warnings)
                            .await?;
                        warnings = entry.warnings.0;
                    } else {
                        event = tx
                            .set_event_lifecycle(event.id, LifecycleState::Active)
                            .await?;
                        tx.decide_review_entry(
                            pending.id,
                            ReviewDecision {
                                status: ReviewStatus::Approved,
                                reviewer: SYSTEM_REVIEWER.to_owned(),
                                notes: Some("resubmitted without review warnings".to_owned()),
                                rejection_reason: None,
                                merged_into_id: None,
                                reviewed_at: now,
                            },
                        )
                        .await?;
                        info!(event = %event.uid, review_id = pending.id, "auto-approved pending event");
                    }
                }
            }
        }

        tx.commit().await?;

        debug!(event = %event.uid, %kind, "duplicate submission");
        Ok(IngestResult {
            needs_review: event.lifecycle_state == LifecycleState::Draft,
            event,
            is_duplicate: true,
            duplicate_kind: Some(kind),
            is_merged,
            warnings,
        })
    }

    // Similar live events at the venue on any of the submission's days, best
    // first. With `exclude`, that event and the pairs reviewers marked as
    // distinct from it are skipped.
    async fn near_duplicates(
        &self,
        tx: &mut dyn Transaction,
        name: &str,
        venue_id: i64,
        schedule: &ValidatedEvent,
        exclude: Option<i64>,
    ) -> Result<Vec<DuplicateCandidate>, IngestError> {
        let threshold = self.config.near_duplicate_threshold;
        if threshold <= 0.0 {
            return Ok(Vec::new());
        }

        let mut found: BTreeMap<i64, DuplicateCandidate> = BTreeMap::new();
        for occurrence in schedule.occurrences.iter().filter(|o| o.venue_ref.is_none()) {
            for candidate in tx
                .find_near_duplicate_events(name, venue_id, occurrence.start, threshold)
                .await?
            {
                if let Some(event_id) = exclude {
                    if candidate.event_id == event_id
                        || tx.is_not_duplicate(event_id, candidate.event_id).await?
                    {
                        continue;
                    }
                }
                let keep = found
                    .get(&candidate.event_id)
                    .map_or(true, |seen| seen.similarity < candidate.similarity);
                if keep {
                    found.insert(candidate.event_id, candidate);
                }
            }
        }

        let mut candidates: Vec<DuplicateCandidate> = found.into_values().collect();
        candidates.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        Ok(candidates)
    }

    async fn enqueue_follow_ups(&self, follow_ups: Vec<FollowUpTask>) {
        for task in follow_ups {
            let kind = task.kind();
            match self.tasks.enqueue(task).await {
                Ok(()) => metrics::counter!(TASK_ENQUEUED, "kind" => kind).increment(1),
                Err(error) => {
                    metrics::counter!(TASK_ENQUEUE_FAILED, "kind" => kind).increment(1);
                    warn!(kind, %error, "failed to enqueue follow-up task");
                }
            }
        }
    }
}

/// Refuses a listing a reviewer already rejected while its event is still
/// upcoming and it carries the same problems.
async fn check_previous_rejection(
    tx: &mut dyn Transaction,
    source: Option<(i64, &str)>,
    dedup_hash: &str,
    assessment: &Assessment,
    now: DateTime<Utc>,
) -> Result<(), IngestError> {
    let Some(rejected) = tx.find_rejected_review(source, dedup_hash).await? else {
        return Ok(());
    };
    if rejected.event_finished_at() <= now
        || rejected.warning_codes() != warning_codes(&assessment.warnings)
    {
        return Ok(());
    }

    Err(IngestError::PreviouslyRejected {
        reason: rejected.rejection_reason.clone().unwrap_or_default(),
        reviewed_by: rejected.reviewed_by.clone().unwrap_or_default(),
        reviewed_at: rejected.reviewed_at.unwrap_or(rejected.updated_at),
    })
}

async fn occurrence_venue(
    tx: &mut dyn Transaction,
    index: usize,
    reference: &str,
) -> Result<PlaceRecord, IngestError> {
    let field = format!("occurrences[{index}].venueId");
    let uid = Uuid::parse_str(reference)
        .map_err(|_| IngestError::validation(&field, "is not a place identifier"))?;
    let place = tx
        .find_place_by_uid(uid)
        .await?
        .ok_or_else(|| IngestError::validation(&field, "unknown place"))?;
    Ok(canonical_place(tx, place).await?)
}

/// Fields a content duplicate contributes to the event it matched. Empty
/// fields are filled; filled ones are overwritten only by a source trusted
/// strictly more than every source already linked. The name is never touched,
/// it is part of the fingerprint.
fn merge_fields(
    existing: &Event,
    input: &EventInput,
    existing_trust: i32,
    new_trust: i32,
) -> EventUpdate {
    let outranks = new_trust > existing_trust;
    let pick = |current: Option<&str>, offered: Option<&String>| -> Option<String> {
        let offered = offered.map(|v| v.trim()).filter(|v| !v.is_empty())?;
        let current = current.map(str::trim).filter(|v| !v.is_empty());
        match current {
            None => Some(offered.to_owned()),
            Some(current) if outranks && current != offered => Some(offered.to_owned()),
            Some(_) => None,
        }
    };

    let keywords = if input.keywords.is_empty() {
        None
    } else if existing.keywords.is_empty() || (outranks && existing.keywords != input.keywords) {
        Some(input.keywords.clone())
    } else {
        None
    };

    EventUpdate {
        description: pick(existing.description.as_deref(), input.description.as_ref()),
        image_url: pick(existing.image_url.as_deref(), input.image.as_ref()),
        public_url: pick(existing.public_url.as_deref(), input.url.as_ref()),
        event_domain: pick(Some(existing.event_domain.as_str()), input.event_domain.as_ref()),
        keywords,
    }
}

/// Short license label derived from a license URL.
pub fn license_status(license_url: &str) -> &'static str {
    let url = license_url.to_lowercase();
    if url.contains("publicdomain/zero") {
        "cc0"
    } else if url.contains("licenses/by-sa/") {
        "cc-by-sa"
    } else if url.contains("licenses/by/") {
        "cc-by"
    } else {
        "unknown"
    }
}
