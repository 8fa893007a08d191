use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    DuplicateCandidate, Enrichment, Event, EventUpdate, IdempotencyRecord, LifecycleState,
    NewEvent, NewEventSource, NewOccurrence, NewOrganization, NewPlace, NewReviewEntry, NewSource,
    NewTombstone, Occurrence, OrganizationRecord, PlaceRecord, ReviewCounts, ReviewDecision,
    ReviewEntry, ReviewStatus, ReviewWarning, SimilarEntity, Source, Tombstone,
};

/// Entry point to a catalog store. Every unit of work runs inside a transaction.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;
}

/// A unit of work against the catalog store.
///
/// Dropping a transaction without calling `commit` rolls back everything it wrote.
/// Lookups that return `Option` treat a miss as normal; lookups that return a
/// record fail with `StoreError::NotFound`.
#[async_trait]
pub trait Transaction: Send {
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    // Events
    async fn get_event(&mut self, id: i64) -> Result<Event, StoreError>;
    async fn get_event_by_uid(&mut self, uid: Uuid) -> Result<Event, StoreError>;
    /// Live or merged event linked to a source's native id.
    async fn find_event_by_source(
        &mut self,
        source_id: i64,
        source_event_id: &str,
    ) -> Result<Option<Event>, StoreError>;
    /// Live event with the given content fingerprint, or a merged event carrying it.
    async fn find_event_by_dedup_hash(&mut self, hash: &str) -> Result<Option<Event>, StoreError>;
    /// Fails with `UniqueViolation` when a live event already owns the fingerprint.
    async fn create_event(&mut self, event: NewEvent) -> Result<Event, StoreError>;
    async fn create_occurrence(
        &mut self,
        event_id: i64,
        occurrence: NewOccurrence,
    ) -> Result<Occurrence, StoreError>;
    async fn list_occurrences(&mut self, event_id: i64) -> Result<Vec<Occurrence>, StoreError>;
    async fn set_event_lifecycle(
        &mut self,
        event_id: i64,
        state: LifecycleState,
    ) -> Result<Event, StoreError>;
    async fn update_event(&mut self, event_id: i64, update: &EventUpdate)
        -> Result<Event, StoreError>;
    async fn soft_delete_event(
        &mut self,
        event_id: i64,
        reason: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<Event, StoreError>;
    /// Fills empty descriptive fields on the primary, repoints source links and
    /// idempotency keys, and retires the duplicate as a redirect to the primary.
    async fn merge_events(
        &mut self,
        duplicate_id: i64,
        primary_id: i64,
        merged_at: DateTime<Utc>,
    ) -> Result<Event, StoreError>;
    /// Live events at `venue_id` with an occurrence on the same UTC day as `start`
    /// and a name similarity of at least `threshold`, best match first.
    async fn find_near_duplicate_events(
        &mut self,
        name: &str,
        venue_id: i64,
        start: DateTime<Utc>,
        threshold: f64,
    ) -> Result<Vec<DuplicateCandidate>, StoreError>;
    async fn insert_not_duplicate(
        &mut self,
        event_a: i64,
        event_b: i64,
        recorded_by: &str,
    ) -> Result<(), StoreError>;
    async fn is_not_duplicate(&mut self, event_a: i64, event_b: i64) -> Result<bool, StoreError>;

    // Sources
    async fn get_or_create_source(&mut self, source: NewSource) -> Result<Source, StoreError>;
    /// Fails with `UniqueViolation` when the source id is already linked to a live event.
    async fn create_event_source(&mut self, link: NewEventSource) -> Result<(), StoreError>;
    async fn get_source_trust_level(&mut self, source_id: i64) -> Result<i32, StoreError>;
    /// Highest trust level across the event's sources, or the default of 5.
    async fn get_event_trust_level(&mut self, event_id: i64) -> Result<i32, StoreError>;

    // Idempotency
    /// Key written at or after `fresh_after`.
    async fn get_idempotency_key(
        &mut self,
        key: &str,
        fresh_after: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;
    /// Inserts the key, overwriting only a row written before `fresh_after`.
    /// Fails with `UniqueViolation` when a fresh row exists.
    async fn insert_idempotency_key(
        &mut self,
        key: &str,
        request_hash: &str,
        event_id: i64,
        fresh_after: DateTime<Utc>,
    ) -> Result<IdempotencyRecord, StoreError>;
    async fn delete_idempotency_keys_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // Places
    async fn get_place(&mut self, id: i64) -> Result<PlaceRecord, StoreError>;
    async fn find_place_by_uid(&mut self, uid: Uuid) -> Result<Option<PlaceRecord>, StoreError>;
    async fn find_place_exact(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
    ) -> Result<Option<PlaceRecord>, StoreError>;
    async fn find_similar_places(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
        threshold: f64,
    ) -> Result<Vec<SimilarEntity>, StoreError>;
    /// `None` when a live place already owns the exact key.
    async fn insert_place(&mut self, place: NewPlace) -> Result<Option<PlaceRecord>, StoreError>;
    async fn merge_places(&mut self, duplicate_id: i64, primary_id: i64) -> Result<(), StoreError>;
    /// Writes coordinates only when the place has none. Returns whether anything changed.
    async fn backfill_place_coordinates(
        &mut self,
        id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<bool, StoreError>;
    async fn enrich_place(&mut self, id: i64, enrichment: &Enrichment) -> Result<bool, StoreError>;

    // Organizations
    async fn get_organization(&mut self, id: i64) -> Result<OrganizationRecord, StoreError>;
    async fn find_organization_by_uid(
        &mut self,
        uid: Uuid,
    ) -> Result<Option<OrganizationRecord>, StoreError>;
    async fn find_organization_exact(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError>;
    async fn find_similar_organizations(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
        threshold: f64,
    ) -> Result<Vec<SimilarEntity>, StoreError>;
    async fn insert_organization(
        &mut self,
        organization: NewOrganization,
    ) -> Result<Option<OrganizationRecord>, StoreError>;
    async fn merge_organizations(
        &mut self,
        duplicate_id: i64,
        primary_id: i64,
    ) -> Result<(), StoreError>;
    async fn enrich_organization(
        &mut self,
        id: i64,
        enrichment: &Enrichment,
    ) -> Result<bool, StoreError>;

    // Tombstones
    async fn create_tombstone(&mut self, tombstone: NewTombstone) -> Result<Tombstone, StoreError>;
    async fn latest_tombstone(&mut self, event_id: i64) -> Result<Option<Tombstone>, StoreError>;

    // Review queue
    /// Fails with `UniqueViolation` when the event already has a pending entry.
    async fn create_review_entry(
        &mut self,
        entry: NewReviewEntry,
    ) -> Result<ReviewEntry, StoreError>;
    /// Moves approved and merged entries of the event to superseded.
    async fn supersede_review_entries(&mut self, event_id: i64) -> Result<u64, StoreError>;
    /// Reads an entry and locks it for the rest of the transaction.
    async fn get_review_entry(&mut self, id: i64) -> Result<ReviewEntry, StoreError>;
    async fn find_pending_review(&mut self, event_id: i64)
        -> Result<Option<ReviewEntry>, StoreError>;
    /// Most recent rejected entry matching either the source identity or the fingerprint.
    async fn find_rejected_review(
        &mut self,
        source: Option<(i64, &str)>,
        dedup_hash: &str,
    ) -> Result<Option<ReviewEntry>, StoreError>;
    async fn list_review_entries(
        &mut self,
        status: Option<ReviewStatus>,
        limit: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<ReviewEntry>, StoreError>;
    async fn count_review_entries(&mut self) -> Result<ReviewCounts, StoreError>;
    async fn decide_review_entry(
        &mut self,
        id: i64,
        decision: ReviewDecision,
    ) -> Result<ReviewEntry, StoreError>;
    /// Replaces the warnings of a pending entry.
    async fn update_review_warnings(
        &mut self,
        id: i64,
        warnings: &[ReviewWarning],
    ) -> Result<ReviewEntry, StoreError>;
    async fn delete_review_entry(&mut self, id: i64) -> Result<(), StoreError>;
    /// Deletes rejected entries whose event ended (or started, when it has no end) before `cutoff`.
    async fn delete_rejected_reviews_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
    async fn list_expired_pending_reviews(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReviewEntry>, StoreError>;
    /// Deletes approved, merged and superseded entries reviewed before `cutoff`.
    async fn delete_reviewed_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
