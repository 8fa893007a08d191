use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::StoreError;
use crate::repository::{Repository, Transaction};
use crate::types::{
    DuplicateCandidate, Enrichment, Event, EventUpdate, IdempotencyRecord, LifecycleState,
    NewEvent, NewEventSource, NewOccurrence, NewOrganization, NewPlace, NewReviewEntry, NewSource,
    NewTombstone, Occurrence, OrganizationRecord, PlaceRecord, ReviewCounts, ReviewDecision,
    ReviewEntry, ReviewStatus, ReviewWarning, SimilarEntity, Source, Tombstone,
};

mod entities;
mod events;
mod ledger;
mod review;

/// Postgres-backed catalog store.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn new(config: PoolConfig) -> Result<Self, StoreError> {
        let pool = config
            .connect()
            .await
            .map_err(|error| StoreError::PoolCreation { error })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        run_migrations(&self.pool).await
    }
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[async_trait]
impl Repository for PgRepository {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::transaction("begin", e))?;
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// Dropping the inner sqlx transaction without commit issues a ROLLBACK.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| StoreError::transaction("commit", e))
    }

    async fn get_event(&mut self, id: i64) -> Result<Event, StoreError> {
        events::get_event(&mut self.tx, id).await
    }

    async fn get_event_by_uid(&mut self, uid: Uuid) -> Result<Event, StoreError> {
        events::get_event_by_uid(&mut self.tx, uid).await
    }

    async fn find_event_by_source(
        &mut self,
        source_id: i64,
        source_event_id: &str,
    ) -> Result<Option<Event>, StoreError> {
        events::find_event_by_source(&mut self.tx, source_id, source_event_id).await
    }

    async fn find_event_by_dedup_hash(&mut self, hash: &str) -> Result<Option<Event>, StoreError> {
        events::find_event_by_dedup_hash(&mut self.tx, hash).await
    }

    async fn create_event(&mut self, event: NewEvent) -> Result<Event, StoreError> {
        events::create_event(&mut self.tx, event).await
    }

    async fn create_occurrence(
        &mut self,
        event_id: i64,
        occurrence: NewOccurrence,
    ) -> Result<Occurrence, StoreError> {
        events::create_occurrence(&mut self.tx, event_id, occurrence).await
    }

    async fn list_occurrences(&mut self, event_id: i64) -> Result<Vec<Occurrence>, StoreError> {
        events::list_occurrences(&mut self.tx, event_id).await
    }

    async fn set_event_lifecycle(
        &mut self,
        event_id: i64,
        state: LifecycleState,
    ) -> Result<Event, StoreError> {
        events::set_event_lifecycle(&mut self.tx, event_id, state).await
    }

    async fn update_event(
        &mut self,
        event_id: i64,
        update: &EventUpdate,
    ) -> Result<Event, StoreError> {
        events::update_event(&mut self.tx, event_id, update).await
    }

    async fn soft_delete_event(
        &mut self,
        event_id: i64,
        reason: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        events::soft_delete_event(&mut self.tx, event_id, reason, deleted_at).await
    }

    async fn merge_events(
        &mut self,
        duplicate_id: i64,
        primary_id: i64,
        merged_at: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        events::merge_events(&mut self.tx, duplicate_id, primary_id, merged_at).await
    }

    async fn find_near_duplicate_events(
        &mut self,
        name: &str,
        venue_id: i64,
        start: DateTime<Utc>,
        threshold: f64,
    ) -> Result<Vec<DuplicateCandidate>, StoreError> {
        events::find_near_duplicate_events(&mut self.tx, name, venue_id, start, threshold).await
    }

    async fn insert_not_duplicate(
        &mut self,
        event_a: i64,
        event_b: i64,
        recorded_by: &str,
    ) -> Result<(), StoreError> {
        events::insert_not_duplicate(&mut self.tx, event_a, event_b, recorded_by).await
    }

    async fn is_not_duplicate(&mut self, event_a: i64, event_b: i64) -> Result<bool, StoreError> {
        events::is_not_duplicate(&mut self.tx, event_a, event_b).await
    }

    async fn get_or_create_source(&mut self, source: NewSource) -> Result<Source, StoreError> {
        events::get_or_create_source(&mut self.tx, source).await
    }

    async fn create_event_source(&mut self, link: NewEventSource) -> Result<(), StoreError> {
        events::create_event_source(&mut self.tx, link).await
    }

    async fn get_source_trust_level(&mut self, source_id: i64) -> Result<i32, StoreError> {
        events::get_source_trust_level(&mut self.tx, source_id).await
    }

    async fn get_event_trust_level(&mut self, event_id: i64) -> Result<i32, StoreError> {
        events::get_event_trust_level(&mut self.tx, event_id).await
    }

    async fn get_idempotency_key(
        &mut self,
        key: &str,
        fresh_after: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        ledger::get_idempotency_key(&mut self.tx, key, fresh_after).await
    }

    async fn insert_idempotency_key(
        &mut self,
        key: &str,
        request_hash: &str,
        event_id: i64,
        fresh_after: DateTime<Utc>,
    ) -> Result<IdempotencyRecord, StoreError> {
        ledger::insert_idempotency_key(&mut self.tx, key, request_hash, event_id, fresh_after)
            .await
    }

    async fn delete_idempotency_keys_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        ledger::delete_idempotency_keys_before(&mut self.tx, cutoff).await
    }

    async fn get_place(&mut self, id: i64) -> Result<PlaceRecord, StoreError> {
        entities::get_place(&mut self.tx, id).await
    }

    async fn find_place_by_uid(&mut self, uid: Uuid) -> Result<Option<PlaceRecord>, StoreError> {
        entities::find_place_by_uid(&mut self.tx, uid).await
    }

    async fn find_place_exact(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
    ) -> Result<Option<PlaceRecord>, StoreError> {
        entities::find_place_exact(&mut self.tx, normalized_name, locality, region).await
    }

    async fn find_similar_places(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
        threshold: f64,
    ) -> Result<Vec<SimilarEntity>, StoreError> {
        entities::find_similar(
            &mut self.tx,
            entities::PLACES,
            normalized_name,
            locality,
            region,
            threshold,
        )
        .await
    }

    async fn insert_place(&mut self, place: NewPlace) -> Result<Option<PlaceRecord>, StoreError> {
        entities::insert_place(&mut self.tx, place).await
    }

    async fn merge_places(&mut self, duplicate_id: i64, primary_id: i64) -> Result<(), StoreError> {
        entities::merge_places(&mut self.tx, duplicate_id, primary_id).await
    }

    async fn backfill_place_coordinates(
        &mut self,
        id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<bool, StoreError> {
        entities::backfill_place_coordinates(&mut self.tx, id, latitude, longitude).await
    }

    async fn enrich_place(&mut self, id: i64, enrichment: &Enrichment) -> Result<bool, StoreError> {
        entities::enrich_place(&mut self.tx, id, enrichment).await
    }

    async fn get_organization(&mut self, id: i64) -> Result<OrganizationRecord, StoreError> {
        entities::get_organization(&mut self.tx, id).await
    }

    async fn find_organization_by_uid(
        &mut self,
        uid: Uuid,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        entities::find_organization_by_uid(&mut self.tx, uid).await
    }

    async fn find_organization_exact(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        entities::find_organization_exact(&mut self.tx, normalized_name, locality, region).await
    }

    async fn find_similar_organizations(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
        threshold: f64,
    ) -> Result<Vec<SimilarEntity>, StoreError> {
        entities::find_similar(
            &mut self.tx,
            entities::ORGANIZATIONS,
            normalized_name,
            locality,
            region,
            threshold,
        )
        .await
    }

    async fn insert_organization(
        &mut self,
        organization: NewOrganization,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        entities::insert_organization(&mut self.tx, organization).await
    }

    async fn merge_organizations(
        &mut self,
        duplicate_id: i64,
        primary_id: i64,
    ) -> Result<(), StoreError> {
        entities::merge_organizations(&mut self.tx, duplicate_id, primary_id).await
    }

    async fn enrich_organization(
        &mut self,
        id: i64,
        enrichment: &Enrichment,
    ) -> Result<bool, StoreError> {
        entities::enrich_organization(&mut self.tx, id, enrichment).await
    }

    async fn create_tombstone(&mut self, tombstone: NewTombstone) -> Result<Tombstone, StoreError> {
        events::create_tombstone(&mut self.tx, tombstone).await
    }

    async fn latest_tombstone(&mut self, event_id: i64) -> Result<Option<Tombstone>, StoreError> {
        events::latest_tombstone(&mut self.tx, event_id).await
    }

    async fn create_review_entry(
        &mut self,
        entry: NewReviewEntry,
    ) -> Result<ReviewEntry, StoreError> {
        review::create_review_entry(&mut self.tx, entry).await
    }

    async fn supersede_review_entries(&mut self, event_id: i64) -> Result<u64, StoreError> {
        review::supersede_review_entries(&mut self.tx, event_id).await
    }

    async fn get_review_entry(&mut self, id: i64) -> Result<ReviewEntry, StoreError> {
        review::get_review_entry(&mut self.tx, id).await
    }

    async fn find_pending_review(
        &mut self,
        event_id: i64,
    ) -> Result<Option<ReviewEntry>, StoreError> {
        review::find_pending_review(&mut self.tx, event_id).await
    }

    async fn find_rejected_review(
        &mut self,
        source: Option<(i64, &str)>,
        dedup_hash: &str,
    ) -> Result<Option<ReviewEntry>, StoreError> {
        review::find_rejected_review(&mut self.tx, source, dedup_hash).await
    }

    async fn list_review_entries(
        &mut self,
        status: Option<ReviewStatus>,
        limit: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<ReviewEntry>, StoreError> {
        review::list_review_entries(&mut self.tx, status, limit, after_id).await
    }

    async fn count_review_entries(&mut self) -> Result<ReviewCounts, StoreError> {
        review::count_review_entries(&mut self.tx).await
    }

    async fn decide_review_entry(
        &mut self,
        id: i64,
        decision: ReviewDecision,
    ) -> Result<ReviewEntry, StoreError> {
        review::decide_review_entry(&mut self.tx, id, decision).await
    }

    async fn update_review_warnings(
        &mut self,
        id: i64,
        warnings: &[ReviewWarning],
    ) -> Result<ReviewEntry, StoreError> {
        review::update_review_warnings(&mut self.tx, id, warnings).await
    }

    async fn delete_review_entry(&mut self, id: i64) -> Result<(), StoreError> {
        review::delete_review_entry(&mut self.tx, id).await
    }

    async fn delete_rejected_reviews_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        review::delete_rejected_reviews_before(&mut self.tx, cutoff).await
    }

    async fn list_expired_pending_reviews(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReviewEntry>, StoreError> {
        review::list_expired_pending_reviews(&mut self.tx, now).await
    }

    async fn delete_reviewed_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        review::delete_reviewed_before(&mut self.tx, cutoff).await
    }
}
