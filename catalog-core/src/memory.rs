use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::StoreError;
use crate::normalize::trigram_similarity;
use crate::repository::{Repository, Transaction};
use crate::types::{
    DuplicateCandidate, Enrichment, Event, EventUpdate, IdempotencyRecord, LifecycleState,
    NewEvent, NewEventSource, NewOccurrence, NewOrganization, NewPlace, NewReviewEntry, NewSource,
    NewTombstone, Occurrence, OrganizationRecord, PlaceRecord, ReviewCounts, ReviewDecision,
    ReviewEntry, ReviewStatus, ReviewWarning, SimilarEntity, Source, Tombstone,
};

const DEFAULT_TRUST_LEVEL: i32 = 5;
const SIMILAR_LIMIT: usize = 5;

#[derive(Debug, Clone)]
struct EventSourceRow {
    event_id: i64,
    source_id: i64,
    source_event_id: String,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    next_id: i64,
    events: BTreeMap<i64, Event>,
    occurrences: Vec<Occurrence>,
    sources: Vec<Source>,
    event_sources: Vec<EventSourceRow>,
    idempotency: HashMap<String, IdempotencyRecord>,
    places: BTreeMap<i64, PlaceRecord>,
    organizations: BTreeMap<i64, OrganizationRecord>,
    tombstones: Vec<Tombstone>,
    reviews: BTreeMap<i64, ReviewEntry>,
    not_duplicates: HashSet<(i64, i64)>,
    // Failure injection: occurrence inserts fail once this many succeeded in a transaction
    fail_occurrence_after: Option<usize>,
    occurrences_in_tx: usize,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn event(&self, id: i64) -> Result<&Event, StoreError> {
        self.events.get(&id).ok_or(StoreError::NotFound)
    }

    fn event_mut(&mut self, id: i64) -> Result<&mut Event, StoreError> {
        self.events.get_mut(&id).ok_or(StoreError::NotFound)
    }

    fn review_mut(&mut self, id: i64) -> Result<&mut ReviewEntry, StoreError> {
        self.reviews.get_mut(&id).ok_or(StoreError::NotFound)
    }
}

fn findable(event: &Event) -> bool {
    event.lifecycle_state != LifecycleState::Deleted || event.merged_into_id.is_some()
}

fn fill<T: Clone>(target: &mut Option<T>, value: &Option<T>) -> bool {
    if target.is_none() && value.is_some() {
        *target = value.clone();
        return true;
    }
    false
}

/// In-memory catalog store for tests and local tooling.
///
/// A single lock guards the whole state and is held for the lifetime of a
/// transaction, so transactions are fully serialized. Rollback restores the
/// snapshot taken when the transaction began.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every transaction fail its occurrence insert after `after` successful ones.
    pub async fn fail_occurrence_inserts_after(&self, after: Option<usize>) {
        self.state.lock().await.fail_occurrence_after = after;
    }

    /// Moves the creation time of an idempotency key, to simulate expiry.
    pub async fn backdate_idempotency_key(&self, key: &str, created_at: DateTime<Utc>) {
        if let Some(record) = self.state.lock().await.idempotency.get_mut(key) {
            record.created_at = created_at;
        }
    }

    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.events.values().cloned().collect()
    }

    pub async fn occurrences(&self) -> Vec<Occurrence> {
        self.state.lock().await.occurrences.clone()
    }

    pub async fn places(&self) -> Vec<PlaceRecord> {
        self.state.lock().await.places.values().cloned().collect()
    }

    pub async fn organizations(&self) -> Vec<OrganizationRecord> {
        self.state.lock().await.organizations.values().cloned().collect()
    }

    pub async fn review_entries(&self) -> Vec<ReviewEntry> {
        self.state.lock().await.reviews.values().cloned().collect()
    }

    pub async fn tombstones(&self) -> Vec<Tombstone> {
        self.state.lock().await.tombstones.clone()
    }

    pub async fn idempotency_keys(&self) -> Vec<IdempotencyRecord> {
        self.state.lock().await.idempotency.values().cloned().collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let mut guard = self.state.clone().lock_owned().await;
        guard.occurrences_in_tx = 0;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            snapshot: Some(snapshot),
        }))
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.snapshot = None;
        Ok(())
    }

    async fn get_event(&mut self, id: i64) -> Result<Event, StoreError> {
        self.guard.event(id).cloned()
    }

    async fn get_event_by_uid(&mut self, uid: Uuid) -> Result<Event, StoreError> {
        self.guard
            .events
            .values()
            .find(|e| e.uid == uid)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_event_by_source(
        &mut self,
        source_id: i64,
        source_event_id: &str,
    ) -> Result<Option<Event>, StoreError> {
        let state = &*self.guard;
        Ok(state
            .event_sources
            .iter()
            .find(|l| l.source_id == source_id && l.source_event_id == source_event_id)
            .and_then(|l| state.events.get(&l.event_id))
            .filter(|e| findable(e))
            .cloned())
    }

    async fn find_event_by_dedup_hash(&mut self, hash: &str) -> Result<Option<Event>, StoreError> {
        let mut matches: Vec<&Event> = self
            .guard
            .events
            .values()
            .filter(|e| e.dedup_hash == hash && findable(e))
            .collect();
        matches.sort_by_key(|e| (e.lifecycle_state == LifecycleState::Deleted, -e.id));
        Ok(matches.first().map(|e| (*e).clone()))
    }

    async fn create_event(&mut self, event: NewEvent) -> Result<Event, StoreError> {
        let state = &mut *self.guard;
        let taken = state.events.values().any(|e| {
            e.dedup_hash == event.dedup_hash && e.lifecycle_state != LifecycleState::Deleted
        });
        if taken && event.lifecycle_state != LifecycleState::Deleted {
            return Err(StoreError::unique("idx_events_live_dedup_hash"));
        }

        let now = Utc::now();
        let id = state.next_id();
        let created = Event {
            id,
            uid: Uuid::now_v7(),
            name: event.name,
            description: event.description,
            license_url: event.license_url,
            license_status: event.license_status,
            dedup_hash: event.dedup_hash,
            lifecycle_state: event.lifecycle_state,
            event_domain: event.event_domain,
            organizer_id: event.organizer_id,
            primary_venue_id: event.primary_venue_id,
            virtual_url: event.virtual_url,
            image_url: event.image_url,
            public_url: event.public_url,
            keywords: event.keywords,
            confidence: event.confidence,
            quality_score: event.quality_score,
            merged_into_id: None,
            deleted_at: None,
            deletion_reason: None,
            created_at: now,
            updated_at: now,
        };
        state.events.insert(id, created.clone());
        Ok(created)
    }

    async fn create_occurrence(
        &mut self,
        event_id: i64,
        occurrence: NewOccurrence,
    ) -> Result<Occurrence, StoreError> {
        let state = &mut *self.guard;
        if let Some(after) = state.fail_occurrence_after {
            if state.occurrences_in_tx >= after {
                return Err(StoreError::Backend(
                    "injected occurrence insert failure".to_owned(),
                ));
            }
        }
        state.event(event_id)?;

        let id = state.next_id();
        let created = Occurrence {
            id,
            event_id,
            start_time: occurrence.start_time,
            end_time: occurrence.end_time,
            timezone: occurrence.timezone,
            venue_id: occurrence.venue_id,
            virtual_url: occurrence.virtual_url,
        };
        state.occurrences.push(created.clone());
        state.occurrences_in_tx += 1;
        Ok(created)
    }

    async fn list_occurrences(&mut self, event_id: i64) -> Result<Vec<Occurrence>, StoreError> {
        let mut occurrences: Vec<Occurrence> = self
            .guard
            .occurrences
            .iter()
            .filter(|o| o.event_id == event_id)
            .cloned()
            .collect();
        occurrences.sort_by_key(|o| (o.start_time, o.id));
        Ok(occurrences)
    }

    async fn set_event_lifecycle(
        &mut self,
        event_id: i64,
        state: LifecycleState,
    ) -> Result<Event, StoreError> {
        let event = self.guard.event_mut(event_id)?;
        event.lifecycle_state = state;
        event.updated_at = Utc::now();
        Ok(event.clone())
    }

    async fn update_event(
        &mut self,
        event_id: i64,
        update: &EventUpdate,
    ) -> Result<Event, StoreError> {
        let event = self.guard.event_mut(event_id)?;
        if let Some(description) = &update.description {
            event.description = Some(description.clone());
        }
        if let Some(image_url) = &update.image_url {
            event.image_url = Some(image_url.clone());
        }
        if let Some(public_url) = &update.public_url {
            event.public_url = Some(public_url.clone());
        }
        if let Some(event_domain) = &update.event_domain {
            event.event_domain = event_domain.clone();
        }
        if let Some(keywords) = &update.keywords {
            event.keywords = keywords.clone();
        }
        event.updated_at = Utc::now();
        Ok(event.clone())
    }

    async fn soft_delete_event(
        &mut self,
        event_id: i64,
        reason: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        let event = self.guard.event_mut(event_id)?;
        event.lifecycle_state = LifecycleState::Deleted;
        event.deleted_at = Some(deleted_at);
        event.deletion_reason = Some(reason.to_owned());
        event.updated_at = Utc::now();
        Ok(event.clone())
    }

    async fn merge_events(
        &mut self,
        duplicate_id: i64,
        primary_id: i64,
        merged_at: DateTime<Utc>,
    ) -> Result<Event, StoreError> {
        let state = &mut *self.guard;
        let duplicate = state.event(duplicate_id)?.clone();
        let primary = state.event_mut(primary_id)?;

        fill(&mut primary.description, &duplicate.description);
        fill(&mut primary.image_url, &duplicate.image_url);
        fill(&mut primary.public_url, &duplicate.public_url);
        fill(&mut primary.organizer_id, &duplicate.organizer_id);
        fill(&mut primary.primary_venue_id, &duplicate.primary_venue_id);
        fill(&mut primary.virtual_url, &duplicate.virtual_url);
        if primary.keywords.is_empty() {
            primary.keywords = duplicate.keywords.clone();
        }
        primary.updated_at = Utc::now();
        let merged = primary.clone();

        for link in state
            .event_sources
            .iter_mut()
            .filter(|l| l.event_id == duplicate_id)
        {
            link.event_id = primary_id;
        }
        for record in state
            .idempotency
            .values_mut()
            .filter(|r| r.event_id == duplicate_id)
        {
            record.event_id = primary_id;
        }

        let retired = state.event_mut(duplicate_id)?;
        retired.merged_into_id = Some(primary_id);
        retired.lifecycle_state = LifecycleState::Deleted;
        retired.deleted_at = Some(merged_at);
        retired.deletion_reason = Some("duplicate_merged".to_owned());
        retired.updated_at = Utc::now();

        Ok(merged)
    }

    async fn find_near_duplicate_events(
        &mut self,
        name: &str,
        venue_id: i64,
        start: DateTime<Utc>,
        threshold: f64,
    ) -> Result<Vec<DuplicateCandidate>, StoreError> {
        let state = &*self.guard;
        let day = start.date_naive();
        let mut candidates: Vec<DuplicateCandidate> = state
            .events
            .values()
            .filter(|e| {
                e.lifecycle_state != LifecycleState::Deleted && e.primary_venue_id == Some(venue_id)
            })
            .filter(|e| {
                state
                    .occurrences
                    .iter()
                    .any(|o| o.event_id == e.id && o.start_time.date_naive() == day)
            })
            .map(|e| DuplicateCandidate {
                event_id: e.id,
                uid: e.uid,
                name: e.name.clone(),
                similarity: trigram_similarity(&e.name, name),
            })
            .filter(|c| c.similarity >= threshold)
            .collect();
        candidates.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then(a.event_id.cmp(&b.event_id))
        });
        candidates.truncate(SIMILAR_LIMIT);
        Ok(candidates)
    }

    async fn insert_not_duplicate(
        &mut self,
        event_a: i64,
        event_b: i64,
        _recorded_by: &str,
    ) -> Result<(), StoreError> {
        if event_a != event_b {
            self.guard
                .not_duplicates
                .insert((event_a.min(event_b), event_a.max(event_b)));
        }
        Ok(())
    }

    async fn is_not_duplicate(&mut self, event_a: i64, event_b: i64) -> Result<bool, StoreError> {
        Ok(self
            .guard
            .not_duplicates
            .contains(&(event_a.min(event_b), event_a.max(event_b))))
    }

    async fn get_or_create_source(&mut self, source: NewSource) -> Result<Source, StoreError> {
        let state = &mut *self.guard;
        if let Some(existing) = state
            .sources
            .iter()
            .find(|s| s.name == source.name && s.base_url == source.base_url)
        {
            return Ok(existing.clone());
        }

        let created = Source {
            id: state.next_id(),
            name: source.name,
            base_url: source.base_url,
            trust_level: source.trust_level,
            license_url: source.license_url,
            license_type: source.license_type,
        };
        state.sources.push(created.clone());
        Ok(created)
    }

    async fn create_event_source(&mut self, link: NewEventSource) -> Result<(), StoreError> {
        let state = &mut *self.guard;
        state.event(link.event_id)?;

        let existing = state
            .event_sources
            .iter()
            .position(|l| l.source_id == link.source_id && l.source_event_id == link.source_event_id);

        match existing {
            None => {
                state.event_sources.push(EventSourceRow {
                    event_id: link.event_id,
                    source_id: link.source_id,
                    source_event_id: link.source_event_id,
                });
                Ok(())
            }
            Some(index) => {
                let holder = state.event(state.event_sources[index].event_id)?;
                let released =
                    holder.lifecycle_state == LifecycleState::Deleted && holder.merged_into_id.is_none();
                if !released {
                    return Err(StoreError::unique(
                        "event_sources_source_id_source_event_id_key",
                    ));
                }
                state.event_sources[index].event_id = link.event_id;
                Ok(())
            }
        }
    }

    async fn get_source_trust_level(&mut self, source_id: i64) -> Result<i32, StoreError> {
        self.guard
            .sources
            .iter()
            .find(|s| s.id == source_id)
            .map(|s| s.trust_level)
            .ok_or(StoreError::NotFound)
    }

    async fn get_event_trust_level(&mut self, event_id: i64) -> Result<i32, StoreError> {
        let state = &*self.guard;
        Ok(state
            .event_sources
            .iter()
            .filter(|l| l.event_id == event_id)
            .filter_map(|l| state.sources.iter().find(|s| s.id == l.source_id))
            .map(|s| s.trust_level)
            .max()
            .unwrap_or(DEFAULT_TRUST_LEVEL))
    }

    async fn get_idempotency_key(
        &mut self,
        key: &str,
        fresh_after: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .guard
            .idempotency
            .get(key)
            .filter(|r| r.created_at >= fresh_after)
            .cloned())
    }

    async fn insert_idempotency_key(
        &mut self,
        key: &str,
        request_hash: &str,
        event_id: i64,
        fresh_after: DateTime<Utc>,
    ) -> Result<IdempotencyRecord, StoreError> {
        let state = &mut *self.guard;
        if let Some(existing) = state.idempotency.get(key) {
            if existing.created_at >= fresh_after {
                return Err(StoreError::unique("idempotency_keys_pkey"));
            }
        }

        let record = IdempotencyRecord {
            key: key.to_owned(),
            request_hash: request_hash.to_owned(),
            event_id,
            created_at: Utc::now(),
        };
        state.idempotency.insert(key.to_owned(), record.clone());
        Ok(record)
    }

    async fn delete_idempotency_keys_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let idempotency = &mut self.guard.idempotency;
        let before = idempotency.len();
        idempotency.retain(|_, r| r.created_at >= cutoff);
        Ok((before - idempotency.len()) as u64)
    }

    async fn get_place(&mut self, id: i64) -> Result<PlaceRecord, StoreError> {
        self.guard
            .places
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_place_by_uid(&mut self, uid: Uuid) -> Result<Option<PlaceRecord>, StoreError> {
        Ok(self.guard.places.values().find(|p| p.uid == uid).cloned())
    }

    async fn find_place_exact(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
    ) -> Result<Option<PlaceRecord>, StoreError> {
        Ok(self
            .guard
            .places
            .values()
            .find(|p| {
                p.merged_into_id.is_none()
                    && p.normalized_name == normalized_name
                    && p.locality == locality
                    && p.region == region
            })
            .cloned())
    }

    async fn find_similar_places(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
        threshold: f64,
    ) -> Result<Vec<SimilarEntity>, StoreError> {
        let candidates = self
            .guard
            .places
            .values()
            .filter(|p| p.merged_into_id.is_none() && p.locality == locality && p.region == region)
            .map(|p| SimilarEntity {
                id: p.id,
                uid: p.uid,
                name: p.name.clone(),
                score: trigram_similarity(&p.normalized_name, normalized_name),
            })
            .collect();
        Ok(rank_similar(candidates, threshold))
    }

    async fn insert_place(&mut self, place: NewPlace) -> Result<Option<PlaceRecord>, StoreError> {
        let state = &mut *self.guard;
        let taken = state.places.values().any(|p| {
            p.merged_into_id.is_none()
                && p.normalized_name == place.normalized_name
                && p.locality == place.locality
                && p.region == place.region
        });
        if taken {
            return Ok(None);
        }

        let id = state.next_id();
        let created = PlaceRecord {
            id,
            uid: Uuid::now_v7(),
            name: place.name,
            normalized_name: place.normalized_name,
            locality: place.locality,
            region: place.region,
            country: place.country,
            street_address: place.street_address,
            postal_code: place.postal_code,
            latitude: place.latitude,
            longitude: place.longitude,
            description: None,
            same_as: None,
            merged_into_id: None,
        };
        state.places.insert(id, created.clone());
        Ok(Some(created))
    }

    async fn merge_places(&mut self, duplicate_id: i64, primary_id: i64) -> Result<(), StoreError> {
        let state = &mut *self.guard;
        let duplicate = state
            .places
            .get(&duplicate_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let primary = state
            .places
            .get_mut(&primary_id)
            .ok_or(StoreError::NotFound)?;

        fill(&mut primary.country, &duplicate.country);
        fill(&mut primary.street_address, &duplicate.street_address);
        fill(&mut primary.postal_code, &duplicate.postal_code);
        fill(&mut primary.latitude, &duplicate.latitude);
        fill(&mut primary.longitude, &duplicate.longitude);
        fill(&mut primary.description, &duplicate.description);
        fill(&mut primary.same_as, &duplicate.same_as);

        for event in state.events.values_mut() {
            if event.primary_venue_id == Some(duplicate_id) {
                event.primary_venue_id = Some(primary_id);
            }
        }
        for occurrence in state.occurrences.iter_mut() {
            if occurrence.venue_id == Some(duplicate_id) {
                occurrence.venue_id = Some(primary_id);
            }
        }
        for place in state.places.values_mut() {
            if place.id == duplicate_id || place.merged_into_id == Some(duplicate_id) {
                place.merged_into_id = Some(primary_id);
            }
        }
        Ok(())
    }

    async fn backfill_place_coordinates(
        &mut self,
        id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<bool, StoreError> {
        let Some(place) = self.guard.places.get_mut(&id) else {
            return Ok(false);
        };
        if place.has_coordinates() {
            return Ok(false);
        }
        place.latitude = Some(latitude);
        place.longitude = Some(longitude);
        Ok(true)
    }

    async fn enrich_place(&mut self, id: i64, enrichment: &Enrichment) -> Result<bool, StoreError> {
        let Some(place) = self.guard.places.get_mut(&id) else {
            return Ok(false);
        };
        let description = fill(&mut place.description, &enrichment.description);
        let same_as = fill(&mut place.same_as, &enrichment.same_as);
        let street = fill(&mut place.street_address, &enrichment.street_address);
        Ok(description || same_as || street)
    }

    async fn get_organization(&mut self, id: i64) -> Result<OrganizationRecord, StoreError> {
        self.guard
            .organizations
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_organization_by_uid(
        &mut self,
        uid: Uuid,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        Ok(self
            .guard
            .organizations
            .values()
            .find(|o| o.uid == uid)
            .cloned())
    }

    async fn find_organization_exact(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        Ok(self
            .guard
            .organizations
            .values()
            .find(|o| {
                o.merged_into_id.is_none()
                    && o.normalized_name == normalized_name
                    && o.locality == locality
                    && o.region == region
            })
            .cloned())
    }

    async fn find_similar_organizations(
        &mut self,
        normalized_name: &str,
        locality: &str,
        region: &str,
        threshold: f64,
    ) -> Result<Vec<SimilarEntity>, StoreError> {
        let candidates = self
            .guard
            .organizations
            .values()
            .filter(|o| o.merged_into_id.is_none() && o.locality == locality && o.region == region)
            .map(|o| SimilarEntity {
                id: o.id,
                uid: o.uid,
                name: o.name.clone(),
                score: trigram_similarity(&o.normalized_name, normalized_name),
            })
            .collect();
        Ok(rank_similar(candidates, threshold))
    }

    async fn insert_organization(
        &mut self,
        organization: NewOrganization,
    ) -> Result<Option<OrganizationRecord>, StoreError> {
        let state = &mut *self.guard;
        let taken = state.organizations.values().any(|o| {
            o.merged_into_id.is_none()
                && o.normalized_name == organization.normalized_name
                && o.locality == organization.locality
                && o.region == organization.region
        });
        if taken {
            return Ok(None);
        }

        let id = state.next_id();
        let created = OrganizationRecord {
            id,
            uid: Uuid::now_v7(),
            name: organization.name,
            normalized_name: organization.normalized_name,
            locality: organization.locality,
            region: organization.region,
            url: organization.url,
            email: organization.email,
            description: None,
            same_as: None,
            merged_into_id: None,
        };
        state.organizations.insert(id, created.clone());
        Ok(Some(created))
    }

    async fn merge_organizations(
        &mut self,
        duplicate_id: i64,
        primary_id: i64,
    ) -> Result<(), StoreError> {
        let state = &mut *self.guard;
        let duplicate = state
            .organizations
            .get(&duplicate_id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let primary = state
            .organizations
            .get_mut(&primary_id)
            .ok_or(StoreError::NotFound)?;

        fill(&mut primary.url, &duplicate.url);
        fill(&mut primary.email, &duplicate.email);
        fill(&mut primary.description, &duplicate.description);
        fill(&mut primary.same_as, &duplicate.same_as);

        for event in state.events.values_mut() {
            if event.organizer_id == Some(duplicate_id) {
                event.organizer_id = Some(primary_id);
            }
        }
        for organization in state.organizations.values_mut() {
            if organization.id == duplicate_id || organization.merged_into_id == Some(duplicate_id)
            {
                organization.merged_into_id = Some(primary_id);
            }
        }
        Ok(())
    }

    async fn enrich_organization(
        &mut self,
        id: i64,
        enrichment: &Enrichment,
    ) -> Result<bool, StoreError> {
        let Some(organization) = self.guard.organizations.get_mut(&id) else {
            return Ok(false);
        };
        let description = fill(&mut organization.description, &enrichment.description);
        let same_as = fill(&mut organization.same_as, &enrichment.same_as);
        let url = fill(&mut organization.url, &enrichment.url);
        Ok(description || same_as || url)
    }

    async fn create_tombstone(&mut self, tombstone: NewTombstone) -> Result<Tombstone, StoreError> {
        let state = &mut *self.guard;
        state.event(tombstone.event_id)?;

        let created = Tombstone {
            id: state.next_id(),
            event_id: tombstone.event_id,
            event_uid: tombstone.event_uid,
            deleted_at: tombstone.deleted_at,
            reason: tombstone.reason,
            superseded_by_uri: tombstone.superseded_by_uri,
            payload: Json(tombstone.payload),
        };
        state.tombstones.push(created.clone());
        Ok(created)
    }

    async fn latest_tombstone(&mut self, event_id: i64) -> Result<Option<Tombstone>, StoreError> {
        Ok(self
            .guard
            .tombstones
            .iter()
            .filter(|t| t.event_id == event_id)
            .max_by_key(|t| (t.deleted_at, t.id))
            .cloned())
    }

    async fn create_review_entry(
        &mut self,
        entry: NewReviewEntry,
    ) -> Result<ReviewEntry, StoreError> {
        let state = &mut *self.guard;
        state.event(entry.event_id)?;
        let pending = state
            .reviews
            .values()
            .any(|r| r.event_id == entry.event_id && r.status == ReviewStatus::Pending);
        if pending {
            return Err(StoreError::unique("idx_review_queue_pending_event"));
        }

        let now = Utc::now();
        let id = state.next_id();
        let created = ReviewEntry {
            id,
            event_id: entry.event_id,
            status: ReviewStatus::Pending,
            warnings: Json(entry.warnings),
            source_id: entry.source_id,
            source_external_id: entry.source_external_id,
            dedup_hash: entry.dedup_hash,
            event_start: entry.event_start,
            event_end: entry.event_end,
            reviewed_by: None,
            reviewed_at: None,
            review_notes: None,
            rejection_reason: None,
            merged_into_id: None,
            created_at: now,
            updated_at: now,
        };
        state.reviews.insert(id, created.clone());
        Ok(created)
    }

    async fn supersede_review_entries(&mut self, event_id: i64) -> Result<u64, StoreError> {
        let mut superseded = 0;
        for entry in self.guard.reviews.values_mut().filter(|r| {
            r.event_id == event_id
                && matches!(r.status, ReviewStatus::Approved | ReviewStatus::Merged)
        }) {
            entry.status = ReviewStatus::Superseded;
            entry.updated_at = Utc::now();
            superseded += 1;
        }
        Ok(superseded)
    }

    async fn get_review_entry(&mut self, id: i64) -> Result<ReviewEntry, StoreError> {
        self.guard
            .reviews
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_pending_review(
        &mut self,
        event_id: i64,
    ) -> Result<Option<ReviewEntry>, StoreError> {
        Ok(self
            .guard
            .reviews
            .values()
            .find(|r| r.event_id == event_id && r.status == ReviewStatus::Pending)
            .cloned())
    }

    async fn find_rejected_review(
        &mut self,
        source: Option<(i64, &str)>,
        dedup_hash: &str,
    ) -> Result<Option<ReviewEntry>, StoreError> {
        Ok(self
            .guard
            .reviews
            .values()
            .filter(|r| r.status == ReviewStatus::Rejected)
            .filter(|r| {
                let same_source = matches!(
                    (source, r.source_id, r.source_external_id.as_deref()),
                    (Some((sid, ext)), Some(rsid), Some(rext)) if sid == rsid && ext == rext
                );
                same_source || r.dedup_hash.as_deref() == Some(dedup_hash)
            })
            .max_by_key(|r| (r.reviewed_at, r.id))
            .cloned())
    }

    async fn list_review_entries(
        &mut self,
        status: Option<ReviewStatus>,
        limit: i64,
        after_id: Option<i64>,
    ) -> Result<Vec<ReviewEntry>, StoreError> {
        Ok(self
            .guard
            .reviews
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .filter(|r| after_id.map_or(true, |after| r.id > after))
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn count_review_entries(&mut self) -> Result<ReviewCounts, StoreError> {
        let mut counts = ReviewCounts::default();
        for entry in self.guard.reviews.values() {
            counts.add(entry.status, 1);
        }
        Ok(counts)
    }

    async fn decide_review_entry(
        &mut self,
        id: i64,
        decision: ReviewDecision,
    ) -> Result<ReviewEntry, StoreError> {
        let entry = self.guard.review_mut(id)?;
        entry.status = decision.status;
        entry.reviewed_by = Some(decision.reviewer);
        entry.reviewed_at = Some(decision.reviewed_at);
        entry.review_notes = decision.notes;
        entry.rejection_reason = decision.rejection_reason;
        entry.merged_into_id = decision.merged_into_id;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn update_review_warnings(
        &mut self,
        id: i64,
        warnings: &[ReviewWarning],
    ) -> Result<ReviewEntry, StoreError> {
        let entry = self.guard.review_mut(id)?;
        if entry.status != ReviewStatus::Pending {
            return Err(StoreError::NotFound);
        }
        entry.warnings = Json(warnings.to_vec());
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn delete_review_entry(&mut self, id: i64) -> Result<(), StoreError> {
        self.guard.reviews.remove(&id);
        Ok(())
    }

    async fn delete_rejected_reviews_before(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let reviews = &mut self.guard.reviews;
        let before = reviews.len();
        reviews.retain(|_, r| {
            !(r.status == ReviewStatus::Rejected && r.event_finished_at() < cutoff)
        });
        Ok((before - reviews.len()) as u64)
    }

    async fn list_expired_pending_reviews(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReviewEntry>, StoreError> {
        Ok(self
            .guard
            .reviews
            .values()
            .filter(|r| r.status == ReviewStatus::Pending && r.event_start < now)
            .cloned()
            .collect())
    }

    async fn delete_reviewed_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let reviews = &mut self.guard.reviews;
        let before = reviews.len();
        reviews.retain(|_, r| {
            let terminal = matches!(
                r.status,
                ReviewStatus::Approved | ReviewStatus::Merged | ReviewStatus::Superseded
            );
            !(terminal && r.reviewed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - reviews.len()) as u64)
    }
}

fn rank_similar(mut candidates: Vec<SimilarEntity>, threshold: f64) -> Vec<SimilarEntity> {
    candidates.retain(|c| c.score >= threshold);
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    candidates.truncate(SIMILAR_LIMIT);
    candidates
}
