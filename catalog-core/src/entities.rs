use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::error::{IngestError, StoreError};
use crate::input::{OrganizationInput, PlaceInput};
use crate::metrics_consts::ENTITY_RESOLVED;
use crate::normalize::normalize_name;
use crate::repository::{Repository, Transaction};
use crate::types::{NewOrganization, NewPlace, OrganizationRecord, PlaceRecord};

const MAX_REDIRECTS: usize = 16;

/// How a sub-record was matched to its canonical entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EntityMatch {
    /// The submitter referenced an existing record by its external id.
    Reference,
    Exact,
    Similar(f64),
    Created,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub record: T,
    pub matched: EntityMatch,
}

impl EntityMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityMatch::Reference => "reference",
            EntityMatch::Exact => "exact",
            EntityMatch::Similar(_) => "similar",
            EntityMatch::Created => "created",
        }
    }
}

impl<T> Resolved<T> {
    pub fn created(&self) -> bool {
        self.matched == EntityMatch::Created
    }
}

/// Resolves a venue sub-record to its canonical place: a referenced id, then
/// the exact (normalized name, locality, region) key, then the best trigram
/// match above `threshold`, and only then a new record.
pub async fn resolve_place(
    tx: &mut dyn Transaction,
    input: &PlaceInput,
    threshold: f64,
) -> Result<Resolved<PlaceRecord>, IngestError> {
    let resolved = match_place(tx, input, threshold).await?;
    metrics::counter!(ENTITY_RESOLVED, "entity" => "place", "match" => resolved.matched.as_str())
        .increment(1);
    Ok(resolved)
}

async fn match_place(
    tx: &mut dyn Transaction,
    input: &PlaceInput,
    threshold: f64,
) -> Result<Resolved<PlaceRecord>, IngestError> {
    if let Some(uid) = input.id.as_deref().and_then(|id| Uuid::parse_str(id).ok()) {
        if let Some(place) = tx.find_place_by_uid(uid).await? {
            let record = canonical_place(tx, place).await?;
            return Ok(Resolved {
                record,
                matched: EntityMatch::Reference,
            });
        }
    }

    let normalized = normalize_name(&input.name);
    if normalized.is_empty() {
        return Err(IngestError::validation("location.name", "is required"));
    }
    let locality = input.address_locality.clone().unwrap_or_default();
    let region = input.address_region.clone().unwrap_or_default();

    if let Some(record) = tx.find_place_exact(&normalized, &locality, &region).await? {
        return Ok(Resolved {
            record,
            matched: EntityMatch::Exact,
        });
    }

    if threshold > 0.0 {
        let similar = tx
            .find_similar_places(&normalized, &locality, &region, threshold)
            .await?;
        if let Some(best) = similar.first() {
            debug!(name = %input.name, matched = %best.name, score = best.score, "fuzzy place match");
            let record = tx.get_place(best.id).await?;
            return Ok(Resolved {
                record,
                matched: EntityMatch::Similar(best.score),
            });
        }
    }

    let new_place = NewPlace {
        name: input.name.clone(),
        normalized_name: normalized.clone(),
        locality: locality.clone(),
        region: region.clone(),
        country: input.address_country.clone(),
        street_address: input.street_address.clone(),
        postal_code: input.postal_code.clone(),
        latitude: input.latitude,
        longitude: input.longitude,
    };
    match tx.insert_place(new_place).await? {
        Some(record) => Ok(Resolved {
            record,
            matched: EntityMatch::Created,
        }),
        // A concurrent writer created the same key first
        None => {
            let record = tx
                .find_place_exact(&normalized, &locality, &region)
                .await?
                .ok_or(StoreError::NotFound)?;
            Ok(Resolved {
                record,
                matched: EntityMatch::Exact,
            })
        }
    }
}

pub async fn resolve_organization(
    tx: &mut dyn Transaction,
    input: &OrganizationInput,
    threshold: f64,
) -> Result<Resolved<OrganizationRecord>, IngestError> {
    let resolved = match_organization(tx, input, threshold).await?;
    metrics::counter!(
        ENTITY_RESOLVED,
        "entity" => "organization",
        "match" => resolved.matched.as_str()
    )
    .increment(1);
    Ok(resolved)
}

async fn match_organization(
    tx: &mut dyn Transaction,
    input: &OrganizationInput,
    threshold: f64,
) -> Result<Resolved<OrganizationRecord>, IngestError> {
    if let Some(uid) = input.id.as_deref().and_then(|id| Uuid::parse_str(id).ok()) {
        if let Some(organization) = tx.find_organization_by_uid(uid).await? {
            let record = canonical_organization(tx, organization).await?;
            return Ok(Resolved {
                record,
                matched: EntityMatch::Reference,
            });
        }
    }

    let normalized = normalize_name(&input.name);
    if normalized.is_empty() {
        return Err(IngestError::validation("organizer.name", "is required"));
    }
    let locality = input.address_locality.clone().unwrap_or_default();
    let region = input.address_region.clone().unwrap_or_default();

    if let Some(record) = tx
        .find_organization_exact(&normalized, &locality, &region)
        .await?
    {
        return Ok(Resolved {
            record,
            matched: EntityMatch::Exact,
        });
    }

    if threshold > 0.0 {
        let similar = tx
            .find_similar_organizations(&normalized, &locality, &region, threshold)
            .await?;
        if let Some(best) = similar.first() {
            debug!(name = %input.name, matched = %best.name, score = best.score, "fuzzy organization match");
            let record = tx.get_organization(best.id).await?;
            return Ok(Resolved {
                record,
                matched: EntityMatch::Similar(best.score),
            });
        }
    }

    let new_organization = NewOrganization {
        name: input.name.clone(),
        normalized_name: normalized.clone(),
        locality: locality.clone(),
        region: region.clone(),
        url: input.url.clone(),
        email: input.email.clone(),
    };
    match tx.insert_organization(new_organization).await? {
        Some(record) => Ok(Resolved {
            record,
            matched: EntityMatch::Created,
        }),
        None => {
            let record = tx
                .find_organization_exact(&normalized, &locality, &region)
                .await?
                .ok_or(StoreError::NotFound)?;
            Ok(Resolved {
                record,
                matched: EntityMatch::Exact,
            })
        }
    }
}

pub(crate) async fn canonical_place(
    tx: &mut dyn Transaction,
    mut place: PlaceRecord,
) -> Result<PlaceRecord, StoreError> {
    for _ in 0..MAX_REDIRECTS {
        match place.merged_into_id {
            Some(primary_id) => place = tx.get_place(primary_id).await?,
            None => return Ok(place),
        }
    }
    Err(StoreError::Backend(format!(
        "merge chain of place {} is too long",
        place.id
    )))
}

async fn canonical_organization(
    tx: &mut dyn Transaction,
    mut organization: OrganizationRecord,
) -> Result<OrganizationRecord, StoreError> {
    for _ in 0..MAX_REDIRECTS {
        match organization.merged_into_id {
            Some(primary_id) => organization = tx.get_organization(primary_id).await?,
            None => return Ok(organization),
        }
    }
    Err(StoreError::Backend(format!(
        "merge chain of organization {} is too long",
        organization.id
    )))
}

/// Venue and organizer resolution and merges, for callers outside ingestion.
#[derive(Clone)]
pub struct EntityResolver {
    repo: Arc<dyn Repository>,
    config: IngestConfig,
}

impl EntityResolver {
    pub fn new(repo: Arc<dyn Repository>, config: IngestConfig) -> Self {
        Self { repo, config }
    }

    pub async fn resolve_place(
        &self,
        input: &PlaceInput,
    ) -> Result<Resolved<PlaceRecord>, IngestError> {
        let mut tx = self.repo.begin().await?;
        let resolved =
            resolve_place(tx.as_mut(), input, self.config.place_similarity_threshold).await?;
        tx.commit().await?;
        Ok(resolved)
    }

    pub async fn resolve_organization(
        &self,
        input: &OrganizationInput,
    ) -> Result<Resolved<OrganizationRecord>, IngestError> {
        let mut tx = self.repo.begin().await?;
        let resolved = resolve_organization(
            tx.as_mut(),
            input,
            self.config.organization_similarity_threshold,
        )
        .await?;
        tx.commit().await?;
        Ok(resolved)
    }

    /// Folds `duplicate` into `primary` and returns the canonical id. Events and
    /// occurrences pointing at the duplicate move to the primary; the duplicate
    /// stays behind as a redirect.
    pub async fn merge_places(&self, duplicate: Uuid, primary: Uuid) -> Result<Uuid, IngestError> {
        let mut tx = self.repo.begin().await?;
        let duplicate = tx.find_place_by_uid(duplicate).await?.ok_or(IngestError::NotFound)?;
        let primary = tx.find_place_by_uid(primary).await?.ok_or(IngestError::NotFound)?;
        let primary = canonical_place(tx.as_mut(), primary).await?;

        if duplicate.id == primary.id {
            return Err(IngestError::validation(
                "duplicate",
                "cannot merge a place into itself",
            ));
        }
        if duplicate.merged_into_id.is_some() {
            return Err(IngestError::validation("duplicate", "place is already merged"));
        }

        tx.merge_places(duplicate.id, primary.id).await?;
        tx.commit().await?;

        info!(duplicate = %duplicate.uid, primary = %primary.uid, "merged places");
        Ok(primary.uid)
    }

    pub async fn merge_organizations(
        &self,
        duplicate: Uuid,
        primary: Uuid,
    ) -> Result<Uuid, IngestError> {
        let mut tx = self.repo.begin().await?;
        let duplicate = tx
            .find_organization_by_uid(duplicate)
            .await?
            .ok_or(IngestError::NotFound)?;
        let primary = tx
            .find_organization_by_uid(primary)
            .await?
            .ok_or(IngestError::NotFound)?;
        let primary = canonical_organization(tx.as_mut(), primary).await?;

        if duplicate.id == primary.id {
            return Err(IngestError::validation(
                "duplicate",
                "cannot merge an organization into itself",
            ));
        }
        if duplicate.merged_into_id.is_some() {
            return Err(IngestError::validation(
                "duplicate",
                "organization is already merged",
            ));
        }

        tx.merge_organizations(duplicate.id, primary.id).await?;
        tx.commit().await?;

        info!(duplicate = %duplicate.uid, primary = %primary.uid, "merged organizations");
        Ok(primary.uid)
    }
}
