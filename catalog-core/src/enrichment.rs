use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::metrics_consts::{TASK_ENQUEUED, TASK_ENQUEUE_FAILED};
use crate::repository::Repository;
use crate::tasks::{classify_confidence, EntityKind, FollowUpTask, MatchConfidence, TaskQueue};
use crate::types::Enrichment;

/// A knowledge-graph match reported by the reconciliation collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub same_as: String,
    pub score: f64,
    /// The match was on the exact name rather than a fuzzy one.
    pub exact: bool,
}

/// Applies the results of geocoding, reconciliation and enrichment back onto
/// places and organizations. Identity fields are never touched.
#[derive(Clone)]
pub struct EnrichmentService {
    repo: Arc<dyn Repository>,
    tasks: Arc<dyn TaskQueue>,
}

impl EnrichmentService {
    pub fn new(repo: Arc<dyn Repository>, tasks: Arc<dyn TaskQueue>) -> Self {
        Self { repo, tasks }
    }

    /// Classifies a match and, when it is trusted enough, schedules enrichment.
    pub async fn apply_reconciliation(
        &self,
        entity: EntityKind,
        entity_id: i64,
        reconciliation: Reconciliation,
    ) -> Result<MatchConfidence, IngestError> {
        let confidence = classify_confidence(reconciliation.score, reconciliation.exact);
        if confidence != MatchConfidence::AutoHigh {
            debug!(?entity, entity_id, score = reconciliation.score, ?confidence, "reconciliation not applied");
            return Ok(confidence);
        }

        let task = FollowUpTask::EnrichEntity {
            entity,
            entity_id,
            same_as: reconciliation.same_as,
        };
        let kind = task.kind();
        match self.tasks.enqueue(task).await {
            Ok(()) => metrics::counter!(TASK_ENQUEUED, "kind" => kind).increment(1),
            Err(error) => {
                metrics::counter!(TASK_ENQUEUE_FAILED, "kind" => kind).increment(1);
                warn!(?entity, entity_id, %error, "failed to enqueue enrichment");
            }
        }
        Ok(confidence)
    }

    /// Fills empty fields only. Returns whether anything was written.
    pub async fn apply_enrichment(
        &self,
        entity: EntityKind,
        entity_id: i64,
        enrichment: &Enrichment,
    ) -> Result<bool, IngestError> {
        let mut tx = self.repo.begin().await?;
        let changed = match entity {
            EntityKind::Place => tx.enrich_place(entity_id, enrichment).await?,
            EntityKind::Organization => tx.enrich_organization(entity_id, enrichment).await?,
        };
        tx.commit().await?;

        if changed {
            info!(?entity, entity_id, "enriched entity");
        }
        Ok(changed)
    }

    /// Writes coordinates to a place that has none.
    pub async fn apply_geocode(
        &self,
        place_id: i64,
        latitude: f64,
        longitude: f64,
    ) -> Result<bool, IngestError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(IngestError::validation("latitude", "must be between -90 and 90"));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(IngestError::validation("longitude", "must be between -180 and 180"));
        }

        let mut tx = self.repo.begin().await?;
        let changed = tx
            .backfill_place_coordinates(place_id, latitude, longitude)
            .await?;
        tx.commit().await?;

        if changed {
            info!(place_id, "geocoded place");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::repository::Transaction;
    use crate::tasks::MemoryTaskQueue;
    use crate::types::NewPlace;

    async fn seed_place(repo: &MemoryRepository, latitude: Option<f64>) -> i64 {
        let mut tx = repo.begin().await.unwrap();
        let place = tx
            .insert_place(NewPlace {
                name: "The Rex".to_owned(),
                normalized_name: "the rex".to_owned(),
                locality: "Toronto".to_owned(),
                region: "ON".to_owned(),
                country: None,
                street_address: None,
                postal_code: None,
                latitude,
                longitude: latitude.map(|_| -79.39),
            })
            .await
            .unwrap()
            .unwrap();
        tx.commit().await.unwrap();
        place.id
    }

    #[tokio::test]
    async fn test_geocode_only_fills_missing_coordinates() {
        let repo = MemoryRepository::new();
        let bare = seed_place(&repo, None).await;
        let service = EnrichmentService::new(Arc::new(repo.clone()), Arc::new(MemoryTaskQueue::new()));

        assert!(service.apply_geocode(bare, 43.65, -79.38).await.unwrap());
        assert!(!service.apply_geocode(bare, 10.0, 10.0).await.unwrap());

        let places = repo.places().await;
        assert_eq!(places[0].latitude, Some(43.65));
        assert_eq!(places[0].longitude, Some(-79.38));

        let err = service.apply_geocode(bare, 91.0, 0.0).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_enrichment_never_overwrites() {
        let repo = MemoryRepository::new();
        let place_id = seed_place(&repo, Some(43.65)).await;
        let service = EnrichmentService::new(Arc::new(repo.clone()), Arc::new(MemoryTaskQueue::new()));

        let first = Enrichment {
            description: Some("Jazz bar on Queen West".to_owned()),
            same_as: Some("http://www.wikidata.org/entity/Q7759971".to_owned()),
            ..Default::default()
        };
        assert!(service
            .apply_enrichment(EntityKind::Place, place_id, &first)
            .await
            .unwrap());

        let second = Enrichment {
            description: Some("Something else".to_owned()),
            ..Default::default()
        };
        assert!(!service
            .apply_enrichment(EntityKind::Place, place_id, &second)
            .await
            .unwrap());

        let place = &repo.places().await[0];
        assert_eq!(place.description.as_deref(), Some("Jazz bar on Queen West"));
        assert_eq!(place.name, "The Rex");
    }

    #[tokio::test]
    async fn test_only_trusted_matches_schedule_enrichment() {
        let tasks = MemoryTaskQueue::new();
        let service = EnrichmentService::new(Arc::new(MemoryRepository::new()), Arc::new(tasks.clone()));

        let low = Reconciliation {
            same_as: "http://www.wikidata.org/entity/Q1".to_owned(),
            score: 0.9,
            exact: true,
        };
        assert_eq!(
            service
                .apply_reconciliation(EntityKind::Organization, 1, low)
                .await
                .unwrap(),
            MatchConfidence::AutoLow
        );
        assert!(tasks.recorded().await.is_empty());

        let high = Reconciliation {
            same_as: "http://www.wikidata.org/entity/Q2".to_owned(),
            score: 0.99,
            exact: true,
        };
        assert_eq!(
            service
                .apply_reconciliation(EntityKind::Organization, 1, high)
                .await
                .unwrap(),
            MatchConfidence::AutoHigh
        );
        assert_eq!(
            tasks.recorded().await,
            vec![FollowUpTask::EnrichEntity {
                entity: EntityKind::Organization,
                entity_id: 1,
                same_as: "http://www.wikidata.org/entity/Q2".to_owned(),
            }]
        );
    }
}
