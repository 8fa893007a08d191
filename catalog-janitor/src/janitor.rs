use std::sync::Arc;
use std::time::Instant;

use catalog_core::{IdempotencyLedger, IngestError, Repository, ReviewQueue};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{config::JanitorSettings, metrics_constants::*};

// The janitor reports its own metrics, this is mostly for testing purposes
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct CleanupResult {
    pub rejected_deleted: u64,
    pub expired_pending: u64,
    pub reviewed_deleted: u64,
    pub idempotency_deleted: u64,
    pub pending_reviews: u64,
}

pub struct Janitor {
    pub review: ReviewQueue,
    pub ledger: IdempotencyLedger,
    pub settings: JanitorSettings,
    pub metrics_labels: Vec<(String, String)>,
}

impl Janitor {
    pub fn new(repo: Arc<dyn Repository>, settings: JanitorSettings) -> Self {
        let review = ReviewQueue::new(
            repo.clone(),
            settings.ingest.clone(),
            settings.retention,
        );
        let ledger = IdempotencyLedger::new(repo);
        let metrics_labels = vec![("janitor_id".to_string(), settings.id.clone())];

        Self {
            review,
            ledger,
            settings,
            metrics_labels,
        }
    }

    /// One pass of every retention rule, evaluated at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CleanupResult, IngestError> {
        info!("Running janitor loop");
        let loop_start = Instant::now();
        metrics::counter!(RUN_STARTS, &self.metrics_labels).increment(1);

        let result = self.cleanup(now).await;
        if result.is_err() {
            metrics::counter!(RUN_FAILURES, &self.metrics_labels).increment(1);
        }

        metrics::histogram!(RUN_TIME, &self.metrics_labels)
            .record(loop_start.elapsed().as_millis() as f64);
        metrics::counter!(RUN_ENDS, &self.metrics_labels).increment(1);
        info!("Janitor loop complete");
        result
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupResult, IngestError> {
        let mut result = CleanupResult::default();

        let sweep_start = Instant::now();
        let retention = self.review.sweep_retention(now).await?;
        metrics::histogram!(REVIEW_SWEEP_TIME, &self.metrics_labels)
            .record(sweep_start.elapsed().as_millis() as f64);
        metrics::counter!(REJECTED_DELETED, &self.metrics_labels)
            .increment(retention.rejected_deleted);
        metrics::counter!(PENDING_EXPIRED, &self.metrics_labels)
            .increment(retention.expired_pending);
        metrics::counter!(REVIEWED_DELETED, &self.metrics_labels)
            .increment(retention.reviewed_deleted);
        result.rejected_deleted = retention.rejected_deleted;
        result.expired_pending = retention.expired_pending;
        result.reviewed_deleted = retention.reviewed_deleted;

        if retention.expired_pending > 0 {
            warn!(
                "Retired {} events that were never reviewed",
                retention.expired_pending
            );
        }

        let sweep_start = Instant::now();
        result.idempotency_deleted = self.ledger.sweep_expired(now).await?;
        metrics::histogram!(IDEMPOTENCY_SWEEP_TIME, &self.metrics_labels)
            .record(sweep_start.elapsed().as_millis() as f64);
        metrics::counter!(IDEMPOTENCY_DELETED, &self.metrics_labels)
            .increment(result.idempotency_deleted);

        result.pending_reviews = self.review.counts().await?.pending;
        metrics::gauge!(PENDING_REVIEWS, &self.metrics_labels).set(result.pending_reviews as f64);

        Ok(result)
    }
}
