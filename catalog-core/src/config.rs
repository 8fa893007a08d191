use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, PgPool};

pub const DEFAULT_TIMEZONE: &str = "America/Toronto";
pub const DEFAULT_LICENSE_URL: &str = "https://creativecommons.org/publicdomain/zero/1.0/";
pub const DEFAULT_EVENT_DOMAIN: &str = "arts";

// A pool config object, designed to be passable across API boundaries
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub max_connections: Option<u32>,         // Default to 10
    pub min_connections: Option<u32>,         // Default to 1
    pub acquire_timeout_seconds: Option<u64>, // Default to 30
    pub max_lifetime_seconds: Option<u64>,    // Default to 300
    pub idle_timeout_seconds: Option<u64>,    // Default to 60
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        let builder = PoolOptions::new()
            .max_connections(self.max_connections.unwrap_or(10))
            .min_connections(self.min_connections.unwrap_or(1))
            .max_lifetime(Duration::from_secs(
                self.max_lifetime_seconds.unwrap_or(300),
            ))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds.unwrap_or(60)))
            .acquire_timeout(Duration::from_secs(
                self.acquire_timeout_seconds.unwrap_or(30),
            ));

        builder.connect(&self.db_url).await
    }
}

/// Tunables for the ingestion pipeline. Passed explicitly to constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// IANA zone applied to occurrences that carry none.
    pub default_timezone: String,
    /// When set, a missing image alone sends a listing to review.
    pub require_image: bool,
    /// Listings starting further out than this are held for review.
    pub far_future_days: i64,
    pub place_similarity_threshold: f64,
    pub organization_similarity_threshold: f64,
    /// Zero disables near-duplicate detection.
    pub near_duplicate_threshold: f64,
    pub default_license_url: String,
    pub default_event_domain: String,
    /// Base for public event URIs written into tombstones.
    pub public_base_url: String,
    /// How many times a submission is re-resolved after losing a uniqueness race.
    pub max_conflict_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_timezone: DEFAULT_TIMEZONE.to_owned(),
            require_image: false,
            far_future_days: 730,
            place_similarity_threshold: 0.6,
            organization_similarity_threshold: 0.6,
            near_duplicate_threshold: 0.4,
            default_license_url: DEFAULT_LICENSE_URL.to_owned(),
            default_event_domain: DEFAULT_EVENT_DOMAIN.to_owned(),
            public_base_url: "http://localhost:8080".to_owned(),
            max_conflict_retries: 2,
        }
    }
}

impl IngestConfig {
    pub fn event_uri(&self, uid: &uuid::Uuid) -> String {
        format!("{}/events/{}", self.public_base_url.trim_end_matches('/'), uid)
    }
}

/// Retention windows applied by the review queue sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Rejected entries are kept this long after their event ends.
    pub rejected_grace: chrono::Duration,
    /// Approved, merged and superseded entries are kept this long after review.
    pub reviewed_retention: chrono::Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            rejected_grace: chrono::Duration::days(7),
            reviewed_retention: chrono::Duration::days(90),
        }
    }
}
