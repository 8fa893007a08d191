use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enumeration of lifecycle states for an Event.
/// Draft: waiting on moderation, not publicly listed.
/// Active: published.
/// Deleted: soft-deleted or merged into another event. Never hard-deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_lifecycle_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Draft,
    Active,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::Active => "active",
            LifecycleState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enumeration of possible statuses for a review queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "review_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Merged,
    Superseded,
}

impl ReviewStatus {
    pub const ALL: [ReviewStatus; 5] = [
        ReviewStatus::Pending,
        ReviewStatus::Approved,
        ReviewStatus::Rejected,
        ReviewStatus::Merged,
        ReviewStatus::Superseded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
            ReviewStatus::Merged => "merged",
            ReviewStatus::Superseded => "superseded",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReviewStatus::Pending),
            "approved" => Ok(ReviewStatus::Approved),
            "rejected" => Ok(ReviewStatus::Rejected),
            "merged" => Ok(ReviewStatus::Merged),
            "superseded" => Ok(ReviewStatus::Superseded),
            invalid => Err(format!("{invalid} is not a valid review status")),
        }
    }
}

/// Reason codes attached to a review entry and returned to submitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCode {
    MissingDescription,
    MissingImage,
    TooFarFuture,
    PotentialDuplicate,
}

impl WarningCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningCode::MissingDescription => "missing_description",
            WarningCode::MissingImage => "missing_image",
            WarningCode::TooFarFuture => "too_far_future",
            WarningCode::PotentialDuplicate => "potential_duplicate",
        }
    }
}

/// An existing event that looks like the same real-world listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub event_id: i64,
    pub uid: Uuid,
    pub name: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewWarning {
    pub code: WarningCode,
    pub field: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<DuplicateCandidate>,
}

impl ReviewWarning {
    pub fn new(code: WarningCode, field: &str, message: &str) -> Self {
        Self {
            code,
            field: field.to_owned(),
            message: message.to_owned(),
            candidates: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub uid: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub license_url: String,
    pub license_status: String,
    pub dedup_hash: String,
    pub lifecycle_state: LifecycleState,
    pub event_domain: String,
    pub organizer_id: Option<i64>,
    pub primary_venue_id: Option<i64>,
    pub virtual_url: Option<String>,
    pub image_url: Option<String>,
    pub public_url: Option<String>,
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub quality_score: f64,
    pub merged_into_id: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deletion_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An Event to be inserted. The external uid is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub name: String,
    pub description: Option<String>,
    pub license_url: String,
    pub license_status: String,
    pub dedup_hash: String,
    pub lifecycle_state: LifecycleState,
    pub event_domain: String,
    pub organizer_id: Option<i64>,
    pub primary_venue_id: Option<i64>,
    pub virtual_url: Option<String>,
    pub image_url: Option<String>,
    pub public_url: Option<String>,
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub quality_score: f64,
}

/// Descriptive fields to overwrite on an existing event. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventUpdate {
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub public_url: Option<String>,
    pub event_domain: Option<String>,
    pub keywords: Option<Vec<String>>,
}

impl EventUpdate {
    pub fn is_empty(&self) -> bool {
        self == &EventUpdate::default()
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Occurrence {
    pub id: i64,
    pub event_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub timezone: String,
    pub venue_id: Option<i64>,
    pub virtual_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOccurrence {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub timezone: String,
    pub venue_id: Option<i64>,
    pub virtual_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub trust_level: i32,
    pub license_url: Option<String>,
    pub license_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub base_url: String,
    pub trust_level: i32,
    pub license_url: Option<String>,
    pub license_type: Option<String>,
}

/// Records that a source's native event id produced a specific Event.
#[derive(Debug, Clone)]
pub struct NewEventSource {
    pub event_id: i64,
    pub source_id: i64,
    pub source_event_id: String,
    pub source_url: Option<String>,
    pub payload: serde_json::Value,
    pub payload_hash: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub key: String,
    pub request_hash: String,
    pub event_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PlaceRecord {
    pub id: i64,
    pub uid: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub locality: String,
    pub region: String,
    pub country: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub description: Option<String>,
    pub same_as: Option<String>,
    pub merged_into_id: Option<i64>,
}

impl PlaceRecord {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewPlace {
    pub name: String,
    pub normalized_name: String,
    pub locality: String,
    pub region: String,
    pub country: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OrganizationRecord {
    pub id: i64,
    pub uid: Uuid,
    pub name: String,
    pub normalized_name: String,
    pub locality: String,
    pub region: String,
    pub url: Option<String>,
    pub email: Option<String>,
    pub description: Option<String>,
    pub same_as: Option<String>,
    pub merged_into_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewOrganization {
    pub name: String,
    pub normalized_name: String,
    pub locality: String,
    pub region: String,
    pub url: Option<String>,
    pub email: Option<String>,
}

/// A fuzzy match returned by a similarity search.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SimilarEntity {
    pub id: i64,
    pub uid: Uuid,
    pub name: String,
    pub score: f64,
}

/// Fields a knowledge-graph match may fill in. Only empty fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub description: Option<String>,
    pub same_as: Option<String>,
    pub street_address: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Tombstone {
    pub id: i64,
    pub event_id: i64,
    pub event_uid: Uuid,
    pub deleted_at: DateTime<Utc>,
    pub reason: String,
    pub superseded_by_uri: Option<String>,
    pub payload: sqlx::types::Json<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewTombstone {
    pub event_id: i64,
    pub event_uid: Uuid,
    pub deleted_at: DateTime<Utc>,
    pub reason: String,
    pub superseded_by_uri: Option<String>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReviewEntry {
    pub id: i64,
    pub event_id: i64,
    pub status: ReviewStatus,
    pub warnings: sqlx::types::Json<Vec<ReviewWarning>>,
    pub source_id: Option<i64>,
    pub source_external_id: Option<String>,
    pub dedup_hash: Option<String>,
    pub event_start: DateTime<Utc>,
    pub event_end: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub merged_into_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewEntry {
    pub fn warning_codes(&self) -> Vec<WarningCode> {
        warning_codes(&self.warnings.0)
    }

    /// The instant after which the listing is in the past.
    pub fn event_finished_at(&self) -> DateTime<Utc> {
        self.event_end.unwrap_or(self.event_start)
    }
}

/// Sorted, de-duplicated reason codes of a warning list.
pub fn warning_codes(warnings: &[ReviewWarning]) -> Vec<WarningCode> {
    let mut codes: Vec<WarningCode> = warnings.iter().map(|w| w.code).collect();
    codes.sort();
    codes.dedup();
    codes
}

#[derive(Debug, Clone)]
pub struct NewReviewEntry {
    pub event_id: i64,
    pub warnings: Vec<ReviewWarning>,
    pub source_id: Option<i64>,
    pub source_external_id: Option<String>,
    pub dedup_hash: Option<String>,
    pub event_start: DateTime<Utc>,
    pub event_end: Option<DateTime<Utc>>,
}

/// The terminal state a pending entry moves into.
#[derive(Debug, Clone)]
pub struct ReviewDecision {
    pub status: ReviewStatus,
    pub reviewer: String,
    pub notes: Option<String>,
    pub rejection_reason: Option<String>,
    pub merged_into_id: Option<i64>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReviewCounts {
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
    pub merged: u64,
    pub superseded: u64,
}

impl ReviewCounts {
    pub fn add(&mut self, status: ReviewStatus, count: u64) {
        match status {
            ReviewStatus::Pending => self.pending += count,
            ReviewStatus::Approved => self.approved += count,
            ReviewStatus::Rejected => self.rejected += count,
            ReviewStatus::Merged => self.merged += count,
            ReviewStatus::Superseded => self.superseded += count,
        }
    }
}
