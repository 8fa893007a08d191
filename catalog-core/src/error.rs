use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::ReviewStatus;

// Postgres SQLSTATE for unique_violation
const UNIQUE_VIOLATION: &str = "23505";

/// Errors raised by a storage backend.
/// Errors that originate from sqlx are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("unique constraint {constraint} was violated")]
    UniqueViolation { constraint: String },
    #[error("pool creation failed with: {error}")]
    PoolCreation { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    Transaction { command: String, error: sqlx::Error },
    #[error("could not serialize jsonb field: {error}")]
    Serialization { error: serde_json::Error },
    #[error("storage backend failed with: {0}")]
    Backend(String),
}

impl StoreError {
    /// Wraps a sqlx error raised by `command`, lifting missing rows and
    /// uniqueness violations into their own variants.
    pub fn query(command: &str, error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db_error)
                if db_error.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                StoreError::UniqueViolation {
                    constraint: db_error.constraint().unwrap_or(command).to_owned(),
                }
            }
            error => StoreError::Query {
                command: command.to_owned(),
                error,
            },
        }
    }

    pub fn transaction(command: &str, error: sqlx::Error) -> Self {
        StoreError::Transaction {
            command: command.to_owned(),
            error,
        }
    }

    pub fn unique(constraint: &str) -> Self {
        StoreError::UniqueViolation {
            constraint: constraint.to_owned(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization { error }
    }
}

/// Errors returned by ingestion, entity resolution and review operations.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("not found")]
    NotFound,
    #[error("idempotency key {key} was already used with a different request")]
    Conflict { key: String },
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },
    #[error("listing was rejected on {reviewed_at} by {reviewed_by}: {reason}")]
    PreviouslyRejected {
        reason: String,
        reviewed_by: String,
        reviewed_at: DateTime<Utc>,
    },
    #[error("cannot {action} a review entry that is {from}")]
    InvalidTransition { from: ReviewStatus, action: String },
    #[error(transparent)]
    Store(StoreError),
}

impl IngestError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        IngestError::Validation {
            field: field.to_owned(),
            reason: reason.into(),
        }
    }

    /// Transient failures are safe to retry with the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Store(error) if !matches!(error, StoreError::NotFound))
    }
}

impl From<StoreError> for IngestError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => IngestError::NotFound,
            error => IngestError::Store(error),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(error: serde_json::Error) -> Self {
        IngestError::Store(StoreError::from(error))
    }
}

/// Errors raised while enqueueing or running follow-up tasks.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("could not serialize task parameters: {error}")]
    Serialization { error: serde_json::Error },
    #[error("task queue is unavailable: {0}")]
    Unavailable(String),
}
