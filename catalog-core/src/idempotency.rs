use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::repository::{Repository, Transaction};
use crate::types::IdempotencyRecord;

/// Keys older than this behave as if they were never written.
pub const IDEMPOTENCY_TTL_HOURS: i64 = 24;

pub fn fresh_after(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(IDEMPOTENCY_TTL_HOURS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Absent,
    /// The key was used before with the same request and produced this event.
    Replay(i64),
}

/// Looks a key up inside the caller's transaction.
/// A fresh key recorded with a different request hash is a `Conflict`.
pub async fn check(
    tx: &mut dyn Transaction,
    key: &str,
    request_hash: &str,
) -> Result<KeyState, IngestError> {
    match tx.get_idempotency_key(key, fresh_after(Utc::now())).await? {
        None => Ok(KeyState::Absent),
        Some(record) if record.request_hash == request_hash => {
            Ok(KeyState::Replay(record.event_id))
        }
        Some(_) => {
            warn!(key, "idempotency key reused with a different request");
            Err(IngestError::Conflict {
                key: key.to_owned(),
            })
        }
    }
}

/// Records `key` inside the caller's transaction. Re-recording the same
/// request is a no-op. Losing a race to a concurrent writer surfaces as a
/// store uniqueness violation.
pub async fn record(
    tx: &mut dyn Transaction,
    key: &str,
    request_hash: &str,
    event_id: i64,
) -> Result<(), IngestError> {
    match check(tx, key, request_hash).await? {
        KeyState::Replay(_) => Ok(()),
        KeyState::Absent => {
            tx.insert_idempotency_key(key, request_hash, event_id, fresh_after(Utc::now()))
                .await?;
            Ok(())
        }
    }
}

/// Durable map from client request keys to the events they produced.
#[derive(Clone)]
pub struct IdempotencyLedger {
    repo: Arc<dyn Repository>,
}

impl IdempotencyLedger {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>, IngestError> {
        let mut tx = self.repo.begin().await?;
        let record = tx
            .get_idempotency_key(key, fresh_after(Utc::now()))
            .await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn record(
        &self,
        key: &str,
        request_hash: &str,
        event_id: i64,
    ) -> Result<(), IngestError> {
        let mut tx = self.repo.begin().await?;
        record(tx.as_mut(), key, request_hash, event_id).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Deletes keys that expired before `now`. Safe to run concurrently and repeatedly.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, IngestError> {
        let mut tx = self.repo.begin().await?;
        let deleted = tx.delete_idempotency_keys_before(fresh_after(now)).await?;
        tx.commit().await?;

        if deleted > 0 {
            info!(deleted, "swept expired idempotency keys");
        }
        Ok(deleted)
    }
}
