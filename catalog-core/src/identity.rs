use std::fmt;

use tracing::debug;

use crate::error::{IngestError, StoreError};
use crate::idempotency::{self, KeyState};
use crate::repository::Transaction;
use crate::types::Event;

// Merge chains are flattened on merge, this only guards against corrupt data
const MAX_REDIRECTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    IdempotentReplay,
    SourceDuplicate,
    ContentDuplicate,
}

impl DuplicateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateKind::IdempotentReplay => "idempotent_replay",
            DuplicateKind::SourceDuplicate => "source_duplicate",
            DuplicateKind::ContentDuplicate => "content_duplicate",
        }
    }
}

impl fmt::Display for DuplicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdentityMatch {
    NoMatch,
    Duplicate(DuplicateKind, Event),
}

/// The identity signals of one submission.
#[derive(Debug, Clone, Copy)]
pub struct IdentityProbe<'a> {
    pub idempotency_key: Option<&'a str>,
    pub request_hash: &'a str,
    /// Registered source id and the source's native event id.
    pub source: Option<(i64, &'a str)>,
    pub dedup_hash: &'a str,
}

/// Checks, in order, the idempotency key, the source identity and the content
/// fingerprint. The first signal that matches wins. A key reused with a
/// different payload fails with `Conflict`.
pub async fn resolve(
    tx: &mut dyn Transaction,
    probe: IdentityProbe<'_>,
) -> Result<IdentityMatch, IngestError> {
    if let Some(key) = probe.idempotency_key {
        match idempotency::check(tx, key, probe.request_hash).await? {
            KeyState::Replay(event_id) => {
                let stored = tx.get_event(event_id).await?;
                let event = follow_redirects(tx, stored).await?;
                debug!(key, event_id = event.id, "idempotent replay");
                return Ok(IdentityMatch::Duplicate(
                    DuplicateKind::IdempotentReplay,
                    event,
                ));
            }
            KeyState::Absent => {}
        }
    }

    if let Some((source_id, source_event_id)) = probe.source {
        if let Some(event) = tx.find_event_by_source(source_id, source_event_id).await? {
            let event = follow_redirects(tx, event).await?;
            debug!(source_id, source_event_id, event_id = event.id, "source duplicate");
            return Ok(IdentityMatch::Duplicate(DuplicateKind::SourceDuplicate, event));
        }
    }

    if let Some(event) = tx.find_event_by_dedup_hash(probe.dedup_hash).await? {
        let event = follow_redirects(tx, event).await?;
        debug!(event_id = event.id, "content duplicate");
        return Ok(IdentityMatch::Duplicate(DuplicateKind::ContentDuplicate, event));
    }

    Ok(IdentityMatch::NoMatch)
}

/// Walks `merged_into` links to the surviving event.
pub async fn follow_redirects(
    tx: &mut dyn Transaction,
    mut event: Event,
) -> Result<Event, StoreError> {
    for _ in 0..MAX_REDIRECTS {
        match event.merged_into_id {
            Some(primary_id) => event = tx.get_event(primary_id).await?,
            None => return Ok(event),
        }
    }
    Err(StoreError::Backend(format!(
        "merge chain of event {} is longer than {MAX_REDIRECTS}",
        event.id
    )))
}
