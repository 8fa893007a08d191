use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    DuplicateCandidate, Event, EventUpdate, LifecycleState, NewEvent, NewEventSource, NewOccurrence,
    NewSource, NewTombstone, Occurrence, Source, Tombstone,
};

const EVENT_COLUMNS: &str = r#"
    id, uid, name, description, license_url, license_status, dedup_hash, lifecycle_state,
    event_domain, organizer_id, primary_venue_id, virtual_url, image_url, public_url, keywords,
    confidence, quality_score, merged_into_id, deleted_at, deletion_reason, created_at, updated_at
"#;

const OCCURRENCE_COLUMNS: &str =
    "id, event_id, start_time, end_time, timezone, venue_id, virtual_url";

const SOURCE_COLUMNS: &str = "id, name, base_url, trust_level, license_url, license_type";

const TOMBSTONE_COLUMNS: &str =
    "id, event_id, event_uid, deleted_at, reason, superseded_by_uri, payload";

// Trust level assumed for sources that never declared one
const DEFAULT_TRUST_LEVEL: i32 = 5;

pub async fn get_event(conn: &mut PgConnection, id: i64) -> Result<Event, StoreError> {
    let query = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
    sqlx::query_as::<_, Event>(&query)
        .bind(id)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("get_event", e))
}

pub async fn get_event_by_uid(conn: &mut PgConnection, uid: Uuid) -> Result<Event, StoreError> {
    let query = format!("SELECT {EVENT_COLUMNS} FROM events WHERE uid = $1");
    sqlx::query_as::<_, Event>(&query)
        .bind(uid)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("get_event_by_uid", e))
}

// Deleted events only count when they were merged, since the caller follows
// the redirect to the surviving event.
pub async fn find_event_by_source(
    conn: &mut PgConnection,
    source_id: i64,
    source_event_id: &str,
) -> Result<Option<Event>, StoreError> {
    let query = format!(
        r#"
SELECT {EVENT_COLUMNS}
FROM events
WHERE id = (
    SELECT event_id FROM event_sources WHERE source_id = $1 AND source_event_id = $2
)
AND (lifecycle_state <> 'deleted' OR merged_into_id IS NOT NULL)
    "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(source_id)
        .bind(source_event_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_event_by_source", e))
}

pub async fn find_event_by_dedup_hash(
    conn: &mut PgConnection,
    hash: &str,
) -> Result<Option<Event>, StoreError> {
    let query = format!(
        r#"
SELECT {EVENT_COLUMNS}
FROM events
WHERE dedup_hash = $1
AND (lifecycle_state <> 'deleted' OR merged_into_id IS NOT NULL)
ORDER BY (lifecycle_state = 'deleted'), id DESC
LIMIT 1
    "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(hash)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_event_by_dedup_hash", e))
}

pub async fn create_event(conn: &mut PgConnection, event: NewEvent) -> Result<Event, StoreError> {
    let query = format!(
        r#"
INSERT INTO events (
    uid, name, description, license_url, license_status, dedup_hash, lifecycle_state,
    event_domain, organizer_id, primary_venue_id, virtual_url, image_url, public_url,
    keywords, confidence, quality_score
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
ON CONFLICT (dedup_hash) WHERE lifecycle_state <> 'deleted' DO NOTHING
RETURNING {EVENT_COLUMNS}
    "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(Uuid::now_v7())
        .bind(&event.name)
        .bind(&event.description)
        .bind(&event.license_url)
        .bind(&event.license_status)
        .bind(&event.dedup_hash)
        .bind(event.lifecycle_state)
        .bind(&event.event_domain)
        .bind(event.organizer_id)
        .bind(event.primary_venue_id)
        .bind(&event.virtual_url)
        .bind(&event.image_url)
        .bind(&event.public_url)
        .bind(&event.keywords)
        .bind(event.confidence)
        .bind(event.quality_score)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("create_event", e))?
        .ok_or_else(|| StoreError::unique("idx_events_live_dedup_hash"))
}

pub async fn create_occurrence(
    conn: &mut PgConnection,
    event_id: i64,
    occurrence: NewOccurrence,
) -> Result<Occurrence, StoreError> {
    let query = format!(
        r#"
INSERT INTO event_occurrences (event_id, start_time, end_time, timezone, venue_id, virtual_url)
VALUES ($1, $2, $3, $4, $5, $6)
RETURNING {OCCURRENCE_COLUMNS}
    "#
    );
    sqlx::query_as::<_, Occurrence>(&query)
        .bind(event_id)
        .bind(occurrence.start_time)
        .bind(occurrence.end_time)
        .bind(&occurrence.timezone)
        .bind(occurrence.venue_id)
        .bind(&occurrence.virtual_url)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("create_occurrence", e))
}

pub async fn list_occurrences(
    conn: &mut PgConnection,
    event_id: i64,
) -> Result<Vec<Occurrence>, StoreError> {
    let query = format!(
        "SELECT {OCCURRENCE_COLUMNS} FROM event_occurrences WHERE event_id = $1 ORDER BY start_time, id"
    );
    sqlx::query_as::<_, Occurrence>(&query)
        .bind(event_id)
        .fetch_all(conn)
        .await
        .map_err(|e| StoreError::query("list_occurrences", e))
}

pub async fn set_event_lifecycle(
    conn: &mut PgConnection,
    event_id: i64,
    state: LifecycleState,
) -> Result<Event, StoreError> {
    let query = format!(
        r#"
UPDATE events SET lifecycle_state = $2, updated_at = NOW()
WHERE id = $1
RETURNING {EVENT_COLUMNS}
    "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(event_id)
        .bind(state)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("set_event_lifecycle", e))
}

pub async fn update_event(
    conn: &mut PgConnection,
    event_id: i64,
    update: &EventUpdate,
) -> Result<Event, StoreError> {
    let query = format!(
        r#"
UPDATE events
SET description = COALESCE($2, description),
    image_url = COALESCE($3, image_url),
    public_url = COALESCE($4, public_url),
    event_domain = COALESCE($5, event_domain),
    keywords = COALESCE($6, keywords),
    updated_at = NOW()
WHERE id = $1
RETURNING {EVENT_COLUMNS}
    "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(event_id)
        .bind(&update.description)
        .bind(&update.image_url)
        .bind(&update.public_url)
        .bind(&update.event_domain)
        .bind(&update.keywords)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("update_event", e))
}

pub async fn soft_delete_event(
    conn: &mut PgConnection,
    event_id: i64,
    reason: &str,
    deleted_at: DateTime<Utc>,
) -> Result<Event, StoreError> {
    let query = format!(
        r#"
UPDATE events
SET lifecycle_state = 'deleted', deleted_at = $3, deletion_reason = $2, updated_at = NOW()
WHERE id = $1
RETURNING {EVENT_COLUMNS}
    "#
    );
    sqlx::query_as::<_, Event>(&query)
        .bind(event_id)
        .bind(reason)
        .bind(deleted_at)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("soft_delete_event", e))
}

pub async fn merge_events(
    conn: &mut PgConnection,
    duplicate_id: i64,
    primary_id: i64,
    merged_at: DateTime<Utc>,
) -> Result<Event, StoreError> {
    let filled = sqlx::query(
        r#"
UPDATE events p
SET
    description = COALESCE(p.description, d.description),
    image_url = COALESCE(p.image_url, d.image_url),
    public_url = COALESCE(p.public_url, d.public_url),
    organizer_id = COALESCE(p.organizer_id, d.organizer_id),
    primary_venue_id = COALESCE(p.primary_venue_id, d.primary_venue_id),
    virtual_url = COALESCE(p.virtual_url, d.virtual_url),
    keywords = CASE WHEN cardinality(p.keywords) = 0 THEN d.keywords ELSE p.keywords END,
    updated_at = NOW()
FROM events d
WHERE p.id = $2 AND d.id = $1
        "#,
    )
    .bind(duplicate_id)
    .bind(primary_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::query("merge_events_fill", e))?;

    if filled.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }

    sqlx::query("UPDATE event_sources SET event_id = $2, updated_at = NOW() WHERE event_id = $1")
        .bind(duplicate_id)
        .bind(primary_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::query("merge_events_sources", e))?;

    sqlx::query("UPDATE idempotency_keys SET event_id = $2 WHERE event_id = $1")
        .bind(duplicate_id)
        .bind(primary_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::query("merge_events_idempotency", e))?;

    sqlx::query(
        r#"
UPDATE events
SET merged_into_id = $2, lifecycle_state = 'deleted', deleted_at = $3,
    deletion_reason = 'duplicate_merged', updated_at = NOW()
WHERE id = $1
        "#,
    )
    .bind(duplicate_id)
    .bind(primary_id)
    .bind(merged_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::query("merge_events_retire", e))?;

    get_event(conn, primary_id).await
}

pub async fn find_near_duplicate_events(
    conn: &mut PgConnection,
    name: &str,
    venue_id: i64,
    start: DateTime<Utc>,
    threshold: f64,
) -> Result<Vec<DuplicateCandidate>, StoreError> {
    let rows = sqlx::query_as::<_, (i64, Uuid, String, f64)>(
        r#"
SELECT e.id, e.uid, e.name, similarity(e.name, $3)::float8 AS sim
FROM events e
WHERE e.lifecycle_state <> 'deleted'
  AND e.primary_venue_id = $1
  AND EXISTS (
      SELECT 1 FROM event_occurrences o
      WHERE o.event_id = e.id
        AND (o.start_time AT TIME ZONE 'UTC')::date = ($2::timestamptz AT TIME ZONE 'UTC')::date
  )
  AND similarity(e.name, $3) >= $4
ORDER BY sim DESC, e.id
LIMIT 5
        "#,
    )
    .bind(venue_id)
    .bind(start)
    .bind(name)
    .bind(threshold)
    .fetch_all(conn)
    .await
    .map_err(|e| StoreError::query("find_near_duplicate_events", e))?;

    Ok(rows
        .into_iter()
        .map(|(event_id, uid, name, similarity)| DuplicateCandidate {
            event_id,
            uid,
            name,
            similarity,
        })
        .collect())
}

pub async fn insert_not_duplicate(
    conn: &mut PgConnection,
    event_a: i64,
    event_b: i64,
    recorded_by: &str,
) -> Result<(), StoreError> {
    if event_a == event_b {
        return Ok(());
    }
    sqlx::query(
        r#"
INSERT INTO event_not_duplicates (event_id_a, event_id_b, recorded_by)
VALUES ($1, $2, $3)
ON CONFLICT DO NOTHING
        "#,
    )
    .bind(event_a.min(event_b))
    .bind(event_a.max(event_b))
    .bind(recorded_by)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("insert_not_duplicate", e))?;

    Ok(())
}

pub async fn is_not_duplicate(
    conn: &mut PgConnection,
    event_a: i64,
    event_b: i64,
) -> Result<bool, StoreError> {
    sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM event_not_duplicates WHERE event_id_a = $1 AND event_id_b = $2)",
    )
    .bind(event_a.min(event_b))
    .bind(event_a.max(event_b))
    .fetch_one(conn)
    .await
    .map_err(|e| StoreError::query("is_not_duplicate", e))
}

pub async fn get_or_create_source(
    conn: &mut PgConnection,
    source: NewSource,
) -> Result<Source, StoreError> {
    // The no-op update makes RETURNING yield the existing row on conflict
    let query = format!(
        r#"
INSERT INTO sources (name, base_url, trust_level, license_url, license_type)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (name, base_url) DO UPDATE SET name = EXCLUDED.name
RETURNING {SOURCE_COLUMNS}
    "#
    );
    sqlx::query_as::<_, Source>(&query)
        .bind(&source.name)
        .bind(&source.base_url)
        .bind(source.trust_level)
        .bind(&source.license_url)
        .bind(&source.license_type)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("get_or_create_source", e))
}

// A link held by a soft-deleted (not merged) event is handed over to the new event.
pub async fn create_event_source(
    conn: &mut PgConnection,
    link: NewEventSource,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        r#"
INSERT INTO event_sources (event_id, source_id, source_event_id, source_url, payload, payload_hash)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (source_id, source_event_id) DO UPDATE
SET event_id = EXCLUDED.event_id,
    source_url = EXCLUDED.source_url,
    payload = EXCLUDED.payload,
    payload_hash = EXCLUDED.payload_hash,
    updated_at = NOW()
WHERE EXISTS (
    SELECT 1 FROM events e
    WHERE e.id = event_sources.event_id
      AND e.lifecycle_state = 'deleted'
      AND e.merged_into_id IS NULL
)
        "#,
    )
    .bind(link.event_id)
    .bind(link.source_id)
    .bind(&link.source_event_id)
    .bind(&link.source_url)
    .bind(Json(&link.payload))
    .bind(&link.payload_hash)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("create_event_source", e))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::unique("event_sources_source_id_source_event_id_key"));
    }
    Ok(())
}

pub async fn get_source_trust_level(
    conn: &mut PgConnection,
    source_id: i64,
) -> Result<i32, StoreError> {
    sqlx::query_scalar::<_, i32>("SELECT trust_level FROM sources WHERE id = $1")
        .bind(source_id)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("get_source_trust_level", e))
}

pub async fn get_event_trust_level(
    conn: &mut PgConnection,
    event_id: i64,
) -> Result<i32, StoreError> {
    sqlx::query_scalar::<_, i32>(
        r#"
SELECT COALESCE(MAX(s.trust_level), $2)
FROM event_sources es
JOIN sources s ON s.id = es.source_id
WHERE es.event_id = $1
        "#,
    )
    .bind(event_id)
    .bind(DEFAULT_TRUST_LEVEL)
    .fetch_one(conn)
    .await
    .map_err(|e| StoreError::query("get_event_trust_level", e))
}

pub async fn create_tombstone(
    conn: &mut PgConnection,
    tombstone: NewTombstone,
) -> Result<Tombstone, StoreError> {
    let query = format!(
        r#"
INSERT INTO event_tombstones (event_id, event_uid, deleted_at, reason, superseded_by_uri, payload)
VALUES ($1, $2, $3, $4, $5, $6)
RETURNING {TOMBSTONE_COLUMNS}
    "#
    );
    sqlx::query_as::<_, Tombstone>(&query)
        .bind(tombstone.event_id)
        .bind(tombstone.event_uid)
        .bind(tombstone.deleted_at)
        .bind(&tombstone.reason)
        .bind(&tombstone.superseded_by_uri)
        .bind(Json(&tombstone.payload))
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("create_tombstone", e))
}

pub async fn latest_tombstone(
    conn: &mut PgConnection,
    event_id: i64,
) -> Result<Option<Tombstone>, StoreError> {
    let query = format!(
        r#"
SELECT {TOMBSTONE_COLUMNS}
FROM event_tombstones
WHERE event_id = $1
ORDER BY deleted_at DESC, id DESC
LIMIT 1
    "#
    );
    sqlx::query_as::<_, Tombstone>(&query)
        .bind(event_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("latest_tombstone", e))
}
