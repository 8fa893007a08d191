use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgConnection;

use crate::error::StoreError;
use crate::types::{
    NewReviewEntry, ReviewCounts, ReviewDecision, ReviewEntry, ReviewStatus, ReviewWarning,
};

const REVIEW_COLUMNS: &str = r#"
    id, event_id, status, warnings, source_id, source_external_id, dedup_hash, event_start,
    event_end, reviewed_by, reviewed_at, review_notes, rejection_reason, merged_into_id,
    created_at, updated_at
"#;

pub async fn create_review_entry(
    conn: &mut PgConnection,
    entry: NewReviewEntry,
) -> Result<ReviewEntry, StoreError> {
    let query = format!(
        r#"
INSERT INTO event_review_queue (
    event_id, status, warnings, source_id, source_external_id, dedup_hash, event_start, event_end
)
VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7)
ON CONFLICT (event_id) WHERE status = 'pending' DO NOTHING
RETURNING {REVIEW_COLUMNS}
    "#
    );
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(entry.event_id)
        .bind(Json(&entry.warnings))
        .bind(entry.source_id)
        .bind(&entry.source_external_id)
        .bind(&entry.dedup_hash)
        .bind(entry.event_start)
        .bind(entry.event_end)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("create_review_entry", e))?
        .ok_or_else(|| StoreError::unique("idx_review_queue_pending_event"))
}

pub async fn supersede_review_entries(
    conn: &mut PgConnection,
    event_id: i64,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
UPDATE event_review_queue SET status = 'superseded', updated_at = NOW()
WHERE event_id = $1 AND status IN ('approved', 'merged')
        "#,
    )
    .bind(event_id)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("supersede_review_entries", e))?;

    Ok(result.rows_affected())
}

pub async fn get_review_entry(conn: &mut PgConnection, id: i64) -> Result<ReviewEntry, StoreError> {
    let query = format!("SELECT {REVIEW_COLUMNS} FROM event_review_queue WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(id)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("get_review_entry", e))
}

pub async fn find_pending_review(
    conn: &mut PgConnection,
    event_id: i64,
) -> Result<Option<ReviewEntry>, StoreError> {
    let query = format!(
        "SELECT {REVIEW_COLUMNS} FROM event_review_queue WHERE event_id = $1 AND status = 'pending' FOR UPDATE"
    );
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(event_id)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_pending_review", e))
}

pub async fn find_rejected_review(
    conn: &mut PgConnection,
    source: Option<(i64, &str)>,
    dedup_hash: &str,
) -> Result<Option<ReviewEntry>, StoreError> {
    let (source_id, source_external_id) = source.unzip();
    let query = format!(
        r#"
SELECT {REVIEW_COLUMNS}
FROM event_review_queue
WHERE status = 'rejected'
  AND ((source_id = $1::bigint AND source_external_id = $2::text) OR dedup_hash = $3)
ORDER BY reviewed_at DESC NULLS LAST, id DESC
LIMIT 1
    "#
    );
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(source_id)
        .bind(source_external_id)
        .bind(dedup_hash)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_rejected_review", e))
}

pub async fn list_review_entries(
    conn: &mut PgConnection,
    status: Option<ReviewStatus>,
    limit: i64,
    after_id: Option<i64>,
) -> Result<Vec<ReviewEntry>, StoreError> {
    let query = format!(
        r#"
SELECT {REVIEW_COLUMNS}
FROM event_review_queue
WHERE ($1::review_status IS NULL OR status = $1)
  AND ($2::bigint IS NULL OR id > $2)
ORDER BY id
LIMIT $3
    "#
    );
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(status)
        .bind(after_id)
        .bind(limit)
        .fetch_all(conn)
        .await
        .map_err(|e| StoreError::query("list_review_entries", e))
}

pub async fn count_review_entries(conn: &mut PgConnection) -> Result<ReviewCounts, StoreError> {
    let rows = sqlx::query_as::<_, (ReviewStatus, i64)>(
        "SELECT status, COUNT(*) FROM event_review_queue GROUP BY status",
    )
    .fetch_all(conn)
    .await
    .map_err(|e| StoreError::query("count_review_entries", e))?;

    let mut counts = ReviewCounts::default();
    for (status, count) in rows {
        counts.add(status, count as u64);
    }
    Ok(counts)
}

pub async fn decide_review_entry(
    conn: &mut PgConnection,
    id: i64,
    decision: ReviewDecision,
) -> Result<ReviewEntry, StoreError> {
    let query = format!(
        r#"
UPDATE event_review_queue
SET status = $2,
    reviewed_by = $3,
    reviewed_at = $4,
    review_notes = $5,
    rejection_reason = $6,
    merged_into_id = $7,
    updated_at = NOW()
WHERE id = $1
RETURNING {REVIEW_COLUMNS}
    "#
    );
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(id)
        .bind(decision.status)
        .bind(&decision.reviewer)
        .bind(decision.reviewed_at)
        .bind(&decision.notes)
        .bind(&decision.rejection_reason)
        .bind(decision.merged_into_id)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("decide_review_entry", e))
}

pub async fn update_review_warnings(
    conn: &mut PgConnection,
    id: i64,
    warnings: &[ReviewWarning],
) -> Result<ReviewEntry, StoreError> {
    let query = format!(
        r#"
UPDATE event_review_queue SET warnings = $2, updated_at = NOW()
WHERE id = $1 AND status = 'pending'
RETURNING {REVIEW_COLUMNS}
    "#
    );
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(id)
        .bind(Json(warnings))
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("update_review_warnings", e))?
        .ok_or(StoreError::NotFound)
}

pub async fn delete_review_entry(conn: &mut PgConnection, id: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM event_review_queue WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await
        .map_err(|e| StoreError::query("delete_review_entry", e))?;

    Ok(())
}

pub async fn delete_rejected_reviews_before(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
DELETE FROM event_review_queue
WHERE status = 'rejected' AND COALESCE(event_end, event_start) < $1
        "#,
    )
    .bind(cutoff)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("delete_rejected_reviews_before", e))?;

    Ok(result.rows_affected())
}

pub async fn list_expired_pending_reviews(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
) -> Result<Vec<ReviewEntry>, StoreError> {
    let query = format!(
        r#"
SELECT {REVIEW_COLUMNS}
FROM event_review_queue
WHERE status = 'pending' AND event_start < $1
ORDER BY id
FOR UPDATE SKIP LOCKED
    "#
    );
    sqlx::query_as::<_, ReviewEntry>(&query)
        .bind(now)
        .fetch_all(conn)
        .await
        .map_err(|e| StoreError::query("list_expired_pending_reviews", e))
}

pub async fn delete_reviewed_before(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
DELETE FROM event_review_queue
WHERE status IN ('approved', 'merged', 'superseded') AND reviewed_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("delete_reviewed_before", e))?;

    Ok(result.rows_affected())
}
