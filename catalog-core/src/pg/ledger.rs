use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::StoreError;
use crate::types::IdempotencyRecord;

pub async fn get_idempotency_key(
    conn: &mut PgConnection,
    key: &str,
    fresh_after: DateTime<Utc>,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    sqlx::query_as::<_, IdempotencyRecord>(
        r#"
SELECT key, request_hash, event_id, created_at
FROM idempotency_keys
WHERE key = $1 AND created_at >= $2
        "#,
    )
    .bind(key)
    .bind(fresh_after)
    .fetch_optional(conn)
    .await
    .map_err(|e| StoreError::query("get_idempotency_key", e))
}

// An expired row is overwritten in place, a fresh one is left untouched and
// reported as a uniqueness violation.
pub async fn insert_idempotency_key(
    conn: &mut PgConnection,
    key: &str,
    request_hash: &str,
    event_id: i64,
    fresh_after: DateTime<Utc>,
) -> Result<IdempotencyRecord, StoreError> {
    sqlx::query_as::<_, IdempotencyRecord>(
        r#"
INSERT INTO idempotency_keys (key, request_hash, event_id, created_at)
VALUES ($1, $2, $3, NOW())
ON CONFLICT (key) DO UPDATE
SET request_hash = EXCLUDED.request_hash,
    event_id = EXCLUDED.event_id,
    created_at = EXCLUDED.created_at
WHERE idempotency_keys.created_at < $4
RETURNING key, request_hash, event_id, created_at
        "#,
    )
    .bind(key)
    .bind(request_hash)
    .bind(event_id)
    .bind(fresh_after)
    .fetch_optional(conn)
    .await
    .map_err(|e| StoreError::query("insert_idempotency_key", e))?
    .ok_or_else(|| StoreError::unique("idempotency_keys_pkey"))
}

pub async fn delete_idempotency_keys_before(
    conn: &mut PgConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM idempotency_keys WHERE created_at < $1")
        .bind(cutoff)
        .execute(conn)
        .await
        .map_err(|e| StoreError::query("delete_idempotency_keys_before", e))?;

    Ok(result.rows_affected())
}
