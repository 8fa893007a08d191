use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    Enrichment, NewOrganization, NewPlace, OrganizationRecord, PlaceRecord, SimilarEntity,
};

pub const PLACES: &str = "places";
pub const ORGANIZATIONS: &str = "organizations";

// Candidates returned by a similarity search
const SIMILAR_LIMIT: i64 = 5;

const PLACE_COLUMNS: &str = r#"
    id, uid, name, normalized_name, locality, region, country, street_address, postal_code,
    latitude, longitude, description, same_as, merged_into_id
"#;

const ORGANIZATION_COLUMNS: &str = r#"
    id, uid, name, normalized_name, locality, region, url, email, description, same_as,
    merged_into_id
"#;

pub async fn get_place(conn: &mut PgConnection, id: i64) -> Result<PlaceRecord, StoreError> {
    let query = format!("SELECT {PLACE_COLUMNS} FROM places WHERE id = $1");
    sqlx::query_as::<_, PlaceRecord>(&query)
        .bind(id)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("get_place", e))
}

pub async fn find_place_by_uid(
    conn: &mut PgConnection,
    uid: Uuid,
) -> Result<Option<PlaceRecord>, StoreError> {
    let query = format!("SELECT {PLACE_COLUMNS} FROM places WHERE uid = $1");
    sqlx::query_as::<_, PlaceRecord>(&query)
        .bind(uid)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_place_by_uid", e))
}

pub async fn find_place_exact(
    conn: &mut PgConnection,
    normalized_name: &str,
    locality: &str,
    region: &str,
) -> Result<Option<PlaceRecord>, StoreError> {
    let query = format!(
        r#"
SELECT {PLACE_COLUMNS}
FROM places
WHERE normalized_name = $1 AND locality = $2 AND region = $3 AND merged_into_id IS NULL
    "#
    );
    sqlx::query_as::<_, PlaceRecord>(&query)
        .bind(normalized_name)
        .bind(locality)
        .bind(region)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_place_exact", e))
}

/// Trigram search over live records of `table` in the same locality and region.
pub async fn find_similar(
    conn: &mut PgConnection,
    table: &str,
    normalized_name: &str,
    locality: &str,
    region: &str,
    threshold: f64,
) -> Result<Vec<SimilarEntity>, StoreError> {
    let query = format!(
        r#"
SELECT id, uid, name, similarity(normalized_name, $1)::float8 AS score
FROM {table}
WHERE locality = $2
  AND region = $3
  AND merged_into_id IS NULL
  AND similarity(normalized_name, $1) >= $4
ORDER BY score DESC, id
LIMIT $5
    "#
    );
    sqlx::query_as::<_, SimilarEntity>(&query)
        .bind(normalized_name)
        .bind(locality)
        .bind(region)
        .bind(threshold)
        .bind(SIMILAR_LIMIT)
        .fetch_all(conn)
        .await
        .map_err(|e| StoreError::query("find_similar", e))
}

pub async fn insert_place(
    conn: &mut PgConnection,
    place: NewPlace,
) -> Result<Option<PlaceRecord>, StoreError> {
    let query = format!(
        r#"
INSERT INTO places (
    uid, name, normalized_name, locality, region, country, street_address, postal_code,
    latitude, longitude
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (normalized_name, locality, region) WHERE merged_into_id IS NULL DO NOTHING
RETURNING {PLACE_COLUMNS}
    "#
    );
    sqlx::query_as::<_, PlaceRecord>(&query)
        .bind(Uuid::now_v7())
        .bind(&place.name)
        .bind(&place.normalized_name)
        .bind(&place.locality)
        .bind(&place.region)
        .bind(&place.country)
        .bind(&place.street_address)
        .bind(&place.postal_code)
        .bind(place.latitude)
        .bind(place.longitude)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("insert_place", e))
}

pub async fn merge_places(
    conn: &mut PgConnection,
    duplicate_id: i64,
    primary_id: i64,
) -> Result<(), StoreError> {
    let filled = sqlx::query(
        r#"
UPDATE places p
SET
    country = COALESCE(p.country, d.country),
    street_address = COALESCE(p.street_address, d.street_address),
    postal_code = COALESCE(p.postal_code, d.postal_code),
    latitude = COALESCE(p.latitude, d.latitude),
    longitude = COALESCE(p.longitude, d.longitude),
    description = COALESCE(p.description, d.description),
    same_as = COALESCE(p.same_as, d.same_as),
    updated_at = NOW()
FROM places d
WHERE p.id = $2 AND d.id = $1
        "#,
    )
    .bind(duplicate_id)
    .bind(primary_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::query("merge_places_fill", e))?;

    if filled.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }

    sqlx::query("UPDATE events SET primary_venue_id = $2, updated_at = NOW() WHERE primary_venue_id = $1")
        .bind(duplicate_id)
        .bind(primary_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::query("merge_places_events", e))?;

    sqlx::query("UPDATE event_occurrences SET venue_id = $2 WHERE venue_id = $1")
        .bind(duplicate_id)
        .bind(primary_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::query("merge_places_occurrences", e))?;

    // Earlier redirects to the duplicate now point at the primary too
    sqlx::query(
        "UPDATE places SET merged_into_id = $2, updated_at = NOW() WHERE id = $1 OR merged_into_id = $1",
    )
    .bind(duplicate_id)
    .bind(primary_id)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("merge_places_redirect", e))?;

    Ok(())
}

pub async fn backfill_place_coordinates(
    conn: &mut PgConnection,
    id: i64,
    latitude: f64,
    longitude: f64,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
UPDATE places SET latitude = $2, longitude = $3, updated_at = NOW()
WHERE id = $1 AND (latitude IS NULL OR longitude IS NULL)
        "#,
    )
    .bind(id)
    .bind(latitude)
    .bind(longitude)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("backfill_place_coordinates", e))?;

    Ok(result.rows_affected() > 0)
}

pub async fn enrich_place(
    conn: &mut PgConnection,
    id: i64,
    enrichment: &Enrichment,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
UPDATE places
SET description = COALESCE(description, $2),
    same_as = COALESCE(same_as, $3),
    street_address = COALESCE(street_address, $4),
    updated_at = NOW()
WHERE id = $1
  AND (
      (description IS NULL AND $2::text IS NOT NULL)
      OR (same_as IS NULL AND $3::text IS NOT NULL)
      OR (street_address IS NULL AND $4::text IS NOT NULL)
  )
        "#,
    )
    .bind(id)
    .bind(&enrichment.description)
    .bind(&enrichment.same_as)
    .bind(&enrichment.street_address)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("enrich_place", e))?;

    Ok(result.rows_affected() > 0)
}

pub async fn get_organization(
    conn: &mut PgConnection,
    id: i64,
) -> Result<OrganizationRecord, StoreError> {
    let query = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = $1");
    sqlx::query_as::<_, OrganizationRecord>(&query)
        .bind(id)
        .fetch_one(conn)
        .await
        .map_err(|e| StoreError::query("get_organization", e))
}

pub async fn find_organization_by_uid(
    conn: &mut PgConnection,
    uid: Uuid,
) -> Result<Option<OrganizationRecord>, StoreError> {
    let query = format!("SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE uid = $1");
    sqlx::query_as::<_, OrganizationRecord>(&query)
        .bind(uid)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_organization_by_uid", e))
}

pub async fn find_organization_exact(
    conn: &mut PgConnection,
    normalized_name: &str,
    locality: &str,
    region: &str,
) -> Result<Option<OrganizationRecord>, StoreError> {
    let query = format!(
        r#"
SELECT {ORGANIZATION_COLUMNS}
FROM organizations
WHERE normalized_name = $1 AND locality = $2 AND region = $3 AND merged_into_id IS NULL
    "#
    );
    sqlx::query_as::<_, OrganizationRecord>(&query)
        .bind(normalized_name)
        .bind(locality)
        .bind(region)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("find_organization_exact", e))
}

pub async fn insert_organization(
    conn: &mut PgConnection,
    organization: NewOrganization,
) -> Result<Option<OrganizationRecord>, StoreError> {
    let query = format!(
        r#"
INSERT INTO organizations (uid, name, normalized_name, locality, region, url, email)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (normalized_name, locality, region) WHERE merged_into_id IS NULL DO NOTHING
RETURNING {ORGANIZATION_COLUMNS}
    "#
    );
    sqlx::query_as::<_, OrganizationRecord>(&query)
        .bind(Uuid::now_v7())
        .bind(&organization.name)
        .bind(&organization.normalized_name)
        .bind(&organization.locality)
        .bind(&organization.region)
        .bind(&organization.url)
        .bind(&organization.email)
        .fetch_optional(conn)
        .await
        .map_err(|e| StoreError::query("insert_organization", e))
}

pub async fn merge_organizations(
    conn: &mut PgConnection,
    duplicate_id: i64,
    primary_id: i64,
) -> Result<(), StoreError> {
    let filled = sqlx::query(
        r#"
UPDATE organizations p
SET
    url = COALESCE(p.url, d.url),
    email = COALESCE(p.email, d.email),
    description = COALESCE(p.description, d.description),
    same_as = COALESCE(p.same_as, d.same_as),
    updated_at = NOW()
FROM organizations d
WHERE p.id = $2 AND d.id = $1
        "#,
    )
    .bind(duplicate_id)
    .bind(primary_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| StoreError::query("merge_organizations_fill", e))?;

    if filled.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }

    sqlx::query("UPDATE events SET organizer_id = $2, updated_at = NOW() WHERE organizer_id = $1")
        .bind(duplicate_id)
        .bind(primary_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| StoreError::query("merge_organizations_events", e))?;

    sqlx::query(
        "UPDATE organizations SET merged_into_id = $2, updated_at = NOW() WHERE id = $1 OR merged_into_id = $1",
    )
    .bind(duplicate_id)
    .bind(primary_id)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("merge_organizations_redirect", e))?;

    Ok(())
}

pub async fn enrich_organization(
    conn: &mut PgConnection,
    id: i64,
    enrichment: &Enrichment,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
UPDATE organizations
SET description = COALESCE(description, $2),
    same_as = COALESCE(same_as, $3),
    url = COALESCE(url, $4),
    updated_at = NOW()
WHERE id = $1
  AND (
      (description IS NULL AND $2::text IS NOT NULL)
      OR (same_as IS NULL AND $3::text IS NOT NULL)
      OR (url IS NULL AND $4::text IS NOT NULL)
  )
        "#,
    )
    .bind(id)
    .bind(&enrichment.description)
    .bind(&enrichment.same_as)
    .bind(&enrichment.url)
    .execute(conn)
    .await
    .map_err(|e| StoreError::query("enrich_organization", e))?;

    Ok(result.rows_affected() > 0)
}
