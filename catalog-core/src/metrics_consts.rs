pub const INGEST_ATTEMPT: &str = "catalog_ingest_attempt";
// Labeled with the outcome: created, review, duplicate or failed
pub const INGEST_OUTCOME: &str = "catalog_ingest_outcome";
pub const INGEST_DUPLICATES: &str = "catalog_ingest_duplicates";
pub const INGEST_CONFLICT_RETRIES: &str = "catalog_ingest_conflict_retries";
pub const INGEST_TIME: &str = "catalog_ingest_ms";
pub const INGEST_BATCH_SIZE: &str = "catalog_ingest_batch_size";

pub const ENTITY_RESOLVED: &str = "catalog_entity_resolved";

pub const REVIEW_TRANSITIONS: &str = "catalog_review_transitions";
pub const REVIEW_FLAGGED: &str = "catalog_review_flagged";

pub const TASK_ENQUEUED: &str = "catalog_task_enqueued";
pub const TASK_ENQUEUE_FAILED: &str = "catalog_task_enqueue_failed";
