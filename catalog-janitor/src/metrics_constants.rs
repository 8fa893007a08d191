pub const RUN_STARTS: &str = "catalog_janitor_run_starts";
pub const RUN_TIME: &str = "catalog_janitor_total_run_ms";
pub const RUN_ENDS: &str = "catalog_janitor_run_ends";
pub const RUN_FAILURES: &str = "catalog_janitor_run_failures";

pub const REVIEW_SWEEP_TIME: &str = "catalog_janitor_review_sweep_ms";
pub const REJECTED_DELETED: &str = "catalog_janitor_rejected_reviews_deleted";
pub const PENDING_EXPIRED: &str = "catalog_janitor_pending_reviews_expired";
pub const REVIEWED_DELETED: &str = "catalog_janitor_reviewed_entries_deleted";

pub const IDEMPOTENCY_SWEEP_TIME: &str = "catalog_janitor_idempotency_sweep_ms";
pub const IDEMPOTENCY_DELETED: &str = "catalog_janitor_idempotency_keys_deleted";

// Moderation backlog depth
pub const PENDING_REVIEWS: &str = "catalog_pending_reviews";
