// Modules are private and the public API is re-exported below, so internals can move around freely

// Types
mod input;
pub use input::EventBatch;
pub use input::EventInput;
pub use input::OccurrenceInput;
pub use input::OrganizationInput;
pub use input::PlaceInput;
pub use input::SourceInput;
pub use input::VirtualLocationInput;

mod types;
pub use types::DuplicateCandidate;
pub use types::Enrichment;
pub use types::Event;
pub use types::EventUpdate;
pub use types::IdempotencyRecord;
pub use types::LifecycleState;
pub use types::Occurrence;
pub use types::OrganizationRecord;
pub use types::PlaceRecord;
pub use types::ReviewCounts;
pub use types::ReviewEntry;
pub use types::ReviewStatus;
pub use types::ReviewWarning;
pub use types::Source;
pub use types::Tombstone;
pub use types::WarningCode;

// Errors
mod error;
// Errors surfaced to callers of the pipeline: validation, conflicts, rejected resubmissions
pub use error::IngestError;
// Errors from a storage backend: missing rows, constraint violations, postgres failures
pub use error::StoreError;
pub use error::TaskError;

// Config
mod config;
pub use config::IngestConfig;
pub use config::PoolConfig;
pub use config::RetentionConfig;

// Storage
mod repository;
pub use repository::Repository;
pub use repository::Transaction;

mod pg;
pub use pg::run_migrations;
pub use pg::PgRepository;

mod memory;
pub use memory::MemoryRepository;

// Pipeline stages
mod fingerprint;
mod lifecycle;
mod normalize;
mod validation;
pub use fingerprint::dedup_hash;
pub use lifecycle::Assessment;
pub use normalize::normalize_name;

mod identity;
pub use identity::DuplicateKind;

mod idempotency;
pub use idempotency::IdempotencyLedger;

mod entities;
pub use entities::EntityMatch;
pub use entities::EntityResolver;
pub use entities::Resolved;

mod review;
pub use review::ReviewQueue;
pub use review::RetentionResult;

mod ingest;
pub use ingest::BatchItemOutcome;
pub use ingest::BatchSummary;
pub use ingest::IngestResult;
pub use ingest::IngestService;

// Follow-up work
mod tasks;
pub use tasks::EntityKind;
pub use tasks::FollowUpTask;
pub use tasks::MatchConfidence;
pub use tasks::MemoryTaskQueue;
pub use tasks::PgTaskQueue;
pub use tasks::RetryPolicy;
pub use tasks::Task;
pub use tasks::TaskQueue;
pub use tasks::TaskStatus;

mod enrichment;
pub use enrichment::EnrichmentService;
pub use enrichment::Reconciliation;

mod metrics_consts;
