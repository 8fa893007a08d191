use std::path::PathBuf;
use std::sync::Arc;

use catalog_core::{
    IdempotencyLedger, IngestConfig, MemoryRepository, MemoryTaskQueue, PgRepository,
    PgTaskQueue, PoolConfig, Repository, RetentionConfig, ReviewQueue, ReviewStatus, TaskQueue,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use tracing::info;
use uuid::Uuid;

use crate::{ingest, review::ReviewCommand};

#[derive(Parser)]
#[command(version, about = "Operate the event catalog", long_about = None)]
pub struct Cli {
    /// Postgres connection string for the catalog database
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Base for public event URIs written into tombstones
    #[arg(long, env = "PUBLIC_BASE_URL", global = true)]
    public_base_url: Option<String>,

    /// IANA zone for occurrences that carry none
    #[arg(long, env = "DEFAULT_TIMEZONE", global = true)]
    default_timezone: Option<String>,

    /// Send listings without an image to review
    #[arg(long, env = "REQUIRE_IMAGE", global = true, default_value = "false")]
    require_image: bool,

    #[arg(long, env = "PLACE_SIMILARITY_THRESHOLD", global = true)]
    place_similarity_threshold: Option<f64>,

    /// Zero disables near-duplicate detection
    #[arg(long, env = "NEAR_DUPLICATE_THRESHOLD", global = true)]
    near_duplicate_threshold: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Submit a JSON file holding a single event or a `{"events": [...]}` batch
    Ingest {
        file: PathBuf,

        /// Replays with the same key return the original result. Single events only
        #[arg(long)]
        idempotency_key: Option<String>,

        /// Run against an empty in-memory catalog and print what would happen
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },

    /// Work the moderation queue
    Review {
        #[command(subcommand)]
        cmd: ReviewCommand,
    },

    /// Apply review retention and expire idempotency keys
    Sweep,
}

impl Cli {
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        let config = cli.ingest_config();

        match cli.command {
            Commands::Migrate => {
                let repo = connect(cli.database_url.as_deref()).await?;
                repo.run_migrations().await?;
                info!("migrations applied");
            }
            Commands::Ingest {
                file,
                idempotency_key,
                dry_run,
            } => {
                let repo: Arc<dyn Repository>;
                let tasks: Arc<dyn TaskQueue>;
                if dry_run {
                    repo = Arc::new(MemoryRepository::new());
                    tasks = Arc::new(MemoryTaskQueue::new());
                } else {
                    let pg = connect(cli.database_url.as_deref()).await?;
                    tasks = Arc::new(PgTaskQueue::new(pg.pool().clone()));
                    repo = Arc::new(pg);
                }
                let contents = std::fs::read_to_string(&file)?;
                let output =
                    ingest::run(repo, tasks, config, &contents, idempotency_key.as_deref())
                        .await?;
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Commands::Review { cmd } => {
                let repo = connect(cli.database_url.as_deref()).await?;
                let queue = ReviewQueue::new(Arc::new(repo), config, RetentionConfig::default());
                cmd.run(&queue).await?;
            }
            Commands::Sweep => {
                let repo: Arc<dyn Repository> =
                    Arc::new(connect(cli.database_url.as_deref()).await?);
                let queue = ReviewQueue::new(repo.clone(), config, RetentionConfig::default());
                let now = Utc::now();
                let retention = queue.sweep_retention(now).await?;
                let expired_keys = IdempotencyLedger::new(repo).sweep_expired(now).await?;
                let pending = queue.counts().await?.pending;
                println!(
                    "rejected deleted: {}, expired pending: {}, reviewed deleted: {}, idempotency keys deleted: {}, still pending: {}",
                    retention.rejected_deleted,
                    retention.expired_pending,
                    retention.reviewed_deleted,
                    expired_keys,
                    pending
                );
            }
        }

        Ok(())
    }
}

impl Cli {
    fn ingest_config(&self) -> IngestConfig {
        let mut config = IngestConfig {
            require_image: self.require_image,
            ..IngestConfig::default()
        };
        if let Some(base) = &self.public_base_url {
            config.public_base_url = base.clone();
        }
        if let Some(timezone) = &self.default_timezone {
            config.default_timezone = timezone.clone();
        }
        if let Some(threshold) = self.place_similarity_threshold {
            config.place_similarity_threshold = threshold;
        }
        if let Some(threshold) = self.near_duplicate_threshold {
            config.near_duplicate_threshold = threshold;
        }
        config
    }
}

async fn connect(database_url: Option<&str>) -> Result<PgRepository> {
    let db_url = database_url.ok_or_else(|| eyre!("--database-url or DATABASE_URL is required"))?;
    let repo = PgRepository::new(PoolConfig {
        db_url: db_url.to_owned(),
        max_connections: Some(2),
        min_connections: Some(1),
        acquire_timeout_seconds: None,
        max_lifetime_seconds: None,
        idle_timeout_seconds: None,
    })
    .await?;
    Ok(repo)
}

pub(crate) fn parse_status(value: &str) -> Result<ReviewStatus, String> {
    value.parse()
}

pub(crate) fn parse_uid(value: &str) -> Result<Uuid, String> {
    Uuid::parse_str(value).map_err(|e| format!("{value} is not a valid event id: {e}"))
}
