use catalog_core::{ReviewEntry, ReviewQueue, ReviewStatus};
use clap::Subcommand;
use eyre::Result;
use uuid::Uuid;

use crate::commands::{parse_status, parse_uid};

#[derive(Subcommand)]
pub enum ReviewCommand {
    /// List entries, oldest first
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<ReviewStatus>,

        #[arg(long, default_value = "50")]
        limit: i64,

        /// Continue after this entry id
        #[arg(long)]
        after: Option<i64>,
    },

    /// Entry totals per status
    Counts,

    /// Publish the event
    Approve {
        id: i64,

        #[arg(long, env = "CATALOG_REVIEWER")]
        reviewer: String,

        #[arg(long)]
        notes: Option<String>,

        /// Remember flagged candidates as distinct events
        #[arg(long, default_value = "false")]
        not_duplicates: bool,
    },

    /// Delete the event. The reason is shown to anyone who resubmits it
    Reject {
        id: i64,

        #[arg(long, env = "CATALOG_REVIEWER")]
        reviewer: String,

        #[arg(long)]
        reason: String,
    },

    /// Fold the event into an existing one
    Merge {
        id: i64,

        #[arg(long, env = "CATALOG_REVIEWER")]
        reviewer: String,

        /// Public id of the event to keep
        #[arg(long, value_parser = parse_uid)]
        into: Uuid,
    },

    /// Check a published event for near-duplicates and queue it if any are found
    Scan {
        #[arg(value_parser = parse_uid)]
        event: Uuid,
    },
}

impl ReviewCommand {
    pub async fn run(self, queue: &ReviewQueue) -> Result<()> {
        match self {
            ReviewCommand::List {
                status,
                limit,
                after,
            } => {
                for entry in queue.list(status, limit, after).await? {
                    println!("{}", describe(&entry));
                }
            }
            ReviewCommand::Counts => {
                println!("{}", serde_json::to_string_pretty(&queue.counts().await?)?);
            }
            ReviewCommand::Approve {
                id,
                reviewer,
                notes,
                not_duplicates,
            } => {
                let entry = queue.approve(id, &reviewer, notes, not_duplicates).await?;
                println!("{}", describe(&entry));
            }
            ReviewCommand::Reject {
                id,
                reviewer,
                reason,
            } => {
                let entry = queue.reject(id, &reviewer, &reason).await?;
                println!("{}", describe(&entry));
            }
            ReviewCommand::Merge { id, reviewer, into } => {
                let entry = queue.merge(id, &reviewer, into).await?;
                println!("{}", describe(&entry));
            }
            ReviewCommand::Scan { event } => match queue.scan_near_duplicates(event).await? {
                Some(entry) => println!("{}", describe(&entry)),
                None => println!("no near-duplicates found for {event}"),
            },
        }
        Ok(())
    }
}

fn describe(entry: &ReviewEntry) -> String {
    let codes: Vec<&str> = entry.warning_codes().iter().map(|c| c.as_str()).collect();
    format!(
        "{}\t{}\tevent={}\tstarts={}\twarnings={}",
        entry.id,
        entry.status,
        entry.event_id,
        entry.event_start.to_rfc3339(),
        codes.join(",")
    )
}

