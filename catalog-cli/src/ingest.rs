use std::sync::Arc;

use catalog_core::{
    BatchItemOutcome, EventBatch, EventInput, IngestConfig, IngestService, Repository, TaskQueue,
};
use eyre::{bail, Result};
use serde_json::Value;
use tracing::info;

#[derive(Debug)]
pub enum Submission {
    Single(EventInput),
    Batch(Vec<EventInput>),
}

/// A file holds either one event object or `{"events": [...]}`.
pub fn parse_submission(contents: &str) -> Result<Submission> {
    let value: Value = serde_json::from_str(contents)?;
    match &value {
        Value::Object(fields) if fields.contains_key("events") => {
            let batch: EventBatch = serde_json::from_value(value)?;
            Ok(Submission::Batch(batch.events))
        }
        Value::Object(_) => Ok(Submission::Single(serde_json::from_value(value)?)),
        _ => bail!("expected a JSON object"),
    }
}

pub async fn run(
    repo: Arc<dyn Repository>,
    tasks: Arc<dyn TaskQueue>,
    config: IngestConfig,
    contents: &str,
    idempotency_key: Option<&str>,
) -> Result<Value> {
    let service = IngestService::new(repo, tasks, config);

    match parse_submission(contents)? {
        Submission::Single(input) => {
            let result = service.ingest(input, idempotency_key).await?;
            info!(event = %result.event.uid, outcome = result.outcome(), "ingested event");
            Ok(serde_json::to_value(BatchItemOutcome::from(result))?)
        }
        Submission::Batch(items) => {
            if idempotency_key.is_some() {
                bail!("idempotency keys apply to single events only");
            }
            let summary = service.ingest_batch(items).await;
            Ok(serde_json::to_value(summary)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use catalog_core::{MemoryRepository, MemoryTaskQueue};

    use super::*;

    const EVENT: &str = r#"{
        "name": "Jazz Night",
        "description": "Trio on the main stage",
        "startDate": "2027-06-01T20:00:00Z",
        "location": {"name": "The Rex", "addressLocality": "Toronto", "addressRegion": "ON"}
    }"#;

    fn memory() -> (Arc<dyn Repository>, Arc<dyn TaskQueue>) {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let tasks: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::new());
        (repo, tasks)
    }

    #[test]
    fn test_parse_single_and_batch() {
        let single = parse_submission(EVENT).unwrap();
        assert!(matches!(single, Submission::Single(ref e) if e.name == "Jazz Night"));

        let batch = parse_submission(&format!(r#"{{"events": [{EVENT}, {EVENT}]}}"#)).unwrap();
        assert!(matches!(batch, Submission::Batch(ref items) if items.len() == 2));

        assert!(parse_submission("[]").is_err());
        assert!(parse_submission("not json").is_err());
    }

    #[tokio::test]
    async fn test_dry_run_batch_reports_duplicates() {
        let (repo, tasks) = memory();
        let contents = format!(r#"{{"events": [{EVENT}]}}"#);
        let first = run(repo.clone(), tasks.clone(), IngestConfig::default(), &contents, None)
            .await
            .unwrap();
        assert_eq!(first["created"], 1);
        assert_eq!(first["items"][0]["outcome"], "created");

        let replay = run(repo, tasks, IngestConfig::default(), &contents, None)
            .await
            .unwrap();
        assert_eq!(replay["duplicates"], 1);
    }

    #[tokio::test]
    async fn test_batch_refuses_idempotency_key() {
        let (repo, tasks) = memory();
        let contents = format!(r#"{{"events": [{EVENT}]}}"#);
        let err = run(repo, tasks, IngestConfig::default(), &contents, Some("req-1")).await;
        assert!(err.is_err());
    }
}
