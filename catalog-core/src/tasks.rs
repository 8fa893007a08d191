use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::TaskError;

/// Which kind of entity a reconciliation or enrichment task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Place,
    Organization,
}

/// Work handed to collaborators once an ingestion has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FollowUpTask {
    GeocodePlace {
        place_id: i64,
        event_id: i64,
    },
    ReconcileEntity {
        entity: EntityKind,
        entity_id: i64,
    },
    EnrichEntity {
        entity: EntityKind,
        entity_id: i64,
        same_as: String,
    },
}

impl FollowUpTask {
    pub fn kind(&self) -> &'static str {
        match self {
            FollowUpTask::GeocodePlace { .. } => "geocode_place",
            FollowUpTask::ReconcileEntity { .. } => "reconcile_entity",
            FollowUpTask::EnrichEntity { .. } => "enrich_entity",
        }
    }
}

/// How far a knowledge-graph match can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchConfidence {
    /// Safe to enrich without a human.
    AutoHigh,
    /// Recorded but not applied.
    AutoLow,
    Reject,
}

pub const AUTO_HIGH_THRESHOLD: f64 = 0.95;
pub const AUTO_LOW_THRESHOLD: f64 = 0.80;

pub fn classify_confidence(score: f64, exact: bool) -> MatchConfidence {
    if score >= AUTO_HIGH_THRESHOLD && exact {
        MatchConfidence::AutoHigh
    } else if score >= AUTO_LOW_THRESHOLD {
        MatchConfidence::AutoLow
    } else {
        MatchConfidence::Reject
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: FollowUpTask) -> Result<(), TaskError>;
}

#[derive(Copy, Clone, Debug)]
/// Determines when a failed task becomes available again.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(10),
            maximum_interval: Some(time::Duration::from_secs(60 * 60)),
        }
    }
}

/// Enumeration of possible statuses for a follow-up task.
/// Available: waiting to be picked up, possibly scheduled in the future.
/// Running: picked up by a worker.
/// Completed and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
pub enum TaskStatus {
    Available,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, sqlx::FromRow)]
pub struct Task {
    pub id: i64,
    pub kind: String,
    pub status: TaskStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub parameters: sqlx::types::Json<FollowUpTask>,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A task queue on top of the `catalog_tasks` table.
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
    max_attempts: i32,
    retry_policy: RetryPolicy,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: 5,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy, max_attempts: i32) -> Self {
        self.retry_policy = retry_policy;
        self.max_attempts = max_attempts;
        self
    }

    /// Claims the oldest due task, if any. Concurrent workers never claim the same row.
    pub async fn dequeue(&self) -> Result<Option<Task>, TaskError> {
        sqlx::query_as::<_, Task>(
            r#"
WITH available_in_queue AS (
    SELECT
        id
    FROM
        catalog_tasks
    WHERE
        status = 'available'
        AND scheduled_at <= NOW()
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    catalog_tasks
SET
    started_at = NOW(),
    status = 'running'::task_status,
    attempt = catalog_tasks.attempt + 1
FROM
    available_in_queue
WHERE
    catalog_tasks.id = available_in_queue.id
RETURNING
    catalog_tasks.*
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| TaskError::Query {
            command: "UPDATE".to_owned(),
            error,
        })
    }

    pub async fn complete(&self, task_id: i64) -> Result<(), TaskError> {
        sqlx::query(
            r#"
UPDATE catalog_tasks
SET status = 'completed'::task_status, finished_at = NOW()
WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|error| TaskError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;
        Ok(())
    }

    /// Schedules a retry with backoff, or marks the task failed once it ran out of attempts.
    pub async fn fail(&self, task: &Task, error: &str) -> Result<TaskStatus, TaskError> {
        if task.attempt >= task.max_attempts {
            sqlx::query(
                r#"
UPDATE catalog_tasks
SET status = 'failed'::task_status, finished_at = NOW(), last_error = $2
WHERE id = $1
                "#,
            )
            .bind(task.id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|error| TaskError::Query {
                command: "UPDATE".to_owned(),
                error,
            })?;
            return Ok(TaskStatus::Failed);
        }

        let attempt = u32::try_from(task.attempt).unwrap_or(0);
        let backoff = self.retry_policy.time_until_next_retry(attempt.saturating_sub(1));
        sqlx::query(
            r#"
UPDATE catalog_tasks
SET status = 'available'::task_status,
    scheduled_at = NOW() + make_interval(secs => $2),
    last_error = $3
WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(backoff.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|error| TaskError::Query {
            command: "UPDATE".to_owned(),
            error,
        })?;
        Ok(TaskStatus::Available)
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: FollowUpTask) -> Result<(), TaskError> {
        sqlx::query(
            r#"
INSERT INTO catalog_tasks
    (kind, status, attempt, max_attempts, parameters, scheduled_at, created_at)
VALUES
    ($1, 'available'::task_status, 0, $2, $3, NOW(), NOW())
            "#,
        )
        .bind(task.kind())
        .bind(self.max_attempts)
        .bind(sqlx::types::Json(&task))
        .execute(&self.pool)
        .await
        .map_err(|error| TaskError::Query {
            command: "INSERT".to_owned(),
            error,
        })?;
        Ok(())
    }
}

/// Records enqueued tasks in memory. Can be told to fail every enqueue.
#[derive(Clone, Default)]
pub struct MemoryTaskQueue {
    tasks: Arc<Mutex<Vec<FollowUpTask>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn recorded(&self) -> Vec<FollowUpTask> {
        self.tasks.lock().await.clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: FollowUpTask) -> Result<(), TaskError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TaskError::Unavailable("memory queue set to fail".to_owned()));
        }
        self.tasks.lock().await.push(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_confidence() {
        assert_eq!(classify_confidence(0.97, true), MatchConfidence::AutoHigh);
        assert_eq!(classify_confidence(0.97, false), MatchConfidence::AutoLow);
        assert_eq!(classify_confidence(0.95, true), MatchConfidence::AutoHigh);
        assert_eq!(classify_confidence(0.85, true), MatchConfidence::AutoLow);
        assert_eq!(classify_confidence(0.80, false), MatchConfidence::AutoLow);
        assert_eq!(classify_confidence(0.79, true), MatchConfidence::Reject);
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(10),
            Some(time::Duration::from_secs(60)),
        );
        assert_eq!(policy.time_until_next_retry(0), time::Duration::from_secs(10));
        assert_eq!(policy.time_until_next_retry(1), time::Duration::from_secs(20));
        assert_eq!(policy.time_until_next_retry(2), time::Duration::from_secs(40));
        assert_eq!(policy.time_until_next_retry(3), time::Duration::from_secs(60));
        assert_eq!(policy.time_until_next_retry(30), time::Duration::from_secs(60));
    }

    #[test]
    fn test_task_parameters_are_tagged() {
        let task = FollowUpTask::GeocodePlace {
            place_id: 3,
            event_id: 9,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["kind"], "geocode_place");
        assert_eq!(value["place_id"], 3);

        let task = FollowUpTask::ReconcileEntity {
            entity: EntityKind::Organization,
            entity_id: 1,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["entity"], "organization");
        assert_eq!(task.kind(), value["kind"]);
    }

    #[tokio::test]
    async fn test_memory_queue_records_and_fails() {
        let queue = MemoryTaskQueue::new();
        let task = FollowUpTask::ReconcileEntity {
            entity: EntityKind::Place,
            entity_id: 1,
        };
        queue.enqueue(task.clone()).await.unwrap();

        queue.set_failing(true);
        assert!(queue.enqueue(task.clone()).await.is_err());
        assert_eq!(queue.recorded().await, vec![task]);
    }
}
