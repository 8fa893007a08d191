use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::error;

use crate::janitor::{CleanupResult, Janitor};

pub struct AppContext {
    pub janitor: Janitor,
    pub state: AppState,
    pub metrics: bool,
}

impl AppContext {
    pub fn new(janitor: Janitor, metrics: bool) -> Self {
        let state = AppState::new(janitor.settings.cleanup_interval);
        Self {
            janitor,
            state,
            metrics,
        }
    }

    pub async fn cleanup_loop(&self) {
        loop {
            let next_run = Utc::now() + self.state.cleanup_interval;
            let mut status = self.state.get_status().await;
            match self.janitor.run_once(Utc::now()).await {
                Ok(result) => {
                    status.last_result = Some(result);
                    status.last_successful_run = Some(Utc::now());
                }
                Err(e) => {
                    error!("janitor failed cleanup with: {}", e);
                    status.last_error = Some(e.to_string());
                    status.last_error_time = Some(Utc::now());
                }
            }
            status.next_run = Some(next_run);
            self.state.set_status(status).await;

            let sleep_time = next_run - Utc::now();
            tokio::time::sleep(sleep_time.to_std().unwrap_or_default()).await;
        }
    }
}

// Shared between the cleanup loop and the http handlers
#[derive(Debug)]
pub struct AppState {
    status: Mutex<JanitorStatus>,
    cleanup_interval: Duration,
    started_at: DateTime<Utc>,
}

// Displayed on the status endpoint
#[derive(Debug, Clone, Serialize, Default)]
pub struct JanitorStatus {
    pub last_result: Option<CleanupResult>,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_successful_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn new(cleanup_interval: Duration) -> Self {
        Self {
            status: Mutex::new(JanitorStatus::default()),
            cleanup_interval,
            started_at: Utc::now(),
        }
    }

    pub async fn get_status(&self) -> JanitorStatus {
        self.status.lock().await.clone()
    }

    pub async fn set_status(&self, status: JanitorStatus) {
        *self.status.lock().await = status;
    }

    /// Alive while the last successful run, or startup, is less than four
    /// cleanup intervals old.
    pub async fn is_alive(&self, now: DateTime<Utc>) -> bool {
        let last = self
            .status
            .lock()
            .await
            .last_successful_run
            .unwrap_or(self.started_at);
        now - last < self.cleanup_interval * 4
    }
}
