//! Scheduler control plane. A single persisted document holds the enable
//! flag and cron expression; cycle work itself is handed to a task queue so
//! a crashed worker never loses the schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::repository::{KeyedStore, StoreError};

/// Fixed document id: the scheduler is a singleton
pub const SCHEDULER_ID: &str = "evolution-scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
}

impl TaskHandle {
    pub fn pending(name: &str) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: TaskStatus::Pending,
            submitted_at: Utc::now(),
        }
    }
}

/// Backing queue for scheduled work
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, name: &str, payload: serde_json::Value) -> Result<TaskHandle, String>;

    async fn status(&self, task_id: &str) -> Option<TaskStatus>;
}

/// Persisted scheduler document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub scheduler_id: String,
    pub enabled: bool,
    /// Stored verbatim; parsing is the queue runner's concern
    pub cron: String,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            scheduler_id: SCHEDULER_ID.to_string(),
            enabled: false,
            cron: "0 */6 * * *".to_string(),
            last_run: None,
            next_run: None,
            notes: Vec::new(),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn KeyedStore<SchedulerState>>,
    queue: Arc<dyn TaskQueue>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn KeyedStore<SchedulerState>>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// Current state, creating the singleton document on first touch
    pub async fn state(&self) -> SchedulerState {
        match self.store.get(SCHEDULER_ID).await {
            Some(state) => state,
            None => {
                let state = SchedulerState::default();
                self.store.put(SCHEDULER_ID, state.clone()).await;
                state
            }
        }
    }

    pub async fn enable(&self) -> Result<SchedulerState, StoreError> {
        self.mutate(|s| s.enabled = true).await
    }

    pub async fn disable(&self) -> Result<SchedulerState, StoreError> {
        self.mutate(|s| s.enabled = false).await
    }

    pub async fn update_cron(&self, cron: &str) -> Result<SchedulerState, StoreError> {
        let cron = cron.to_string();
        self.mutate(move |s| s.cron = cron).await
    }

    pub async fn record_run(&self, at: DateTime<Utc>) -> Result<SchedulerState, StoreError> {
        self.mutate(move |s| {
            s.last_run = Some(at);
            s.notes.push(format!("cycle run at {}", at.to_rfc3339()));
        })
        .await
    }

    /// Submit one evolution cycle if the scheduler is enabled. Returns None
    /// when disabled.
    pub async fn trigger(&self) -> Result<Option<TaskHandle>, String> {
        let state = self.state().await;
        if !state.enabled {
            info!("scheduler disabled, skipping trigger");
            return Ok(None);
        }
        let handle = self
            .queue
            .submit("evolution-cycle", serde_json::json!({ "cron": state.cron }))
            .await?;
        self.record_run(Utc::now())
            .await
            .map_err(|e| e.to_string())?;
        info!(task_id = %handle.task_id, "cycle submitted");
        Ok(Some(handle))
    }

    async fn mutate<F>(&self, apply: F) -> Result<SchedulerState, StoreError>
    where
        F: FnOnce(&mut SchedulerState) + Send + 'static,
    {
        // Ensure the singleton exists before the atomic update
        self.state().await;
        self.store
            .update(
                SCHEDULER_ID,
                Box::new(move |s| {
                    apply(s);
                    Ok(())
                }),
            )
            .await
    }
}
