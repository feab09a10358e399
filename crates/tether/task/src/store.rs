//! Task status persistence.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{TaskError, TaskResult};

/// Tag of a task that is still making progress.
pub const STATUS_RUNNING: &str = "running";

/// Terminal tag of a task that failed.
pub const STATUS_FAILED: &str = "failed";

/// Stored state of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub message: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Whether the tag is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status == STATUS_FAILED
    }

    /// Whether the task looks abandoned: not terminal and not touched
    /// within `threshold` of `now`.
    pub fn is_stalled(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now - self.updated_at > threshold
    }
}

/// Opaque persistence for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create or replace the record's message and tag; refreshes the timestamp.
    async fn set(&self, id: &str, message: &str, status: &str) -> TaskResult<()>;

    /// Remove the record.
    async fn clear(&self, id: &str) -> TaskResult<()>;

    /// Advance the liveness timestamp.
    async fn touch(&self, id: &str) -> TaskResult<()>;

    /// Read the record.
    async fn get(&self, id: &str) -> TaskResult<Option<TaskRecord>>;
}

/// In-memory task store.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: DashMap<String, TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, in no particular order.
    pub fn records(&self) -> Vec<TaskRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn set(&self, id: &str, message: &str, status: &str) -> TaskResult<()> {
        let now = Utc::now();
        self.records
            .entry(id.to_string())
            .and_modify(|record| {
                record.message = message.to_string();
                record.status = status.to_string();
                record.updated_at = record.updated_at.max(now);
            })
            .or_insert_with(|| TaskRecord {
                id: id.to_string(),
                message: message.to_string(),
                status: status.to_string(),
                updated_at: now,
            });
        Ok(())
    }

    async fn clear(&self, id: &str) -> TaskResult<()> {
        self.records.remove(id);
        Ok(())
    }

    async fn touch(&self, id: &str) -> TaskResult<()> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        // Wall clocks can step backwards; the stored timestamp never does.
        record.updated_at = record.updated_at.max(Utc::now());
        Ok(())
    }

    async fn get(&self, id: &str) -> TaskResult<Option<TaskRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }
}
