// Durable queue backend primitives

use crate::errors::BackendError;
use crate::models::{JobOptions, JobScheduler, JobTemplate, RepeatOptions, WorkItem};
use async_trait::async_trait;
use serde_json::Value;

/// Primitives the scheduling core needs from a queue backend.
///
/// One backend instance serves every queue of a connection; calls name the
/// queue they act on.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create or replace the scheduler entry `key`, recomputing its next
    /// firing from `repeat` at `now_ms`. Returns the stored next firing.
    async fn upsert_scheduler(
        &self,
        queue: &str,
        key: &str,
        repeat: &RepeatOptions,
        template: &JobTemplate,
        now_ms: i64,
    ) -> Result<Option<i64>, BackendError>;

    /// Delete the scheduler entry `key`. Returns false when it did not exist.
    async fn remove_scheduler(&self, queue: &str, key: &str) -> Result<bool, BackendError>;

    /// Move an existing entry's next firing to `next_ms`. Returns false,
    /// writing nothing, when the entry no longer exists.
    async fn advance_scheduler(&self, queue: &str, key: &str, next_ms: i64) -> Result<bool, BackendError>;

    /// Every scheduler entry of `queue`, ordered by next firing
    async fn list_schedulers(&self, queue: &str) -> Result<Vec<JobScheduler>, BackendError>;

    /// Pending and recently finished work items of `queue`
    async fn list_items(&self, queue: &str) -> Result<Vec<WorkItem>, BackendError>;

    /// Put one work item on the wait list. A no-op returning false when an
    /// item with the same id already exists.
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        data: &Value,
        opts: &JobOptions,
        now_ms: i64,
    ) -> Result<bool, BackendError>;
}
