// In-process queue backend for tests and local development

use crate::errors::{BackendError, ConnectionError};
use crate::models::{
    ConnectionTarget, ItemState, JobOptions, JobScheduler, JobTemplate, RepeatOptions, WorkItem,
};
use crate::queue::backend::QueueBackend;
use crate::queue::registry::{BackendProvider, BoundBackend};
use crate::trigger::next_firing;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct MemoryQueue {
    schedulers: HashMap<String, JobScheduler>,
    items: Vec<WorkItem>,
}

/// Queue backend holding everything in memory
#[derive(Default)]
pub struct InMemoryQueueBackend {
    queues: RwLock<HashMap<String, MemoryQueue>>,
    calls: AtomicUsize,
    failing: RwLock<Option<String>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backend calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Store a scheduler entry as-is, bypassing next-firing computation
    pub async fn insert_scheduler(&self, queue: &str, scheduler: JobScheduler) {
        self.queues
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .schedulers
            .insert(scheduler.key.clone(), scheduler);
    }

    /// Fail every subsequent call with `reason`; `None` restores normal operation
    pub async fn set_failure(&self, reason: Option<&str>) {
        *self.failing.write().await = reason.map(str::to_string);
    }

    async fn begin(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failing.read().await.as_ref() {
            Some(reason) => Err(BackendError::CommandFailed(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn upsert_scheduler(
        &self,
        queue: &str,
        key: &str,
        repeat: &RepeatOptions,
        template: &JobTemplate,
        now_ms: i64,
    ) -> Result<Option<i64>, BackendError> {
        self.begin().await?;

        let next = next_firing(repeat, now_ms);
        let scheduler = JobScheduler {
            key: key.to_string(),
            name: template.name.clone(),
            next,
            pattern: repeat.pattern.clone(),
            every: repeat.every,
            limit: repeat.limit,
            end_date: repeat.end_date,
            tz: repeat.tz.clone(),
            template: Some(serde_json::to_value(template)?),
        };

        self.queues
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .schedulers
            .insert(key.to_string(), scheduler);

        Ok(next)
    }

    async fn remove_scheduler(&self, queue: &str, key: &str) -> Result<bool, BackendError> {
        self.begin().await?;

        let mut queues = self.queues.write().await;
        Ok(queues
            .get_mut(queue)
            .and_then(|q| q.schedulers.remove(key))
            .is_some())
    }

    async fn advance_scheduler(&self, queue: &str, key: &str, next_ms: i64) -> Result<bool, BackendError> {
        self.begin().await?;

        let mut queues = self.queues.write().await;
        match queues.get_mut(queue).and_then(|q| q.schedulers.get_mut(key)) {
            Some(scheduler) => {
                scheduler.next = Some(next_ms);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_schedulers(&self, queue: &str) -> Result<Vec<JobScheduler>, BackendError> {
        self.begin().await?;

        let queues = self.queues.read().await;
        let mut schedulers: Vec<JobScheduler> = queues
            .get(queue)
            .map(|q| q.schedulers.values().cloned().collect())
            .unwrap_or_default();
        schedulers.sort_by(|a, b| {
            let a_next = a.next.unwrap_or(i64::MAX);
            let b_next = b.next.unwrap_or(i64::MAX);
            a_next.cmp(&b_next).then_with(|| a.key.cmp(&b.key))
        });
        Ok(schedulers)
    }

    async fn list_items(&self, queue: &str) -> Result<Vec<WorkItem>, BackendError> {
        self.begin().await?;

        let queues = self.queues.read().await;
        Ok(queues.get(queue).map(|q| q.items.clone()).unwrap_or_default())
    }

    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        data: &Value,
        opts: &JobOptions,
        now_ms: i64,
    ) -> Result<bool, BackendError> {
        self.begin().await?;

        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut queues = self.queues.write().await;
        let entry = queues.entry(queue.to_string()).or_default();
        if entry.items.iter().any(|item| item.id == id) {
            return Ok(false);
        }

        // Newest first, like a left-pushed wait list
        entry.items.insert(
            0,
            WorkItem {
                id,
                name: name.to_string(),
                data: data.clone(),
                state: ItemState::Waiting,
                timestamp: now_ms,
                opts: Some(opts.clone()),
            },
        );
        Ok(true)
    }
}

/// Hands out one shared in-memory backend for every target
pub struct InMemoryProvider {
    backend: Arc<InMemoryQueueBackend>,
}

impl InMemoryProvider {
    pub fn new(backend: Arc<InMemoryQueueBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<InMemoryQueueBackend> {
        self.backend.clone()
    }
}

#[async_trait]
impl BackendProvider for InMemoryProvider {
    async fn bind(&self, _target: ConnectionTarget) -> Result<BoundBackend, ConnectionError> {
        Ok(BoundBackend {
            generation: 0,
            backend: self.backend.clone(),
        })
    }
}
