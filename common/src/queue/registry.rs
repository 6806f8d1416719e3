// Queue registry: the fixed set of named queues bound to a target's connection

use crate::config::QueuesConfig;
use crate::errors::{BackendError, ConnectionError, SchedulerError, ValidationError};
use crate::models::{
    ConnectionTarget, JobIdentity, JobOptions, JobScheduler, JobTemplate, RepeatOptions,
    RetentionPolicy, WorkItem,
};
use crate::queue::backend::QueueBackend;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// A backend bound to one connection generation of a target
#[derive(Clone)]
pub struct BoundBackend {
    pub generation: u64,
    pub backend: Arc<dyn QueueBackend>,
}

/// Source of queue backends per target
#[async_trait]
pub trait BackendProvider: Send + Sync {
    async fn bind(&self, target: ConnectionTarget) -> Result<BoundBackend, ConnectionError>;
}

/// Named logical queue with its retention policy
#[derive(Clone)]
pub struct Queue {
    name: String,
    retention: RetentionPolicy,
    backend: Arc<dyn QueueBackend>,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Options every work item of this queue carries
    pub fn job_options(&self, identity: Option<&JobIdentity>) -> JobOptions {
        JobOptions::from_retention(&self.retention, identity)
    }

    pub async fn upsert_scheduler(
        &self,
        identity: &JobIdentity,
        repeat: &RepeatOptions,
        job_name: &str,
        payload: Value,
        now_ms: i64,
    ) -> Result<Option<i64>, BackendError> {
        let template = JobTemplate {
            name: job_name.to_string(),
            data: payload,
            opts: self.job_options(None),
        };
        self.backend
            .upsert_scheduler(&self.name, identity.as_str(), repeat, &template, now_ms)
            .await
    }

    pub async fn remove_scheduler(&self, key: &str) -> Result<bool, BackendError> {
        self.backend.remove_scheduler(&self.name, key).await
    }

    pub async fn advance_scheduler(&self, key: &str, next_ms: i64) -> Result<bool, BackendError> {
        self.backend.advance_scheduler(&self.name, key, next_ms).await
    }

    pub async fn schedulers(&self) -> Result<Vec<JobScheduler>, BackendError> {
        self.backend.list_schedulers(&self.name).await
    }

    pub async fn items(&self) -> Result<Vec<WorkItem>, BackendError> {
        self.backend.list_items(&self.name).await
    }

    pub async fn enqueue(
        &self,
        identity: &JobIdentity,
        job_name: &str,
        data: &Value,
        now_ms: i64,
    ) -> Result<bool, BackendError> {
        let opts = self.job_options(Some(identity));
        self.backend
            .enqueue(&self.name, job_name, data, &opts, now_ms)
            .await
    }
}

/// Queues of one target, keyed by name
pub type QueueSet = BTreeMap<String, Queue>;

struct CachedQueues {
    generation: u64,
    queues: Arc<QueueSet>,
}

/// Exposes the configured queues per target, rebuilt only when the
/// underlying connection changes
pub struct QueueRegistry {
    config: QueuesConfig,
    provider: Arc<dyn BackendProvider>,
    cache: Mutex<HashMap<ConnectionTarget, CachedQueues>>,
}

impl QueueRegistry {
    pub fn new(config: QueuesConfig, provider: Arc<dyn BackendProvider>) -> Self {
        Self {
            config,
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Configured queue names in registration order
    pub fn names(&self) -> &[String] {
        &self.config.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.config.names.iter().any(|n| n == name)
    }

    /// Every queue bound to a ready connection for `target`
    pub async fn queues(&self, target: ConnectionTarget) -> Result<Arc<QueueSet>, ConnectionError> {
        let bound = self.provider.bind(target).await?;

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.get(&target) {
            if cached.generation == bound.generation {
                return Ok(cached.queues.clone());
            }
        }

        debug!(target = %target, generation = bound.generation, "Binding queues");
        let queues: QueueSet = self
            .config
            .names
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    Queue {
                        name: name.clone(),
                        retention: self.config.retention,
                        backend: bound.backend.clone(),
                    },
                )
            })
            .collect();
        let queues = Arc::new(queues);
        cache.insert(
            target,
            CachedQueues {
                generation: bound.generation,
                queues: queues.clone(),
            },
        );

        Ok(queues)
    }

    /// One queue by name. Unknown names are rejected before any I/O.
    pub async fn queue(&self, target: ConnectionTarget, name: &str) -> Result<Queue, SchedulerError> {
        if !self.contains(name) {
            return Err(ValidationError::UnknownQueue(name.to_string()).into());
        }

        let queues = self.queues(target).await?;
        queues
            .get(name)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownQueue(name.to_string()).into())
    }
}
