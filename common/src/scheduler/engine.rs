// Scheduler engine: add, update, remove and list scheduled work
//
// Validation (trigger, queue name) always happens before the backend is
// touched. Backend failures are wrapped with the queue, job and trigger they
// concern and are never retried here.

use crate::errors::{BackendError, SchedulerError, ValidationError};
use crate::models::{
    ConnectionTarget, JobIdentity, JobRequest, QueueSnapshot, ScheduleListing, TriggerKind,
};
use crate::queue::{Queue, QueueRegistry};
use crate::scheduler::clock::{Clock, SystemClock};
use crate::telemetry;
use crate::trigger::{self, ResolvedTrigger, SchedulePlan};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Scheduling operations exposed to the HTTP layer
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Create or replace the schedule for a job; returns its identity
    async fn add(
        &self,
        target: ConnectionTarget,
        request: JobRequest,
    ) -> Result<JobIdentity, SchedulerError>;

    /// Drop the entry at `existing_key`, then add `request`
    async fn update(
        &self,
        target: ConnectionTarget,
        existing_key: &str,
        request: JobRequest,
    ) -> Result<JobIdentity, SchedulerError>;

    /// Delete a scheduler entry. Returns whether it existed; a missing entry
    /// is not an error.
    async fn remove(
        &self,
        target: ConnectionTarget,
        queue_name: &str,
        key: &str,
    ) -> Result<bool, SchedulerError>;

    /// Items and live schedulers of every queue, reaping stale schedulers
    async fn list(&self, target: ConnectionTarget) -> Result<ScheduleListing, SchedulerError>;
}

pub struct SchedulerEngine {
    registry: Arc<QueueRegistry>,
    clock: Arc<dyn Clock>,
    timezone: Tz,
    last_stamp: AtomicI64,
}

impl SchedulerEngine {
    pub fn new(registry: Arc<QueueRegistry>, timezone: Tz) -> Self {
        Self::with_clock(registry, timezone, Arc::new(SystemClock))
    }

    pub fn with_clock(registry: Arc<QueueRegistry>, timezone: Tz, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            timezone,
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Strictly increasing millisecond stamp, at least `now_ms`
    fn stamp(&self, now_ms: i64) -> i64 {
        let mut last = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let next = now_ms.max(last.saturating_add(1));
            match self
                .last_stamp
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Resolve the request's trigger at the current instant
    fn resolve(&self, request: &JobRequest) -> Result<(ResolvedTrigger, i64), ValidationError> {
        let mut now = self.clock.now();
        if request.trigger.kind() == TriggerKind::Now {
            let stamped = self.stamp(now.timestamp_millis());
            now = Utc.timestamp_millis_opt(stamped).single().unwrap_or(now);
        }

        let resolved = trigger::resolve(
            &request.queue_name,
            &request.job_name,
            &request.trigger,
            now,
            self.timezone,
        )?;
        Ok((resolved, now.timestamp_millis()))
    }

    /// Validate the queue name without touching the backend
    fn check_queue(&self, name: &str) -> Result<(), ValidationError> {
        if self.registry.contains(name) {
            Ok(())
        } else {
            Err(ValidationError::UnknownQueue(name.to_string()))
        }
    }

    async fn submit(
        &self,
        queue: &Queue,
        request: &JobRequest,
        resolved: ResolvedTrigger,
        now_ms: i64,
    ) -> Result<JobIdentity, SchedulerError> {
        let ResolvedTrigger {
            identity,
            kind,
            plan,
        } = resolved;
        let failure = |operation: &'static str, source: BackendError| {
            backend_failure(operation, queue.name(), Some(request.job_name.as_str()), Some(kind), source)
        };

        match plan {
            SchedulePlan::Recurring(repeat) => {
                let payload = serde_json::to_value(request)
                    .map_err(|e| failure("upsert scheduler", e.into()))?;
                let next = queue
                    .upsert_scheduler(&identity, &repeat, &request.job_name, payload, now_ms)
                    .await
                    .map_err(|e| failure("upsert scheduler", e))?;
                info!(key = %identity, next = ?next, "Scheduler upserted");
            }
            SchedulePlan::Immediate => {
                let added = queue
                    .enqueue(&identity, &request.job_name, &request.job_data, now_ms)
                    .await
                    .map_err(|e| failure("enqueue job", e))?;
                info!(job_id = %identity, added, "Job enqueued");
            }
        }

        telemetry::record_job_submitted(queue.name(), kind.as_str());
        Ok(identity)
    }

    async fn snapshot(&self, queue: &Queue, now_ms: i64) -> Result<QueueSnapshot, SchedulerError> {
        let failure = |operation: &'static str, source: BackendError| {
            backend_failure(operation, queue.name(), None, None, source)
        };

        let jobs = queue.items().await.map_err(|e| failure("list jobs", e))?;
        let entries = queue
            .schedulers()
            .await
            .map_err(|e| failure("list schedulers", e))?;

        let mut schedulers = Vec::with_capacity(entries.len());
        let mut advanced = 0u64;
        let mut reaped = 0u64;
        for mut scheduler in entries {
            if !scheduler.is_stale(now_ms) {
                schedulers.push(scheduler);
                continue;
            }

            // A recurrence that can still fire is rolled forward; anything else is reaped
            let next = scheduler
                .recurrence()
                .and_then(|recurrence| trigger::next_firing(&recurrence, now_ms));
            match next {
                Some(next) => match queue.advance_scheduler(&scheduler.key, next).await {
                    Ok(true) => {
                        advanced += 1;
                        debug!(queue = %queue.name(), key = %scheduler.key, previous = ?scheduler.next, next, "Advanced scheduler");
                        scheduler.next = Some(next);
                        schedulers.push(scheduler);
                    }
                    Ok(false) => {
                        debug!(queue = %queue.name(), key = %scheduler.key, "Scheduler removed before it could be advanced");
                    }
                    Err(e) => {
                        telemetry::record_backend_failure("advance scheduler");
                        warn!(queue = %queue.name(), key = %scheduler.key, error = %e, "Failed to advance scheduler");
                    }
                },
                None => match queue.remove_scheduler(&scheduler.key).await {
                    Ok(_) => {
                        reaped += 1;
                        debug!(queue = %queue.name(), key = %scheduler.key, next = ?scheduler.next, "Reaped stale scheduler");
                    }
                    Err(e) => {
                        telemetry::record_backend_failure("reap scheduler");
                        warn!(queue = %queue.name(), key = %scheduler.key, error = %e, "Failed to reap stale scheduler");
                    }
                },
            }
        }
        if advanced > 0 {
            telemetry::record_schedulers_advanced(queue.name(), advanced);
        }
        if reaped > 0 {
            info!(queue = %queue.name(), reaped, "Reaped stale schedulers");
            telemetry::record_schedulers_reaped(queue.name(), reaped);
        }
        schedulers.sort_by(|a, b| {
            let a_next = a.next.unwrap_or(i64::MAX);
            let b_next = b.next.unwrap_or(i64::MAX);
            a_next.cmp(&b_next).then_with(|| a.key.cmp(&b.key))
        });

        Ok(QueueSnapshot { jobs, schedulers })
    }
}

fn backend_failure(
    operation: &'static str,
    queue: &str,
    job: Option<&str>,
    trigger: Option<TriggerKind>,
    source: BackendError,
) -> SchedulerError {
    telemetry::record_backend_failure(operation);
    error!(operation, queue = %queue, job = ?job, trigger = ?trigger, error = %source, "Queue backend call failed");
    SchedulerError::backend(operation, queue, job, trigger, source)
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(
        skip(self, request),
        fields(target = %target, queue = %request.queue_name, job = %request.job_name, trigger = %request.trigger.kind())
    )]
    async fn add(
        &self,
        target: ConnectionTarget,
        request: JobRequest,
    ) -> Result<JobIdentity, SchedulerError> {
        let (resolved, now_ms) = self.resolve(&request)?;
        self.check_queue(&request.queue_name)?;

        let queue = self.registry.queue(target, &request.queue_name).await?;
        self.submit(&queue, &request, resolved, now_ms).await
    }

    #[instrument(
        skip(self, request),
        fields(target = %target, key = %existing_key, queue = %request.queue_name, job = %request.job_name, trigger = %request.trigger.kind())
    )]
    async fn update(
        &self,
        target: ConnectionTarget,
        existing_key: &str,
        request: JobRequest,
    ) -> Result<JobIdentity, SchedulerError> {
        if request.trigger.kind() == TriggerKind::Now {
            return Err(ValidationError::UpdateNotAllowed(TriggerKind::Now).into());
        }
        let (resolved, now_ms) = self.resolve(&request)?;
        self.check_queue(&request.queue_name)?;

        let queue = self.registry.queue(target, &request.queue_name).await?;
        let existed = queue.remove_scheduler(existing_key).await.map_err(|e| {
            backend_failure(
                "remove scheduler",
                queue.name(),
                Some(request.job_name.as_str()),
                Some(resolved.kind),
                e,
            )
        })?;
        debug!(existed, "Removed previous scheduler");

        self.submit(&queue, &request, resolved, now_ms).await
    }

    #[instrument(skip(self), fields(target = %target))]
    async fn remove(
        &self,
        target: ConnectionTarget,
        queue_name: &str,
        key: &str,
    ) -> Result<bool, SchedulerError> {
        self.check_queue(queue_name)?;

        let queue = self.registry.queue(target, queue_name).await?;
        let existed = queue
            .remove_scheduler(key)
            .await
            .map_err(|e| backend_failure("remove scheduler", queue_name, None, None, e))?;

        if existed {
            info!("Scheduler removed");
            telemetry::record_scheduler_removed(queue_name);
        } else {
            debug!("Scheduler already absent");
        }
        Ok(existed)
    }

    #[instrument(skip(self), fields(target = %target))]
    async fn list(&self, target: ConnectionTarget) -> Result<ScheduleListing, SchedulerError> {
        let queues = self.registry.queues(target).await?;
        let now_ms = self.clock.now().timestamp_millis();

        let mut listing = BTreeMap::new();
        for (name, queue) in queues.iter() {
            listing.insert(name.clone(), self.snapshot(queue, now_ms).await?);
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{JobScheduler, Trigger};
    use crate::queue::{InMemoryProvider, InMemoryQueueBackend, QueueBackend};
    use crate::scheduler::clock::ManualClock;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    struct Fixture {
        engine: SchedulerEngine,
        backend: Arc<InMemoryQueueBackend>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryQueueBackend::new());
        let provider = Arc::new(InMemoryProvider::new(backend.clone()));
        let registry = Arc::new(QueueRegistry::new(Settings::default().queues, provider));
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = SchedulerEngine::with_clock(registry, Tz::UTC, clock.clone());
        Fixture {
            engine,
            backend,
            clock,
        }
    }

    fn request(queue: &str, job: &str, trigger: Trigger) -> JobRequest {
        JobRequest {
            queue_name: queue.to_string(),
            job_name: job.to_string(),
            job_data: json!({"userId": 7}),
            trigger,
        }
    }

    fn repeat(pattern: &str) -> Trigger {
        Trigger::Repeat(pattern.to_string())
    }

    #[tokio::test]
    async fn test_add_repeat_then_remove() {
        let f = fixture();
        let id = f
            .engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", repeat("*/5 * * * *")))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "testQueue:ping:repeat");

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let schedulers = &listing["testQueue"].schedulers;
        assert_eq!(schedulers.len(), 1);
        assert_eq!(schedulers[0].key, "testQueue:ping:repeat");
        assert_eq!(schedulers[0].pattern.as_deref(), Some("*/5 * * * *"));
        assert_eq!(schedulers[0].next, Some(NOW + 100_000));

        let existed = f
            .engine
            .remove(ConnectionTarget::Dev, "testQueue", "testQueue:ping:repeat")
            .await
            .unwrap();
        assert!(existed);

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        assert!(listing["testQueue"].schedulers.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_add_twice_upserts() {
        let f = fixture();
        f.engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", repeat("*/5 * * * *")))
            .await
            .unwrap();
        f.engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", repeat("0 * * * *")))
            .await
            .unwrap();

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let schedulers = &listing["testQueue"].schedulers;
        assert_eq!(schedulers.len(), 1);
        assert_eq!(schedulers[0].pattern.as_deref(), Some("0 * * * *"));
    }

    #[tokio::test]
    async fn test_delay_fires_once_then_is_reaped() {
        let f = fixture();
        f.engine
            .add(
                ConnectionTarget::Dev,
                request("testQueue", "once", Trigger::Delay(NOW + 60_000)),
            )
            .await
            .unwrap();

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let scheduler = &listing["testQueue"].schedulers[0];
        assert_eq!(scheduler.key, "testQueue:once:delay");
        assert_eq!(scheduler.next, Some(NOW + 60_000));
        assert_eq!(scheduler.limit, Some(1));

        f.clock.advance(60_001);
        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        assert!(listing["testQueue"].schedulers.is_empty());
        assert!(f.backend.list_schedulers("testQueue").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeat_is_rolled_forward_past_its_firing() {
        let f = fixture();
        f.engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", repeat("*/5 * * * *")))
            .await
            .unwrap();

        // First firing is NOW + 100s; move just past it
        f.clock.advance(100_001);
        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let schedulers = &listing["testQueue"].schedulers;
        assert_eq!(schedulers.len(), 1);
        assert_eq!(schedulers[0].next, Some(NOW + 400_000));

        let stored = f.backend.list_schedulers("testQueue").await.unwrap();
        assert_eq!(stored[0].next, Some(NOW + 400_000));

        // Several firings missed at once land on the next future boundary
        f.clock.advance(3_600_000);
        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let next = listing["testQueue"].schedulers[0].next.unwrap();
        assert!(next > NOW + 3_700_001);
        assert_eq!(next % 300_000, 0);
    }

    #[tokio::test]
    async fn test_ended_recurrence_is_reaped() {
        let f = fixture();
        f.backend
            .insert_scheduler(
                "testQueue",
                JobScheduler {
                    key: "testQueue:report:repeat".to_string(),
                    name: "report".to_string(),
                    next: Some(NOW - 60_000),
                    pattern: Some("* * * * *".to_string()),
                    every: None,
                    limit: None,
                    end_date: Some(NOW - 1),
                    tz: Some("UTC".to_string()),
                    template: None,
                },
            )
            .await;

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        assert!(listing["testQueue"].schedulers.is_empty());
        assert!(f.backend.list_schedulers("testQueue").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extreme_delay_rejected_before_backend() {
        let f = fixture();
        for instant in [i64::MIN, i64::MAX] {
            let err = f
                .engine
                .add(
                    ConnectionTarget::Dev,
                    request("testQueue", "late", Trigger::Delay(instant)),
                )
                .await
                .unwrap_err();
            assert!(err.is_client_error());
        }
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_past_delay_rejected_before_backend() {
        let f = fixture();
        let err = f
            .engine
            .add(
                ConnectionTarget::Dev,
                request("testQueue", "late", Trigger::Delay(NOW - 1)),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SchedulerError::Validation(ValidationError::DelayNotInFuture { .. })
        ));
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected_before_backend() {
        let f = fixture();
        let err = f
            .engine
            .add(ConnectionTarget::Dev, request("nope", "ping", Trigger::Now))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_now_jobs_never_collide() {
        let f = fixture();
        let a = f
            .engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", Trigger::Now))
            .await
            .unwrap();
        let b = f
            .engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", Trigger::Now))
            .await
            .unwrap();
        assert_ne!(a, b);

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let jobs = &listing["testQueue"].jobs;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.data == json!({"userId": 7})));
        let opts = jobs[0].opts.as_ref().unwrap();
        assert_eq!(opts.remove_on_complete.count, 100);
        assert_eq!(opts.remove_on_fail.age, 604_800);
    }

    #[tokio::test]
    async fn test_update_rejects_now() {
        let f = fixture();
        let err = f
            .engine
            .update(
                ConnectionTarget::Dev,
                "testQueue:ping:repeat",
                request("testQueue", "ping", Trigger::Now),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Validation(ValidationError::UpdateNotAllowed(TriggerKind::Now))
        ));
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_update_switches_trigger_type() {
        let f = fixture();
        f.engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", repeat("*/5 * * * *")))
            .await
            .unwrap();

        let id = f
            .engine
            .update(
                ConnectionTarget::Dev,
                "testQueue:ping:repeat",
                request("testQueue", "ping", Trigger::Delay(NOW + 5_000)),
            )
            .await
            .unwrap();
        assert_eq!(id.as_str(), "testQueue:ping:delay");

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let keys: Vec<_> = listing["testQueue"]
            .schedulers
            .iter()
            .map(|s| s.key.as_str())
            .collect();
        assert_eq!(keys, vec!["testQueue:ping:delay"]);
    }

    #[tokio::test]
    async fn test_remove_missing_key_is_ok() {
        let f = fixture();
        let existed = f
            .engine
            .remove(ConnectionTarget::Dev, "testQueue", "testQueue:ghost:repeat")
            .await
            .unwrap();
        assert!(!existed);
    }

    #[tokio::test]
    async fn test_list_reaps_only_past_entries() {
        let f = fixture();
        for (key, next) in [("past", Some(NOW - 1)), ("exact", Some(NOW)), ("never", None)] {
            f.backend
                .insert_scheduler(
                    "matchingQueue",
                    JobScheduler {
                        key: key.to_string(),
                        name: key.to_string(),
                        next,
                        pattern: None,
                        every: None,
                        limit: None,
                        end_date: None,
                        tz: None,
                        template: None,
                    },
                )
                .await;
        }

        let listing = f.engine.list(ConnectionTarget::Dev).await.unwrap();
        let mut keys: Vec<_> = listing["matchingQueue"]
            .schedulers
            .iter()
            .map(|s| s.key.clone())
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["exact", "never"]);

        let remaining = f.backend.list_schedulers("matchingQueue").await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn test_list_covers_every_queue() {
        let f = fixture();
        let listing = f.engine.list(ConnectionTarget::Prod).await.unwrap();
        let names: Vec<_> = listing.keys().cloned().collect();
        assert_eq!(names, vec!["matchingQueue", "notificationQueue", "testQueue"]);
    }

    #[tokio::test]
    async fn test_backend_failure_carries_context() {
        let f = fixture();
        f.backend.set_failure(Some("connection reset")).await;

        let err = f
            .engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", repeat("* * * * *")))
            .await
            .unwrap_err();
        match err {
            SchedulerError::Backend {
                operation,
                queue,
                job,
                trigger,
                ..
            } => {
                assert_eq!(operation, "upsert scheduler");
                assert_eq!(queue, "testQueue");
                assert_eq!(job.as_deref(), Some("ping"));
                assert_eq!(trigger, Some(TriggerKind::Repeat));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_repeat_template_carries_full_request() {
        let f = fixture();
        f.engine
            .add(ConnectionTarget::Dev, request("testQueue", "ping", repeat("* * * * *")))
            .await
            .unwrap();

        let schedulers = f.backend.list_schedulers("testQueue").await.unwrap();
        let template = schedulers[0].template.as_ref().unwrap();
        assert_eq!(template["name"], "ping");
        assert_eq!(template["data"]["queueName"], "testQueue");
        assert_eq!(template["data"]["trigger"]["type"], "repeat");
        assert_eq!(template["opts"]["removeOnComplete"]["count"], 100);
    }

    #[test]
    fn test_stamps_strictly_increase() {
        let f = fixture();
        let a = f.engine.stamp(NOW);
        let b = f.engine.stamp(NOW);
        let c = f.engine.stamp(NOW - 10);
        assert_eq!(a, NOW);
        assert!(b > a);
        assert!(c > b);
    }
}
