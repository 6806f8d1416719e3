// Redis-backed queue backend using the bull key layout
//
// Per queue, under `{prefix}:{queue}`:
//   :repeat          sorted set, member = scheduler key, score = next firing ms
//   :repeat:{key}    hash describing one scheduler entry
//   :wait, :active   lists of job ids
//   :delayed, :completed, :failed   sorted sets of job ids
//   :{jobId}         hash describing one job

use crate::connection::ConnectionManager;
use crate::errors::{BackendError, ConnectionError};
use crate::models::{
    ConnectionTarget, ItemState, JobOptions, JobScheduler, JobTemplate, RepeatOptions, WorkItem,
};
use crate::queue::backend::QueueBackend;
use crate::queue::registry::{BackendProvider, BoundBackend};
use crate::trigger::next_firing;
use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnection;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Score used for entries that will never fire again
const NEVER: i64 = i64::MAX;

const ENQUEUE_SCRIPT: &str = r#"
    if redis.call("exists", KEYS[1]) == 1 then
        return 0
    end
    redis.call("hset", KEYS[1], "name", ARGV[2], "data", ARGV[3], "opts", ARGV[4], "timestamp", ARGV[5])
    redis.call("lpush", KEYS[2], ARGV[1])
    return 1
"#;

const REMOVE_SCHEDULER_SCRIPT: &str = r#"
    local removed = redis.call("zrem", KEYS[1], ARGV[1])
    local deleted = redis.call("del", KEYS[2])
    if removed + deleted > 0 then
        return 1
    end
    return 0
"#;

// No-op when the entry's hash is gone
const ADVANCE_SCHEDULER_SCRIPT: &str = r#"
    if redis.call("exists", KEYS[2]) == 0 then
        return 0
    end
    redis.call("hset", KEYS[2], "next", ARGV[2])
    redis.call("zadd", KEYS[1], ARGV[2], ARGV[1])
    return 1
"#;

/// Queue backend speaking to one store connection
#[derive(Clone)]
pub struct RedisQueueBackend {
    conn: RedisConnection,
    prefix: String,
}

impl RedisQueueBackend {
    pub fn new(conn: RedisConnection, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn scheduler_key(&self, queue: &str, key: &str) -> String {
        format!("{}:{}:repeat:{}", self.prefix, queue, key)
    }

    async fn item_ids(&self, queue: &str) -> Result<Vec<(String, ItemState)>, BackendError> {
        let mut conn = self.conn.clone();
        let (waiting, active, delayed, completed, failed): (
            Vec<String>,
            Vec<String>,
            Vec<String>,
            Vec<String>,
            Vec<String>,
        ) = redis::pipe()
            .lrange(self.key(queue, "wait"), 0, -1)
            .lrange(self.key(queue, "active"), 0, -1)
            .zrange(self.key(queue, "delayed"), 0, -1)
            .zrevrange(self.key(queue, "completed"), 0, -1)
            .zrevrange(self.key(queue, "failed"), 0, -1)
            .query_async(&mut conn)
            .await?;

        let tagged = |ids: Vec<String>, state: ItemState| ids.into_iter().map(move |id| (id, state));
        Ok(tagged(active, ItemState::Active)
            .chain(tagged(waiting, ItemState::Waiting))
            .chain(tagged(delayed, ItemState::Delayed))
            .chain(tagged(completed, ItemState::Completed))
            .chain(tagged(failed, ItemState::Failed))
            .collect())
    }
}

fn parse_field<T: std::str::FromStr>(
    key: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, BackendError> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| BackendError::CorruptRecord {
            key: key.to_string(),
            reason: format!("field '{}' has invalid value '{}'", name, raw),
        }),
    }
}

fn parse_json(key: &str, fields: &HashMap<String, String>, name: &str) -> Result<Option<Value>, BackendError> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| BackendError::CorruptRecord {
                key: key.to_string(),
                reason: format!("field '{}' is not JSON: {}", name, e),
            }),
    }
}

fn scheduler_from_hash(
    key: &str,
    record_key: &str,
    fields: &HashMap<String, String>,
) -> Result<JobScheduler, BackendError> {
    let next = parse_field::<i64>(record_key, fields, "next")?.filter(|next| *next != NEVER);
    let data = parse_json(record_key, fields, "data")?;
    let opts = parse_json(record_key, fields, "opts")?;
    let name = fields.get("name").cloned().unwrap_or_default();

    let template = match (data, opts) {
        (None, None) => None,
        (data, opts) => Some(serde_json::json!({
            "name": name,
            "data": data.unwrap_or(Value::Null),
            "opts": opts.unwrap_or(Value::Null),
        })),
    };

    Ok(JobScheduler {
        key: key.to_string(),
        name,
        next,
        pattern: fields.get("pattern").filter(|p| !p.is_empty()).cloned(),
        every: parse_field(record_key, fields, "every")?,
        limit: parse_field(record_key, fields, "limit")?,
        end_date: parse_field(record_key, fields, "endDate")?,
        tz: fields.get("tz").filter(|tz| !tz.is_empty()).cloned(),
        template,
    })
}

fn item_from_hash(
    id: String,
    state: ItemState,
    record_key: &str,
    fields: &HashMap<String, String>,
) -> Result<WorkItem, BackendError> {
    let opts = match parse_json(record_key, fields, "opts")? {
        Some(value) => serde_json::from_value::<JobOptions>(value).ok(),
        None => None,
    };

    Ok(WorkItem {
        id,
        name: fields.get("name").cloned().unwrap_or_default(),
        data: parse_json(record_key, fields, "data")?.unwrap_or(Value::Null),
        state,
        timestamp: parse_field(record_key, fields, "timestamp")?.unwrap_or_default(),
        opts,
    })
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    #[instrument(skip(self, repeat, template), fields(queue = %queue, key = %key))]
    async fn upsert_scheduler(
        &self,
        queue: &str,
        key: &str,
        repeat: &RepeatOptions,
        template: &JobTemplate,
        now_ms: i64,
    ) -> Result<Option<i64>, BackendError> {
        let next = next_firing(repeat, now_ms);
        let record_key = self.scheduler_key(queue, key);

        let mut fields: Vec<(&str, String)> = vec![
            ("name", template.name.clone()),
            ("data", serde_json::to_string(&template.data)?),
            ("opts", serde_json::to_string(&template.opts)?),
            ("next", next.unwrap_or(NEVER).to_string()),
        ];
        if let Some(pattern) = &repeat.pattern {
            fields.push(("pattern", pattern.clone()));
        }
        if let Some(every) = repeat.every {
            fields.push(("every", every.to_string()));
        }
        if let Some(limit) = repeat.limit {
            fields.push(("limit", limit.to_string()));
        }
        if let Some(start) = repeat.start_date {
            fields.push(("startDate", start.to_string()));
        }
        if let Some(end) = repeat.end_date {
            fields.push(("endDate", end.to_string()));
        }
        if let Some(tz) = &repeat.tz {
            fields.push(("tz", tz.clone()));
        }

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .del(&record_key)
            .ignore()
            .hset_multiple(&record_key, &fields)
            .ignore()
            .zadd(self.key(queue, "repeat"), key, next.unwrap_or(NEVER))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(next = ?next, "Scheduler upserted");
        Ok(next)
    }

    #[instrument(skip(self), fields(queue = %queue, key = %key))]
    async fn remove_scheduler(&self, queue: &str, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let removed: i32 = redis::Script::new(REMOVE_SCHEDULER_SCRIPT)
            .key(self.key(queue, "repeat"))
            .key(self.scheduler_key(queue, key))
            .arg(key)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    #[instrument(skip(self), fields(queue = %queue, key = %key))]
    async fn advance_scheduler(&self, queue: &str, key: &str, next_ms: i64) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let advanced: i32 = redis::Script::new(ADVANCE_SCHEDULER_SCRIPT)
            .key(self.key(queue, "repeat"))
            .key(self.scheduler_key(queue, key))
            .arg(key)
            .arg(next_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(advanced == 1)
    }

    #[instrument(skip(self), fields(queue = %queue))]
    async fn list_schedulers(&self, queue: &str) -> Result<Vec<JobScheduler>, BackendError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.zrange(self.key(queue, "repeat"), 0, -1).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(self.scheduler_key(queue, key));
        }
        let records: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut schedulers = Vec::with_capacity(keys.len());
        for (key, fields) in keys.iter().zip(records.iter()) {
            let record_key = self.scheduler_key(queue, key);
            if fields.is_empty() {
                // Member without a hash: report it so the caller can still see and remove it
                schedulers.push(JobScheduler {
                    key: key.clone(),
                    name: String::new(),
                    next: None,
                    pattern: None,
                    every: None,
                    limit: None,
                    end_date: None,
                    tz: None,
                    template: None,
                });
                continue;
            }
            schedulers.push(scheduler_from_hash(key, &record_key, fields)?);
        }

        Ok(schedulers)
    }

    #[instrument(skip(self), fields(queue = %queue))]
    async fn list_items(&self, queue: &str) -> Result<Vec<WorkItem>, BackendError> {
        let ids = self.item_ids(queue).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for (id, _) in &ids {
            pipe.hgetall(self.key(queue, id));
        }
        let records: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut items = Vec::with_capacity(ids.len());
        for ((id, state), fields) in ids.into_iter().zip(records.iter()) {
            // Removed by retention between the two round trips
            if fields.is_empty() {
                continue;
            }
            let record_key = self.key(queue, &id);
            items.push(item_from_hash(id, state, &record_key, fields)?);
        }

        Ok(items)
    }

    #[instrument(skip(self, data, opts), fields(queue = %queue, name = %name))]
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        data: &Value,
        opts: &JobOptions,
        now_ms: i64,
    ) -> Result<bool, BackendError> {
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut conn = self.conn.clone();
        let added: i32 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(self.key(queue, &id))
            .key(self.key(queue, "wait"))
            .arg(&id)
            .arg(name)
            .arg(serde_json::to_string(data)?)
            .arg(serde_json::to_string(opts)?)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        debug!(job_id = %id, added = added == 1, "Enqueued work item");
        Ok(added == 1)
    }
}

/// Binds queue backends to the connection manager's live connections
pub struct RedisBackendProvider {
    connections: ConnectionManager,
    prefix: String,
}

impl RedisBackendProvider {
    pub fn new(connections: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connections,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl BackendProvider for RedisBackendProvider {
    async fn bind(&self, target: ConnectionTarget) -> Result<BoundBackend, ConnectionError> {
        let connection = self.connections.acquire(target).await?;
        Ok(BoundBackend {
            generation: connection.generation(),
            backend: Arc::new(RedisQueueBackend::new(
                connection.store().get_connection(),
                self.prefix.clone(),
            )),
        })
    }
}
