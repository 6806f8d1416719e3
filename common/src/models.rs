use crate::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Connection Targets
// ============================================================================

/// Environment a connection is opened against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionTarget {
    Prod,
    Dev,
}

impl ConnectionTarget {
    pub const ALL: [ConnectionTarget; 2] = [ConnectionTarget::Prod, ConnectionTarget::Dev];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionTarget::Prod => "prod",
            ConnectionTarget::Dev => "dev",
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionTarget {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prod" => Ok(ConnectionTarget::Prod),
            "dev" => Ok(ConnectionTarget::Dev),
            other => Err(ValidationError::InvalidTarget(other.to_string())),
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// TriggerKind names the firing policy of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Repeat,
    Delay,
    Now,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Repeat => "repeat",
            TriggerKind::Delay => "delay",
            TriggerKind::Now => "now",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repeat" => Ok(TriggerKind::Repeat),
            // "once" is what older console builds sent for one-shot jobs
            "delay" | "once" => Ok(TriggerKind::Delay),
            "now" => Ok(TriggerKind::Now),
            other => Err(ValidationError::InvalidTriggerType(other.to_string())),
        }
    }
}

/// Trigger is the validated firing policy, with its payload fixed per tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Trigger {
    /// Cron-style recurrence pattern
    Repeat(String),
    /// Absolute firing instant in epoch milliseconds
    Delay(i64),
    Now,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Repeat(_) => TriggerKind::Repeat,
            Trigger::Delay(_) => TriggerKind::Delay,
            Trigger::Now => TriggerKind::Now,
        }
    }
}

/// Untyped trigger as it arrives over the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerInput {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl TryFrom<TriggerInput> for Trigger {
    type Error = ValidationError;

    fn try_from(input: TriggerInput) -> Result<Self, Self::Error> {
        let kind: TriggerKind = match input.kind.as_deref() {
            None | Some("") => return Err(ValidationError::MissingField("trigger.type".into())),
            Some(kind) => kind.parse()?,
        };

        let data = input.data.filter(|value| !value.is_null());

        match kind {
            TriggerKind::Now => Ok(Trigger::Now),
            TriggerKind::Repeat => match data {
                None => Err(ValidationError::MissingField("trigger.data".into())),
                Some(Value::String(pattern)) if !pattern.trim().is_empty() => {
                    Ok(Trigger::Repeat(pattern.trim().to_string()))
                }
                Some(Value::String(_)) => Err(ValidationError::MissingField("trigger.data".into())),
                Some(other) => Err(ValidationError::InvalidFieldValue {
                    field: "trigger.data".into(),
                    reason: format!("expected a cron pattern string, got {}", other),
                }),
            },
            TriggerKind::Delay => match data {
                None => Err(ValidationError::MissingField("trigger.data".into())),
                Some(value) => parse_instant(&value).map(Trigger::Delay),
            },
        }
    }
}

/// Largest instant accepted as a firing time, in epoch ms (same bound as a JS `Date`)
pub const MAX_INSTANT_MS: i64 = 8_640_000_000_000_000;

/// Whether `instant_ms` lies in `[-MAX_INSTANT_MS, MAX_INSTANT_MS]`
pub fn instant_in_range(instant_ms: i64) -> bool {
    (-MAX_INSTANT_MS..=MAX_INSTANT_MS).contains(&instant_ms)
}

/// Accept epoch milliseconds (number or numeric string) or an RFC 3339 date
fn parse_instant(value: &Value) -> Result<i64, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidFieldValue {
        field: "trigger.data".into(),
        reason,
    };
    let in_range = |millis: i64| {
        if instant_in_range(millis) {
            Ok(millis)
        } else {
            Err(invalid(format!("{} is outside the supported date range", millis)))
        }
    };

    match value {
        Value::Number(number) => {
            if let Some(millis) = number.as_i64() {
                return in_range(millis);
            }
            match number.as_f64() {
                Some(f) if f.is_finite() && f.abs() <= MAX_INSTANT_MS as f64 => in_range(f.trunc() as i64),
                _ => Err(invalid(format!("{} is not a valid timestamp", number))),
            }
        }
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Err(ValidationError::MissingField("trigger.data".into()));
            }
            if let Ok(millis) = text.parse::<i64>() {
                return in_range(millis);
            }
            DateTime::parse_from_rfc3339(text)
                .map_err(|e| invalid(format!("'{}' is not a valid date: {}", text, e)))
                .and_then(|instant| in_range(instant.with_timezone(&Utc).timestamp_millis()))
        }
        other => Err(invalid(format!("expected a timestamp, got {}", other))),
    }
}

// ============================================================================
// Job Requests
// ============================================================================

/// JobRequest is a validated submission to add or update scheduled work
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub queue_name: String,
    pub job_name: String,
    pub job_data: Value,
    pub trigger: Trigger,
}

/// Raw add/update body; every field is optional until validated
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
    pub queue_name: Option<String>,
    pub job_name: Option<String>,
    pub job_data: Option<Value>,
    pub trigger: Option<TriggerInput>,
    /// Existing scheduler key, only meaningful for updates
    pub key: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field.to_string())),
    }
}

impl JobSubmission {
    /// Validate the body of an add request
    pub fn into_request(self) -> Result<JobRequest, ValidationError> {
        let queue_name = required(self.queue_name, "queueName")?;
        let job_name = required(self.job_name, "jobName")?;
        let job_data = match self.job_data {
            Some(Value::Null) | None => return Err(ValidationError::MissingField("jobData".into())),
            Some(data) => data,
        };
        let trigger_input = self
            .trigger
            .ok_or_else(|| ValidationError::MissingField("trigger".into()))?;
        let trigger = Trigger::try_from(trigger_input)?;

        Ok(JobRequest {
            queue_name,
            job_name,
            job_data,
            trigger,
        })
    }

    /// Validate the body of an update request, returning the existing key
    pub fn into_update(mut self) -> Result<(String, JobRequest), ValidationError> {
        let key = required(self.key.take(), "key")?;
        Ok((key, self.into_request()?))
    }
}

/// Raw remove body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSubmission {
    pub queue_name: Option<String>,
    pub job_scheduler_id: Option<String>,
}

impl RemoveSubmission {
    /// Returns (queue name, scheduler key)
    pub fn validate(self) -> Result<(String, String), ValidationError> {
        Ok((
            required(self.queue_name, "queueName")?,
            required(self.job_scheduler_id, "jobSchedulerId")?,
        ))
    }
}

// ============================================================================
// Identities and Backend Records
// ============================================================================

/// Deterministic key of a schedulable unit of work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentity(String);

impl JobIdentity {
    /// `queue:job:kind`, with the submission stamp appended for `now` jobs only
    pub fn new(queue: &str, job: &str, kind: TriggerKind, submitted_at_ms: i64) -> Self {
        match kind {
            TriggerKind::Now => Self(format!("{}:{}:{}:{}", queue, job, kind, submitted_at_ms)),
            TriggerKind::Repeat | TriggerKind::Delay => {
                Self(format!("{}:{}:{}", queue, job, kind))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recurrence configuration handed to the backend's scheduler primitive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Interval in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
}

/// Keep at most `count` items, none older than `age` seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepPolicy {
    pub count: u32,
    pub age: u64,
}

/// Retention applied to finished work items of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub completed: KeepPolicy,
    pub failed: KeepPolicy,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: KeepPolicy {
                count: 100,
                age: 60 * 60 * 24,
            },
            failed: KeepPolicy {
                count: 100,
                age: 60 * 60 * 24 * 7,
            },
        }
    }
}

/// Options stamped onto every work item for the consuming worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub remove_on_complete: KeepPolicy,
    pub remove_on_fail: KeepPolicy,
}

impl JobOptions {
    pub fn from_retention(retention: &RetentionPolicy, job_id: Option<&JobIdentity>) -> Self {
        Self {
            job_id: job_id.map(|id| id.as_str().to_string()),
            remove_on_complete: retention.completed,
            remove_on_fail: retention.failed,
        }
    }
}

/// What a scheduler entry produces each time it fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
}

/// Backend-resident recurring or one-shot firing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobScheduler {
    pub key: String,
    pub name: String,
    /// Next firing instant in epoch milliseconds
    pub next: Option<i64>,
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
}

impl JobScheduler {
    /// A scheduler is stale once its next firing lies strictly in the past
    pub fn is_stale(&self, now_ms: i64) -> bool {
        matches!(self.next, Some(next) if next < now_ms)
    }

    /// Recurrence this entry still follows, or `None` for a one-shot
    /// (`limit` 1) whose single firing is all it ever had.
    pub fn recurrence(&self) -> Option<RepeatOptions> {
        if self.limit == Some(1) {
            return None;
        }
        Some(RepeatOptions {
            pattern: self.pattern.clone(),
            every: self.every,
            limit: self.limit,
            start_date: None,
            end_date: self.end_date,
            tz: self.tz.clone(),
        })
    }
}

/// Lifecycle state of a work item in the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// A single unit of queued work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub state: ItemState,
    /// Enqueue time in epoch milliseconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<JobOptions>,
}

/// Listing of one queue: its work items and live schedulers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub jobs: Vec<WorkItem>,
    pub schedulers: Vec<JobScheduler>,
}

/// Listing of every registered queue, keyed by queue name
pub type ScheduleListing = BTreeMap<String, QueueSnapshot>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn submission(body: Value) -> JobSubmission {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("prod".parse::<ConnectionTarget>().unwrap(), ConnectionTarget::Prod);
        assert_eq!("dev".parse::<ConnectionTarget>().unwrap(), ConnectionTarget::Dev);
        assert!(matches!(
            "staging".parse::<ConnectionTarget>(),
            Err(ValidationError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_repeat_trigger_from_input() {
        let input: TriggerInput =
            serde_json::from_value(json!({"type": "repeat", "data": "*/5 * * * *"})).unwrap();
        assert_eq!(
            Trigger::try_from(input).unwrap(),
            Trigger::Repeat("*/5 * * * *".to_string())
        );
    }

    #[test]
    fn test_delay_trigger_accepts_number_and_date() {
        let input: TriggerInput =
            serde_json::from_value(json!({"type": "delay", "data": 1_700_000_000_000i64})).unwrap();
        assert_eq!(Trigger::try_from(input).unwrap(), Trigger::Delay(1_700_000_000_000));

        let input: TriggerInput = serde_json::from_value(
            json!({"type": "delay", "data": "2023-11-14T22:13:20Z"}),
        )
        .unwrap();
        assert_eq!(Trigger::try_from(input).unwrap(), Trigger::Delay(1_700_000_000_000));
    }

    #[test]
    fn test_once_is_alias_for_delay() {
        let input: TriggerInput =
            serde_json::from_value(json!({"type": "once", "data": 42})).unwrap();
        assert_eq!(Trigger::try_from(input).unwrap().kind(), TriggerKind::Delay);
    }

    #[test]
    fn test_delay_outside_date_range_is_rejected() {
        for data in [json!(i64::MIN), json!(i64::MAX), json!(1e300), json!("-9223372036854775808")] {
            let input: TriggerInput =
                serde_json::from_value(json!({"type": "delay", "data": data})).unwrap();
            assert!(matches!(
                Trigger::try_from(input),
                Err(ValidationError::InvalidFieldValue { .. })
            ));
        }

        let input: TriggerInput =
            serde_json::from_value(json!({"type": "delay", "data": 1_700_000_000_000.75})).unwrap();
        assert_eq!(Trigger::try_from(input).unwrap(), Trigger::Delay(1_700_000_000_000));
    }

    #[test]
    fn test_missing_trigger_data_is_rejected() {
        for kind in ["repeat", "delay"] {
            let input: TriggerInput = serde_json::from_value(json!({ "type": kind })).unwrap();
            assert_eq!(
                Trigger::try_from(input),
                Err(ValidationError::MissingField("trigger.data".into()))
            );
        }
    }

    #[test]
    fn test_now_ignores_data() {
        let input: TriggerInput =
            serde_json::from_value(json!({"type": "now", "data": "whatever"})).unwrap();
        assert_eq!(Trigger::try_from(input).unwrap(), Trigger::Now);
    }

    #[test]
    fn test_unknown_trigger_type() {
        let input: TriggerInput = serde_json::from_value(json!({"type": "hourly"})).unwrap();
        assert!(matches!(
            Trigger::try_from(input),
            Err(ValidationError::InvalidTriggerType(_))
        ));
    }

    #[test]
    fn test_submission_requires_every_field() {
        let err = submission(json!({"jobName": "ping", "jobData": {}, "trigger": {"type": "now"}}))
            .into_request()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("queueName".into()));

        let err = submission(json!({"queueName": "testQueue", "jobName": "ping", "trigger": {"type": "now"}}))
            .into_request()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("jobData".into()));

        let err = submission(json!({"queueName": "testQueue", "jobName": "ping", "jobData": {}}))
            .into_request()
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("trigger".into()));
    }

    #[test]
    fn test_update_requires_key() {
        let err = submission(json!({
            "queueName": "testQueue",
            "jobName": "ping",
            "jobData": {},
            "trigger": {"type": "repeat", "data": "* * * * *"}
        }))
        .into_update()
        .unwrap_err();
        assert_eq!(err, ValidationError::MissingField("key".into()));
    }

    #[test]
    fn test_request_serializes_as_original_payload() {
        let request = JobRequest {
            queue_name: "testQueue".into(),
            job_name: "ping".into(),
            job_data: json!({"a": 1}),
            trigger: Trigger::Repeat("*/5 * * * *".into()),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["queueName"], "testQueue");
        assert_eq!(value["trigger"]["type"], "repeat");
        assert_eq!(value["trigger"]["data"], "*/5 * * * *");
    }

    #[test]
    fn test_identity_format() {
        let id = JobIdentity::new("testQueue", "ping", TriggerKind::Repeat, 123);
        assert_eq!(id.as_str(), "testQueue:ping:repeat");

        let id = JobIdentity::new("testQueue", "ping", TriggerKind::Now, 123);
        assert_eq!(id.as_str(), "testQueue:ping:now:123");
    }

    #[test]
    fn test_scheduler_staleness() {
        let mut scheduler = JobScheduler {
            key: "k".into(),
            name: "n".into(),
            next: Some(1_000),
            pattern: None,
            every: None,
            limit: None,
            end_date: None,
            tz: None,
            template: None,
        };
        assert!(scheduler.is_stale(1_001));
        assert!(!scheduler.is_stale(1_000));
        scheduler.next = None;
        assert!(!scheduler.is_stale(i64::MAX));
    }
}
