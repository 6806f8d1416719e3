// Error handling framework
// Validation is rejected before any I/O; connection and backend failures carry context.

use crate::models::TriggerKind;
use thiserror::Error;

/// Validation errors raised locally, never after reaching the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid trigger type: {0}")]
    InvalidTriggerType(String),

    #[error("Invalid cron pattern '{pattern}': {reason}")]
    InvalidCronPattern { pattern: String, reason: String },

    #[error("Invalid trigger data: firing instant {instant_ms} is not in the future")]
    DelayNotInFuture { instant_ms: i64 },

    #[error("Invalid queue name: {0}")]
    UnknownQueue(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Trigger type '{0}' cannot be used to update an existing job")]
    UpdateNotAllowed(TriggerKind),
}

/// Failure to produce a usable connection for a target.
///
/// Cloneable so one in-flight construction can hand the same failure to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("SSH tunnel connection failed: {0}")]
    TunnelConnectFailed(String),

    #[error("SSH tunnel authentication failed: {0}")]
    TunnelAuthenticationFailed(String),

    #[error("SSH tunnel not ready after {0} ms")]
    TunnelTimeout(u64),

    #[error("SSH tunnel closed: {0}")]
    TunnelClosed(String),

    #[error("Failed to bind local tunnel endpoint: {0}")]
    ListenerBindFailed(String),

    #[error("Store connection failed after {attempts} attempt(s): {reason}")]
    StoreConnectFailed { attempts: u32, reason: String },

    #[error("Invalid connection configuration: {0}")]
    InvalidConfiguration(String),
}

/// A queue backend call that failed after a valid connection
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    #[error("Store command failed: {0}")]
    CommandFailed(String),

    #[error("Corrupt record at '{key}': {reason}")]
    CorruptRecord { key: String, reason: String },

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
}

/// Errors surfaced by the scheduler operations
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Backend unavailable: {0}")]
    Connection(#[from] ConnectionError),

    #[error("{operation} failed for queue '{queue}'{}: {source}", describe_job(.job, .trigger))]
    Backend {
        operation: &'static str,
        queue: String,
        job: Option<String>,
        trigger: Option<TriggerKind>,
        #[source]
        source: BackendError,
    },
}

fn describe_job(job: &Option<String>, trigger: &Option<TriggerKind>) -> String {
    match (job, trigger) {
        (Some(job), Some(trigger)) => format!(" (job '{}', trigger '{}')", job, trigger),
        (Some(job), None) => format!(" (job '{}')", job),
        (None, Some(trigger)) => format!(" (trigger '{}')", trigger),
        (None, None) => String::new(),
    }
}

impl SchedulerError {
    /// Wrap a backend failure with the operation context
    pub fn backend(
        operation: &'static str,
        queue: impl Into<String>,
        job: Option<&str>,
        trigger: Option<TriggerKind>,
        source: BackendError,
    ) -> Self {
        SchedulerError::Backend {
            operation,
            queue: queue.into(),
            job: job.map(str::to_string),
            trigger,
            source,
        }
    }

    /// True when the caller sent something invalid (400-class)
    pub fn is_client_error(&self) -> bool {
        matches!(self, SchedulerError::Validation(_))
    }
}

/// Errors from raw key inspection against the store
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Redis error: {0}")]
    RedisError(String),
}

/// API response error type for HTTP responses
#[derive(Debug, serde::Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::new("VALIDATION_ERROR", err.to_string())
    }
}

impl From<ConnectionError> for ApiError {
    fn from(err: ConnectionError) -> Self {
        ApiError::new("CONNECTION_ERROR", err.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Validation(e) => e.into(),
            SchedulerError::Connection(e) => e.into(),
            SchedulerError::Backend {
                operation,
                queue,
                job,
                trigger,
                source,
            } => {
                let message = format!("{} failed for queue '{}'", operation, queue);
                ApiError::new("BACKEND_ERROR", message).with_details(serde_json::json!({
                    "queue": queue,
                    "job": job,
                    "trigger": trigger,
                    "error": source.to_string(),
                }))
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(e) => e.into(),
            StoreError::RedisError(_) => ApiError::new("STORAGE_ERROR", err.to_string()),
        }
    }
}

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        BackendError::CommandFailed(err.to_string())
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::RedisError(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::SerializationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::InvalidCronPattern {
            pattern: "* * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron pattern"));
    }

    #[test]
    fn test_backend_error_carries_context() {
        let err = SchedulerError::backend(
            "upsert scheduler",
            "testQueue",
            Some("ping"),
            Some(TriggerKind::Repeat),
            BackendError::CommandFailed("connection reset".to_string()),
        );
        let message = err.to_string();
        assert!(message.contains("testQueue"));
        assert!(message.contains("ping"));
        assert!(message.contains("repeat"));
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_validation_is_client_error() {
        let err: SchedulerError = ValidationError::MissingField("jobName".to_string()).into();
        assert!(err.is_client_error());

        let err: SchedulerError = ConnectionError::TunnelTimeout(10_000).into();
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_backend_error_to_api_error_has_details() {
        let err = SchedulerError::backend(
            "list schedulers",
            "matchingQueue",
            None,
            None,
            BackendError::CommandFailed("boom".to_string()),
        );
        let api_err: ApiError = err.into();
        assert_eq!(api_err.code, "BACKEND_ERROR");
        let details = api_err.details.expect("details");
        assert_eq!(details["queue"], "matchingQueue");
    }

    #[test]
    fn test_api_error_with_details() {
        let err = ApiError::new("TEST_ERROR", "Test message")
            .with_details(serde_json::json!({"field": "value"}));
        assert!(err.details.is_some());
    }
}
