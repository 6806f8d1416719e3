// Key-value store client, health check and raw key inspection

use crate::errors::{ConnectionError, StoreError};
use crate::models::ConnectionTarget;
use crate::retry::RetryStrategy;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Batch size hint for SCAN
const SCAN_COUNT: usize = 200;

/// Store client wrapper around an auto-reconnecting connection manager
#[derive(Clone)]
pub struct StoreClient {
    manager: ConnectionManager,
    endpoint: String,
}

impl StoreClient {
    /// Open a client against `host:port/db`, retrying transient connect errors
    /// with `retry` until it gives up.
    ///
    /// The manager itself follows `retry.reconnect_backoff()`, both inside
    /// each attempt and when reconnecting after the connection drops.
    #[instrument(skip(retry))]
    pub async fn connect(
        host: &str,
        port: u16,
        db: i64,
        retry: &dyn RetryStrategy,
    ) -> Result<Self, ConnectionError> {
        let endpoint = format!("redis://{}:{}/{}", host, port, db);
        let client = Client::open(endpoint.as_str()).map_err(|e| {
            ConnectionError::InvalidConfiguration(format!("Invalid store endpoint {}: {}", endpoint, e))
        })?;

        let backoff = retry.reconnect_backoff();
        let mut attempt = 0;
        loop {
            info!(endpoint = %endpoint, attempt = attempt + 1, "Store client connecting");

            match ConnectionManager::new_with_backoff(
                client.clone(),
                backoff.exponent_base,
                backoff.factor_ms,
                backoff.retries,
            )
            .await
            {
                Ok(manager) => {
                    info!(endpoint = %endpoint, reconnect_retries = backoff.retries, "Store client ready");
                    return Ok(Self { manager, endpoint });
                }
                Err(e) => {
                    attempt += 1;
                    warn!(endpoint = %endpoint, attempt, error = %e, "Store client connection error");

                    match retry.next_delay(attempt) {
                        Some(delay) => {
                            info!(delay_ms = delay.as_millis() as u64, "Store client reconnecting");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(ConnectionError::StoreConnectFailed {
                                attempts: attempt,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Get a handle to the shared connection
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Health check - ping the store
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.get_connection();
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::RedisError(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(StoreError::RedisError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }

    /// Collect every string value whose key matches the glob `pattern`.
    ///
    /// Values are decoded as JSON when possible and kept as JSON strings
    /// otherwise; keys that vanish mid-scan or hold non-string types are skipped.
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    pub async fn scan_json(&self, pattern: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        let mut conn = self.get_connection();
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        keys.sort();
        keys.dedup();
        debug!(matched = keys.len(), "Scanned keys");

        let mut data = BTreeMap::new();
        for key in keys {
            let value = match conn.get::<_, Option<String>>(&key).await {
                Ok(value) => value,
                Err(e) if e.kind() == redis::ErrorKind::TypeError => {
                    debug!(key = %key, "Skipping non-string key");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Some(raw) = value {
                let parsed = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                data.insert(key, parsed);
            }
        }

        Ok(data)
    }
}

/// Read-only inspection of raw store keys
#[async_trait]
pub trait KeyInspector: Send + Sync {
    /// Values of every key matching `pattern` on `target`
    async fn inspect(
        &self,
        target: ConnectionTarget,
        pattern: &str,
    ) -> Result<BTreeMap<String, Value>, StoreError>;
}
