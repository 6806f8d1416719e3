// Configuration management with layered configuration (file, env)

use crate::models::{ConnectionTarget, KeepPolicy, RetentionPolicy};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub targets: TargetsConfig,
    pub queues: QueuesConfig,
    pub scheduler: SchedulerConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Target used when a request does not name one
    pub default_target: ConnectionTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsConfig {
    pub prod: TargetConfig,
    pub dev: TargetConfig,
}

impl TargetsConfig {
    pub fn get(&self, target: ConnectionTarget) -> &TargetConfig {
        match target {
            ConnectionTarget::Prod => &self.prod,
            ConnectionTarget::Dev => &self.dev,
        }
    }
}

/// How to reach the store for one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub store: StoreConfig,
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host; ignored when a tunnel is configured
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default = "default_retry_step_ms")]
    pub retry_step_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default)]
    pub retry_jitter: f64,
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
}

fn default_retry_step_ms() -> u64 {
    30
}

fn default_retry_max_ms() -> u64 {
    1000
}

fn default_max_connect_attempts() -> u32 {
    10
}

/// SSH forwarding tunnel in front of the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    /// PEM key material; literal `\n` sequences are accepted
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    pub remote_host: String,
    pub remote_port: u16,
    /// Loopback port to listen on; OS-assigned when absent
    #[serde(default)]
    pub local_port: Option<u16>,
}

fn default_keepalive_interval_ms() -> u64 {
    1000
}

fn default_ready_timeout_ms() -> u64 {
    10_000
}

/// Credential used to log in to the tunnel host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAuth {
    KeyData { username: String, private_key: String },
    KeyFile { username: String, private_key_path: String },
}

impl TunnelConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Resolve the configured credential, preferring inline key data
    pub fn auth(&self) -> Result<TunnelAuth, String> {
        match (&self.private_key, &self.private_key_path) {
            (Some(key), _) if !key.trim().is_empty() => Ok(TunnelAuth::KeyData {
                username: self.username.clone(),
                private_key: key.replace("\\n", "\n"),
            }),
            (_, Some(path)) if !path.trim().is_empty() => Ok(TunnelAuth::KeyFile {
                username: self.username.clone(),
                private_key_path: path.clone(),
            }),
            _ => Err("tunnel requires private_key or private_key_path".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesConfig {
    /// Key prefix shared by every queue
    pub prefix: String,
    pub names: Vec<String>,
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// IANA zone cron patterns are evaluated in
    pub timezone: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port must be greater than 0".to_string());
        }

        if self.targets.prod.tunnel.is_none() {
            return Err("The prod target requires an SSH tunnel".to_string());
        }

        for target in ConnectionTarget::ALL {
            let target_config = self.targets.get(target);
            if target_config.store.port == 0 {
                return Err(format!("Store port for {} must be greater than 0", target));
            }
            if target_config.store.max_connect_attempts == 0 {
                return Err(format!(
                    "Store max_connect_attempts for {} must be greater than 0",
                    target
                ));
            }
            if let Some(tunnel) = &target_config.tunnel {
                if tunnel.ssh_host.is_empty() || tunnel.remote_host.is_empty() {
                    return Err(format!("Tunnel hosts for {} cannot be empty", target));
                }
                if tunnel.ready_timeout_ms == 0 {
                    return Err(format!(
                        "Tunnel ready_timeout_ms for {} must be greater than 0",
                        target
                    ));
                }
                tunnel.auth().map_err(|e| format!("{}: {}", target, e))?;
            } else if target_config.store.host.is_empty() {
                return Err(format!("Store host for {} cannot be empty", target));
            }
        }

        if self.queues.names.is_empty() {
            return Err("At least one queue name is required".to_string());
        }
        let mut seen = HashSet::new();
        for name in &self.queues.names {
            if name.trim().is_empty() {
                return Err("Queue names cannot be empty".to_string());
            }
            if !seen.insert(name) {
                return Err(format!("Duplicate queue name: {}", name));
            }
        }

        if self.scheduler.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(format!("Invalid scheduler timezone: {}", self.scheduler.timezone));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
                default_target: ConnectionTarget::Dev,
            },
            targets: TargetsConfig {
                prod: TargetConfig {
                    store: StoreConfig {
                        host: "localhost".to_string(),
                        port: 6379,
                        db: 0,
                        retry_step_ms: default_retry_step_ms(),
                        retry_max_ms: default_retry_max_ms(),
                        retry_jitter: 0.0,
                        max_connect_attempts: default_max_connect_attempts(),
                    },
                    tunnel: Some(TunnelConfig {
                        ssh_host: "bastion.internal".to_string(),
                        ssh_port: 1022,
                        username: "ubuntu".to_string(),
                        private_key: None,
                        private_key_path: Some("~/.ssh/id_rsa".to_string()),
                        keepalive_interval_ms: default_keepalive_interval_ms(),
                        ready_timeout_ms: default_ready_timeout_ms(),
                        remote_host: "redis.internal".to_string(),
                        remote_port: 6379,
                        local_port: None,
                    }),
                },
                dev: TargetConfig {
                    store: StoreConfig {
                        host: "localhost".to_string(),
                        port: 36379,
                        db: 0,
                        retry_step_ms: default_retry_step_ms(),
                        retry_max_ms: default_retry_max_ms(),
                        retry_jitter: 0.0,
                        max_connect_attempts: default_max_connect_attempts(),
                    },
                    tunnel: None,
                },
            },
            queues: QueuesConfig {
                prefix: "bull".to_string(),
                names: vec![
                    "matchingQueue".to_string(),
                    "notificationQueue".to_string(),
                    "testQueue".to_string(),
                ],
                retention: RetentionPolicy {
                    completed: KeepPolicy {
                        count: 100,
                        age: 60 * 60 * 24,
                    },
                    failed: KeepPolicy {
                        count: 100,
                        age: 60 * 60 * 24 * 7,
                    },
                },
            },
            scheduler: SchedulerConfig {
                timezone: "UTC".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Json,
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}
