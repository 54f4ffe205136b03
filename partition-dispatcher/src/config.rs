use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use thiserror::Error;

use crate::broker::CommitMode;
use crate::dispatcher::{DispatchMode, DispatcherSettings};
use crate::kafka::ConsumerConfigBuilder;
use crate::request::{Authentication, MissingCredentialPolicy};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "partition-dispatcher")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "requests")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "32")]
    pub kafka_max_poll_records: usize,

    // must exceed the longest batch, since paused partitions still need regular polls
    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    // Dispatch configuration
    #[envconfig(default = "ordered")]
    pub dispatch_mode: DispatchMode,

    // unset means one worker per CPU, capped by the partition count
    pub worker_pool_size: Option<usize>,

    #[envconfig(default = "250")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "1000")]
    pub poll_error_backoff_ms: u64,

    #[envconfig(default = "0")] // disabled
    pub idle_interval_ms: u64,

    #[envconfig(default = "3000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "false")]
    pub commit_sync: bool,

    #[envconfig(default = "5000")]
    pub monitor_interval_ms: u64,

    #[envconfig(default = "10000")]
    pub shutdown_timeout_ms: u64,

    #[envconfig(default = "30000")]
    pub revoke_drain_timeout_ms: u64,

    // Request handling
    #[envconfig(default = "drop")]
    pub missing_credential_policy: MissingCredentialPolicy,

    pub default_api_key: Option<Secret>,

    // requests are only logged when unset
    pub executor_url: Option<String>,

    #[envconfig(default = "30000")]
    pub executor_timeout_ms: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "text")]
    pub log_format: LogFormat,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("KAFKA_CONSUMER_TOPIC must not be empty")]
    EmptyTopic,
}

/// A credential read from the environment. `Debug` prints a placeholder, so the
/// loaded configuration can be logged as is.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl FromStr for Secret {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret(s.to_string()))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("Invalid log format: {}", s)),
        }
    }
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout_ms == 0 {
            return Err(ConfigError::MustBePositive("POLL_TIMEOUT_MS"));
        }
        if self.commit_interval_ms == 0 {
            return Err(ConfigError::MustBePositive("COMMIT_INTERVAL_MS"));
        }
        if self.worker_pool_size == Some(0) {
            return Err(ConfigError::MustBePositive("WORKER_POOL_SIZE"));
        }
        if self.kafka_max_poll_records == 0 {
            return Err(ConfigError::MustBePositive("KAFKA_MAX_POLL_RECORDS"));
        }
        if self.kafka_consumer_topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            poll_error_backoff: Duration::from_millis(self.poll_error_backoff_ms),
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            commit_interval: Duration::from_millis(self.commit_interval_ms),
            commit_mode: if self.commit_sync {
                CommitMode::Sync
            } else {
                CommitMode::Async
            },
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            revoke_drain_timeout: Duration::from_millis(self.revoke_drain_timeout_ms),
        }
    }

    /// Credential used for records that carry none.
    pub fn default_authentication(&self) -> Option<Authentication> {
        self.default_api_key
            .as_ref()
            .map(Secret::expose)
            .filter(|key| !key.trim().is_empty())
            .map(|key| Authentication::ApiKey(key.to_string()))
    }

    pub fn build_consumer_config(&self) -> ClientConfig {
        ConsumerConfigBuilder::for_dispatcher(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_offset_reset(&self.kafka_consumer_offset_reset)
            .with_max_poll_interval_ms(self.kafka_max_poll_interval_ms)
            .build()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_timeout_ms)
    }
}
