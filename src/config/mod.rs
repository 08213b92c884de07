//! # Reprocessor Configuration
//!
//! Typed configuration for every component of the reprocessor, loaded by
//! [`ConfigManager`] from layered sources.
//!
//! ## Sources (later wins)
//!
//! 1. `config/reprocessor.toml`
//! 2. `config/reprocessor.{environment}.toml` (optional)
//! 3. `DLQ_REPROCESSOR__SECTION__FIELD` environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dlq_reprocessor::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let subscription = &manager.config().broker.subscription;
//! let ceiling = manager.config().scheduler.max_attempts;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{attributes, defaults};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReprocessorConfig {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub classifier: ClassifierConfig,
    pub scheduler: SchedulerConfig,
    pub redelivery: RedeliveryConfig,
    pub quarantine: QuarantineConfig,
    pub logging: LoggingConfig,
}

/// Subscription and pull behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// DLQ subscription to consume
    pub subscription: String,
    pub pull_batch_size: usize,
    pub ack_deadline_ms: u64,
    /// Initial delay before retrying a failed pull
    pub pull_retry_base_ms: u64,
    /// Ceiling for the pull retry delay
    pub pull_retry_max_ms: u64,
    /// Sleep between pulls that returned nothing
    pub idle_poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscription: defaults::SUBSCRIPTION.to_string(),
            pull_batch_size: defaults::PULL_BATCH_SIZE,
            ack_deadline_ms: 30_000,
            pull_retry_base_ms: 100,
            pull_retry_max_ms: 30_000,
            idle_poll_interval_ms: 250,
        }
    }
}

impl BrokerConfig {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.ack_deadline_ms)
    }

    pub fn pull_retry_base(&self) -> Duration {
        Duration::from_millis(self.pull_retry_base_ms)
    }

    pub fn pull_retry_max(&self) -> Duration {
        Duration::from_millis(self.pull_retry_max_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }
}

/// Worker pool and in-flight window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Maximum unacknowledged messages held at once
    pub max_in_flight: usize,
    pub worker_count: usize,
    /// Capacity of the listener -> worker channel
    pub channel_capacity: usize,
    pub processing_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// How often expired tombstones and first-seen entries are evicted
    pub maintenance_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 32,
            worker_count: 4,
            channel_capacity: 64,
            processing_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
            maintenance_interval_ms: 60_000,
        }
    }
}

impl ConsumerConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

/// Failure classification rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Attributes inspected for error signatures
    pub error_attributes: Vec<String>,
    /// Case-insensitive substrings marking a retryable failure
    pub transient_signatures: Vec<String>,
    /// Case-insensitive substrings marking a failure retry can never fix
    pub poison_signatures: Vec<String>,
    pub max_payload_bytes: usize,
    /// Payload must be a JSON object
    pub require_json: bool,
    /// Top-level fields the JSON object must contain
    pub required_fields: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            error_attributes: vec![
                attributes::ERROR.to_string(),
                attributes::ERROR_CODE.to_string(),
            ],
            transient_signatures: [
                "timeout",
                "timed out",
                "deadline exceeded",
                "connection refused",
                "connection reset",
                "network",
                "unavailable",
                "503",
                "throttl",
                "rate limit",
                "429",
                "resource exhausted",
                "temporarily",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            poison_signatures: [
                "schema",
                "deserializ",
                "parse error",
                "malformed",
                "invalid payload",
                "unsupported",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_payload_bytes: 1024 * 1024,
            require_json: true,
            required_fields: Vec::new(),
        }
    }
}

/// Attempt ceilings, backoff shape and tombstone retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_attempts: u32,
    /// Stricter ceiling for failures matching no known signature
    pub unknown_max_attempts: u32,
    pub backoff: BackoffConfig,
    pub tombstone_ttl_secs: u64,
    /// Attempt records idle this long are evicted by maintenance
    pub record_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
            unknown_max_attempts: defaults::UNKNOWN_MAX_ATTEMPTS,
            backoff: BackoffConfig::default(),
            tombstone_ttl_secs: defaults::TOMBSTONE_TTL.as_secs(),
            record_ttl_secs: defaults::RECORD_TTL.as_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_secs(self.tombstone_ttl_secs)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Upper bound of multiplicative jitter, in [0, 1]
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::BASE_DELAY.as_millis() as u64,
            max_delay_ms: defaults::MAX_DELAY.as_millis() as u64,
            multiplier: defaults::BACKOFF_MULTIPLIER,
            jitter_factor: defaults::JITTER_FACTOR,
        }
    }
}

/// Where redelivered messages go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryConfig {
    /// Attribute naming the topic a message was originally published to
    pub original_topic_attribute: String,
    /// Used when a message carries no original topic attribute
    pub default_topic: Option<String>,
    /// Delay topics, sorted by ascending delay
    pub delay_tiers: Vec<DelayTierConfig>,
}

impl Default for RedeliveryConfig {
    fn default() -> Self {
        Self {
            original_topic_attribute: attributes::ORIGINAL_TOPIC.to_string(),
            default_topic: None,
            delay_tiers: Vec::new(),
        }
    }
}

/// A topic whose subscription delivers after a fixed delay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayTierConfig {
    pub delay_ms: u64,
    pub topic: String,
}

impl DelayTierConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineBackend {
    #[default]
    Memory,
    File,
    Postgres,
}

impl std::fmt::Display for QuarantineBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::File => write!(f, "file"),
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    pub backend: QuarantineBackend,
    /// Record directory for the file backend
    pub directory: Option<PathBuf>,
    /// Connection string for the postgres backend
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            backend: QuarantineBackend::Memory,
            directory: None,
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    /// Emit console output as JSON
    pub json: bool,
    /// Write a daily-rotated JSON log file here when set
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
            file_prefix: "dlq-reprocessor".to_string(),
        }
    }
}

impl ReprocessorConfig {
    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.broker.subscription.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "broker.subscription",
                "broker configuration",
            ));
        }

        if self.broker.pull_batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "broker.pull_batch_size",
                0,
                "batch size must be greater than 0",
            ));
        }

        if self.broker.pull_retry_max_ms < self.broker.pull_retry_base_ms {
            return Err(ConfigurationError::invalid_value(
                "broker.pull_retry_max_ms",
                self.broker.pull_retry_max_ms,
                "must be at least broker.pull_retry_base_ms",
            ));
        }

        if self.consumer.max_in_flight == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.max_in_flight",
                0,
                "in-flight window must be greater than 0",
            ));
        }

        if self.consumer.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.worker_count",
                0,
                "worker count must be greater than 0",
            ));
        }

        if self.consumer.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.channel_capacity",
                0,
                "channel capacity must be greater than 0",
            ));
        }

        if self.consumer.processing_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.processing_timeout_ms",
                0,
                "processing timeout must be greater than 0",
            ));
        }

        if self.consumer.processing_timeout_ms > self.broker.ack_deadline_ms {
            return Err(ConfigurationError::invalid_value(
                "consumer.processing_timeout_ms",
                self.consumer.processing_timeout_ms,
                "must not exceed broker.ack_deadline_ms, or the broker redelivers messages still being processed",
            ));
        }

        if self.consumer.maintenance_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "consumer.maintenance_interval_ms",
                0,
                "maintenance interval must be greater than 0",
            ));
        }

        if self.classifier.max_payload_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "classifier.max_payload_bytes",
                0,
                "payload limit must be greater than 0",
            ));
        }

        if self.scheduler.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.max_attempts",
                0,
                "attempt ceiling must be greater than 0",
            ));
        }

        if self.scheduler.unknown_max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.unknown_max_attempts",
                0,
                "attempt ceiling must be greater than 0",
            ));
        }

        if self.scheduler.record_ttl_secs == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.record_ttl_secs",
                0,
                "record retention must be greater than 0",
            ));
        }

        let backoff = &self.scheduler.backoff;
        if !(0.0..=1.0).contains(&backoff.jitter_factor) {
            return Err(ConfigurationError::invalid_value(
                "scheduler.backoff.jitter_factor",
                backoff.jitter_factor,
                "jitter factor must be within [0, 1]",
            ));
        }

        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.backoff.multiplier",
                backoff.multiplier,
                "multiplier must be a finite value of at least 1.0",
            ));
        }

        if backoff.max_delay_ms < backoff.base_delay_ms {
            return Err(ConfigurationError::invalid_value(
                "scheduler.backoff.max_delay_ms",
                backoff.max_delay_ms,
                "max delay must be at least the base delay",
            ));
        }

        if self.redelivery.original_topic_attribute.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "redelivery.original_topic_attribute",
                "redelivery configuration",
            ));
        }

        let tiers = &self.redelivery.delay_tiers;
        if tiers.windows(2).any(|w| w[0].delay_ms >= w[1].delay_ms) {
            return Err(ConfigurationError::validation_error(
                "redelivery.delay_tiers must be sorted by strictly ascending delay_ms",
            ));
        }
        if let Some(tier) = tiers.iter().find(|t| t.topic.trim().is_empty()) {
            return Err(ConfigurationError::invalid_value(
                "redelivery.delay_tiers.topic",
                "",
                format!("tier with delay {}ms has no topic", tier.delay_ms),
            ));
        }

        match self.quarantine.backend {
            QuarantineBackend::Memory => {}
            QuarantineBackend::File => {
                if self.quarantine.directory.is_none() {
                    return Err(ConfigurationError::missing_required_field(
                        "quarantine.directory",
                        "file quarantine backend",
                    ));
                }
            }
            QuarantineBackend::Postgres => {
                if self
                    .quarantine
                    .database_url
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or_default()
                    .is_empty()
                {
                    return Err(ConfigurationError::missing_required_field(
                        "quarantine.database_url",
                        "postgres quarantine backend",
                    ));
                }
                if self.quarantine.max_connections == 0 {
                    return Err(ConfigurationError::invalid_value(
                        "quarantine.max_connections",
                        0,
                        "pool size must be greater than 0",
                    ));
                }
            }
        }

        Ok(())
    }
}
