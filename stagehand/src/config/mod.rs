//! Engine configuration.
//!
//! Static settings are loaded once from JSON into [`EngineConfig`]. Settings
//! that must change without a restart are read through [`DynamicConfig`] on
//! every use.

mod dynamic;

pub use dynamic::{keys as dynamic_keys, DynamicConfig, InMemoryDynamicConfig};

use crate::errors::ConfigError;
use crate::exceptions::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// The partition this instance handles, if partitioned.
    #[serde(default)]
    pub partition: Option<String>,
    /// Queue and worker pool settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Task runner settings.
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Repository settings.
    #[serde(default)]
    pub repository: RepositoryConfig,
    /// Cleanup agent settings.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the partition.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks that every value is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }
        fn widen(value: usize) -> u64 {
            u64::try_from(value).unwrap_or(u64::MAX)
        }

        positive("queue.concurrency", widen(self.queue.concurrency))?;
        positive("queue.batchSize", widen(self.queue.batch_size))?;
        positive("queue.maxDeliveryAttempts", u64::from(self.queue.max_delivery_attempts))?;
        positive("runner.retry.maxAttempts", u64::from(self.runner.retry.max_attempts))?;
        positive("runner.lockTtlMs", self.runner.lock_ttl_ms)?;
        positive("cleanup.topApplications.threshold", widen(self.cleanup.top_applications.threshold))?;
        positive("cleanup.topApplications.pageSize", widen(self.cleanup.top_applications.page_size))?;
        positive("cleanup.chunkSize", widen(self.cleanup.chunk_size))?;

        if self.runner.default_backoff_ms > self.runner.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "runner.defaultBackoffMs",
                reason: "must not exceed runner.maxBackoffMs".to_string(),
            });
        }
        Ok(())
    }
}

/// Queue and worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// How long a delivery may stay unacked before it is redelivered.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Deliveries after which a message is dead-lettered.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// Poll interval of the worker loop.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum deliveries fetched per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum messages handled concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_ack_timeout_ms() -> u64 {
    60_000
}

fn default_max_delivery_attempts() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_batch_size() -> usize {
    10
}

fn default_concurrency() -> usize {
    16
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_delivery_attempts: default_max_delivery_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
        }
    }
}

impl QueueConfig {
    /// The ack timeout.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// The poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Task runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Backoff for `RUNNING` results of tasks that declare none.
    #[serde(default = "default_backoff_ms")]
    pub default_backoff_ms: u64,
    /// Upper bound on any backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Lease TTL for the per-task lock.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Invocations slower than this are logged.
    #[serde(default = "default_warning_invocation_time_ms")]
    pub warning_invocation_time_ms: u64,
    /// Retry policy for retryable failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    120_000
}

fn default_lock_ttl_ms() -> u64 {
    60_000
}

fn default_warning_invocation_time_ms() -> u64 {
    30_000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            lock_ttl_ms: default_lock_ttl_ms(),
            warning_invocation_time_ms: default_warning_invocation_time_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default backoff.
    #[must_use]
    pub fn with_default_backoff_ms(mut self, backoff: u64) -> Self {
        self.default_backoff_ms = backoff;
        self
    }

    /// The per-task lock TTL.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    /// The backoff cap.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Repository settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// Initial value of the dual-read fallback flag.
    #[serde(default)]
    pub read_fallback_enabled: bool,
    /// How long `list` waits for the secondary backend.
    #[serde(default = "default_list_timeout_ms")]
    pub list_timeout_ms: u64,
}

fn default_list_timeout_ms() -> u64 {
    5000
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            read_fallback_enabled: false,
            list_timeout_ms: default_list_timeout_ms(),
        }
    }
}

impl RepositoryConfig {
    /// The secondary list timeout.
    #[must_use]
    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }
}

/// Cleanup agent settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupConfig {
    /// Lease TTL for the per-agent cluster lock.
    #[serde(default = "default_agent_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    /// Executions deleted per repository call.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Age-based retention.
    #[serde(default)]
    pub old_pipelines: OldPipelineCleanupConfig,
    /// Count-based retention.
    #[serde(default)]
    pub top_applications: TopApplicationCleanupConfig,
}

fn default_agent_lock_ttl_ms() -> u64 {
    10 * 60 * 1000
}

fn default_chunk_size() -> usize {
    20
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_agent_lock_ttl_ms(),
            chunk_size: default_chunk_size(),
            old_pipelines: OldPipelineCleanupConfig::default(),
            top_applications: TopApplicationCleanupConfig::default(),
        }
    }
}

impl CleanupConfig {
    /// The per-agent lock TTL.
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

/// Age-based retention of pipeline executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OldPipelineCleanupConfig {
    /// Whether the agent runs.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Time between passes.
    #[serde(default = "default_cleanup_interval_ms")]
    pub interval_ms: u64,
    /// Executions older than this many days are eligible.
    #[serde(default = "default_threshold_days")]
    pub threshold_days: u32,
    /// Most recent executions always kept per pipeline config.
    #[serde(default = "default_minimum_executions")]
    pub minimum_executions: usize,
    /// Applications retained for longer.
    #[serde(default)]
    pub exceptional_applications: Vec<String>,
    /// Threshold for exceptional applications.
    #[serde(default = "default_exceptional_threshold_days")]
    pub exceptional_threshold_days: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_cleanup_interval_ms() -> u64 {
    60 * 60 * 1000
}

fn default_threshold_days() -> u32 {
    30
}

fn default_minimum_executions() -> usize {
    5
}

fn default_exceptional_threshold_days() -> u32 {
    365
}

impl Default for OldPipelineCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_cleanup_interval_ms(),
            threshold_days: default_threshold_days(),
            minimum_executions: default_minimum_executions(),
            exceptional_applications: Vec::new(),
            exceptional_threshold_days: default_exceptional_threshold_days(),
        }
    }
}

/// Count-based retention of orchestrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopApplicationCleanupConfig {
    /// Whether the agent runs.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Time between passes.
    #[serde(default = "default_top_interval_ms")]
    pub interval_ms: u64,
    /// Orchestrations kept per application.
    #[serde(default = "default_top_threshold")]
    pub threshold: usize,
    /// Applications fetched per index page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_top_interval_ms() -> u64 {
    10 * 60 * 1000
}

fn default_top_threshold() -> usize {
    2500
}

fn default_page_size() -> usize {
    100
}

impl Default for TopApplicationCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_top_interval_ms(),
            threshold: default_top_threshold(),
            page_size: default_page_size(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}
