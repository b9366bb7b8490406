//! Live settings that can change without a restart.

use dashmap::DashMap;
use serde_json::Value;
use std::fmt::Debug;

/// Well-known dynamic setting keys.
pub mod keys {
    /// Whether the dual repository falls back to the secondary on not-found.
    pub const READ_FALLBACK_ENABLED: &str = "execution-repository.dual.read-fallback.enabled";
    /// Minimum backoff for every polling task.
    pub const GLOBAL_BACKOFF_MS: &str = "tasks.global.backoff-period-ms";
    /// Invocations slower than this are logged.
    pub const WARNING_INVOCATION_TIME_MS: &str = "tasks.warning-invocation-time-ms";

    /// Minimum backoff for polling tasks against one cloud provider.
    #[must_use]
    pub fn provider_backoff_ms(provider: &str) -> String {
        format!("tasks.{provider}.backoff-period-ms")
    }
}

/// A source of live settings.
///
/// Lookups happen on every use, so implementations must be cheap.
pub trait DynamicConfig: Send + Sync + Debug {
    /// Reads a raw value.
    fn get_value(&self, key: &str) -> Option<Value>;

    /// Reads a boolean, falling back to `default` when absent or mistyped.
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_value(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Reads an unsigned integer, falling back to `default` when absent or mistyped.
    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get_value(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }
}

/// A concurrent in-memory settings store.
#[derive(Debug, Default)]
pub struct InMemoryDynamicConfig {
    values: DashMap<String, Value>,
}

impl InMemoryDynamicConfig {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Removes a value.
    pub fn unset(&self, key: &str) {
        self.values.remove(key);
    }
}

impl DynamicConfig for InMemoryDynamicConfig {
    fn get_value(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|v| v.value().clone())
    }
}
