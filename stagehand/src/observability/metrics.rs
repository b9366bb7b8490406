//! Metrics sink trait and implementations.
//!
//! Emission is fire-and-forget: sinks never fail and never block the engine.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt::Debug;
use std::time::Duration;
use tracing::debug;

/// Metric names emitted by the engine.
pub mod metric_names {
    /// A message was dropped by the idempotency guard.
    pub const MESSAGE_DROPPED: &str = "queue.message.dropped";
    /// Duration of one task invocation.
    pub const TASK_INVOCATION_DURATION: &str = "task.invocations.duration";
    /// A task was re-enqueued after a retryable failure.
    pub const TASK_RETRIES: &str = "task.retries";
    /// A polling task exceeded its timeout.
    pub const TASK_TIMEOUTS: &str = "task.timeouts";
    /// The per-task lock was already held.
    pub const TASK_LOCK_CONTENDED: &str = "task.lock.contended";
    /// Executions deleted by a cleanup agent.
    pub const CLEANUP_DELETED: &str = "cleanup.executions.deleted";
    /// Per-application cleanup failures.
    pub const CLEANUP_ERRORS: &str = "cleanup.errors";
    /// Duration of one cleanup pass.
    pub const CLEANUP_PASS_DURATION: &str = "cleanup.pass.duration";
    /// Reads served by the secondary repository.
    pub const DUAL_FALLBACK_READS: &str = "repository.dual.fallback.reads";
    /// Secondary list calls that timed out or failed.
    pub const DUAL_SECONDARY_FAILURES: &str = "repository.dual.secondary.failures";
}

/// Trait for metric sinks.
pub trait MetricsSink: Send + Sync + Debug {
    /// Increments a counter.
    fn increment_counter(&self, name: &str, tags: &[(&str, &str)], amount: u64);

    /// Records a timer sample.
    fn record_timer(&self, name: &str, tags: &[(&str, &str)], duration: Duration);
}

/// A sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsSink;

impl MetricsSink for NoOpMetricsSink {
    fn increment_counter(&self, _name: &str, _tags: &[(&str, &str)], _amount: u64) {}

    fn record_timer(&self, _name: &str, _tags: &[(&str, &str)], _duration: Duration) {}
}

/// A sink that logs every sample at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMetricsSink;

impl MetricsSink for LoggingMetricsSink {
    fn increment_counter(&self, name: &str, tags: &[(&str, &str)], amount: u64) {
        debug!(metric = name, tags = ?tags, amount, "counter");
    }

    fn record_timer(&self, name: &str, tags: &[(&str, &str)], duration: Duration) {
        debug!(
            metric = name,
            tags = ?tags,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "timer"
        );
    }
}

/// A recording sink for tests and local inspection.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    counters: DashMap<String, u64>,
    timers: RwLock<Vec<(String, Duration)>>,
}

impl InMemoryMetricsSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, tags: &[(&str, &str)]) -> String {
        if tags.is_empty() {
            return name.to_string();
        }
        let mut sorted: Vec<_> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        sorted.sort();
        format!("{name}{{{}}}", sorted.join(","))
    }

    /// Returns a counter's total across all tag sets.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        let prefix = format!("{name}{{");
        self.counters
            .iter()
            .filter(|e| e.key() == name || e.key().starts_with(&prefix))
            .map(|e| *e.value())
            .sum()
    }

    /// Returns a counter's value for one exact tag set.
    #[must_use]
    pub fn counter_with(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&Self::key(name, tags))
            .map_or(0, |v| *v.value())
    }

    /// Returns how many samples a timer has recorded.
    #[must_use]
    pub fn timer_count(&self, name: &str) -> usize {
        let prefix = format!("{name}{{");
        self.timers
            .read()
            .iter()
            .filter(|(k, _)| k == name || k.starts_with(&prefix))
            .count()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn increment_counter(&self, name: &str, tags: &[(&str, &str)], amount: u64) {
        *self.counters.entry(Self::key(name, tags)).or_insert(0) += amount;
    }

    fn record_timer(&self, name: &str, tags: &[(&str, &str)], duration: Duration) {
        self.timers.write().push((Self::key(name, tags), duration));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_aggregate_across_tags() {
        let sink = InMemoryMetricsSink::new();
        sink.increment_counter(metric_names::CLEANUP_DELETED, &[("application", "a")], 3);
        sink.increment_counter(metric_names::CLEANUP_DELETED, &[("application", "b")], 2);
        sink.increment_counter(metric_names::CLEANUP_DELETED, &[("application", "a")], 1);

        assert_eq!(sink.counter(metric_names::CLEANUP_DELETED), 6);
        assert_eq!(
            sink.counter_with(metric_names::CLEANUP_DELETED, &[("application", "a")]),
            4
        );
        assert_eq!(sink.counter(metric_names::CLEANUP_ERRORS), 0);
    }

    #[test]
    fn test_tag_order_does_not_matter() {
        let sink = InMemoryMetricsSink::new();
        sink.increment_counter("c", &[("a", "1"), ("b", "2")], 1);
        assert_eq!(sink.counter_with("c", &[("b", "2"), ("a", "1")]), 1);
    }

    #[test]
    fn test_timers() {
        let sink = InMemoryMetricsSink::new();
        sink.record_timer("t", &[], Duration::from_millis(5));
        sink.record_timer("t", &[("x", "y")], Duration::from_millis(7));
        assert_eq!(sink.timer_count("t"), 2);
        assert_eq!(sink.timer_count("other"), 0);
    }

    #[test]
    fn test_noop_and_logging_never_fail() {
        NoOpMetricsSink.increment_counter("c", &[], 1);
        LoggingMetricsSink.record_timer("t", &[("k", "v")], Duration::from_secs(1));
    }
}
