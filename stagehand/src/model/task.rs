//! Task executions.

use crate::core::ExecutionStatus;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};

/// One task inside a stage.
///
/// Task ids are only unique within their stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    /// Task id, unique within the stage.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Identifier used to resolve the task implementation.
    pub implementing_task: String,
    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,
    /// When the task first started running.
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    /// When the task completed.
    #[serde(default)]
    pub end_time: Option<Timestamp>,
    /// Number of retries taken after retryable failures.
    #[serde(default)]
    pub retry_count: u32,
}

impl TaskExecution {
    /// Creates a not-started task.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        implementing_task: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            implementing_task: implementing_task.into(),
            status: ExecutionStatus::NotStarted,
            start_time: None,
            end_time: None,
            retry_count: 0,
        }
    }

    /// Marks the task running, keeping the original start time on re-entry.
    pub fn start(&mut self, now: Timestamp) {
        self.status = ExecutionStatus::Running;
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        self.end_time = None;
    }

    /// Marks the task complete with the given status.
    pub fn complete(&mut self, status: ExecutionStatus, now: Timestamp) {
        self.status = status;
        self.end_time = Some(now);
    }

    /// Stamps the end of the final attempt while the task is still `RUNNING`.
    ///
    /// The status moves once the follow-up `CompleteTask` is handled; until
    /// then a redelivered `RunTask` must not start another attempt.
    pub fn record_outcome(&mut self, now: Timestamp) {
        self.end_time = Some(now);
    }

    /// Returns true if the task's final attempt has run but its completion
    /// has not been handled yet.
    #[must_use]
    pub fn awaiting_completion(&self) -> bool {
        self.status == ExecutionStatus::Running && self.end_time.is_some()
    }

    /// Resets the task so it can run again.
    pub fn reset(&mut self) {
        self.status = ExecutionStatus::NotStarted;
        self.start_time = None;
        self.end_time = None;
        self.retry_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_start_keeps_first_start_time() {
        let mut task = TaskExecution::new("1", "deploy", "deploy");
        let first = Utc::now();
        task.start(first);
        task.start(first + Duration::seconds(10));
        assert_eq!(task.start_time, Some(first));
        assert_eq!(task.status, ExecutionStatus::Running);
    }

    #[test]
    fn test_recorded_outcome_awaits_completion() {
        let now = Utc::now();
        let mut task = TaskExecution::new("1", "deploy", "deploy");
        task.start(now);
        assert!(!task.awaiting_completion());

        task.record_outcome(now + Duration::seconds(1));
        assert!(task.awaiting_completion());

        task.complete(ExecutionStatus::Succeeded, now + Duration::seconds(2));
        assert!(!task.awaiting_completion());
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut task = TaskExecution::new("1", "deploy", "deploy");
        task.start(Utc::now());
        task.retry_count = 2;
        task.complete(ExecutionStatus::Terminal, Utc::now());
        task.reset();
        assert_eq!(task.status, ExecutionStatus::NotStarted);
        assert_eq!(task.retry_count, 0);
        assert!(task.start_time.is_none() && task.end_time.is_none());
    }
}
