//! The task trait.

use super::result::TaskResult;
use crate::exceptions::TaskFailure;
use crate::model::StageExecution;
use async_trait::async_trait;
use std::time::Duration;

/// Backoff and timeout declared by a polling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    /// Delay before the next poll after a `RUNNING` result.
    pub backoff_period: Duration,
    /// Total time the task may keep polling.
    pub timeout: Duration,
}

impl PollingPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(backoff_period: Duration, timeout: Duration) -> Self {
        Self {
            backoff_period,
            timeout,
        }
    }
}

/// Trait for task implementations.
///
/// Implementations receive the stage by reference and report progress
/// through the returned [`TaskResult`]; they never mutate shared state.
#[async_trait]
pub trait Task: Send + Sync {
    /// The implementing-task identifier this task is registered under.
    fn name(&self) -> &str;

    /// The polling policy, or `None` for a synchronous task.
    fn polling(&self) -> Option<PollingPolicy> {
        None
    }

    /// Runs one attempt of the task.
    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskFailure>;

    /// Called when the stage is canceled while this task is running.
    ///
    /// A returned result's context and outputs are merged into the stage.
    async fn on_cancel(&self, _stage: &StageExecution) -> Option<TaskResult> {
        None
    }
}
