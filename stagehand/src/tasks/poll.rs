//! Generic "poll an external operation until it settles" state machine.
//!
//! Provider-specific behavior lives entirely in [`ExternalOperation`]
//! implementations and their [`StateMapping`]. The machinery here only maps
//! observed states to task results and enforces the timeout.

use super::result::TaskResult;
use super::task::{PollingPolicy, Task};
use crate::exceptions::TaskFailure;
use crate::model::StageExecution;
use crate::utils::Timestamp;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

/// Context key holding the last observed external state.
const EXTERNAL_STATE_KEY: &str = "externalState";

/// A snapshot of an external operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalStatus {
    /// The provider's state name.
    pub state: String,
    /// The full provider payload.
    pub payload: Value,
}

impl ExternalStatus {
    /// Creates a status with an empty payload.
    #[must_use]
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            payload: Value::Null,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// What an observed state means for the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The operation finished successfully.
    Succeeded,
    /// The operation is in progress, or not visible yet.
    Running,
    /// The operation failed.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
    /// The state is not in the mapping.
    Unrecognized {
        /// The unknown state.
        state: String,
    },
}

/// Maps provider state names onto poll outcomes.
#[derive(Debug, Clone, Default)]
pub struct StateMapping {
    succeeded: HashSet<String>,
    running: HashSet<String>,
    failed: HashSet<String>,
    reason_pointers: Vec<String>,
}

impl StateMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds success states.
    #[must_use]
    pub fn succeeded(mut self, states: &[&str]) -> Self {
        self.succeeded.extend(states.iter().map(|s| (*s).to_string()));
        self
    }

    /// Adds in-progress states.
    #[must_use]
    pub fn running(mut self, states: &[&str]) -> Self {
        self.running.extend(states.iter().map(|s| (*s).to_string()));
        self
    }

    /// Adds failure states.
    #[must_use]
    pub fn failed(mut self, states: &[&str]) -> Self {
        self.failed.extend(states.iter().map(|s| (*s).to_string()));
        self
    }

    /// Adds a JSON pointer (e.g. `/error/message`) to read failure reasons from.
    ///
    /// Pointers are tried in the order they were added.
    #[must_use]
    pub fn reason_at(mut self, pointer: impl Into<String>) -> Self {
        self.reason_pointers.push(pointer.into());
        self
    }

    /// Maps an observation. `None` means the operation is not visible yet.
    #[must_use]
    pub fn map(&self, status: Option<&ExternalStatus>) -> PollOutcome {
        let Some(status) = status else {
            return PollOutcome::Running;
        };

        if self.succeeded.contains(&status.state) {
            PollOutcome::Succeeded
        } else if self.running.contains(&status.state) {
            PollOutcome::Running
        } else if self.failed.contains(&status.state) {
            PollOutcome::Failed {
                reason: self.extract_reason(status),
            }
        } else {
            PollOutcome::Unrecognized {
                state: status.state.clone(),
            }
        }
    }

    fn extract_reason(&self, status: &ExternalStatus) -> String {
        self.reason_pointers
            .iter()
            .filter_map(|p| status.payload.pointer(p))
            .filter_map(Value::as_str)
            .find(|s| !s.trim().is_empty())
            .map_or_else(
                || format!("Operation reached failure state {}", status.state),
                String::from,
            )
    }
}

/// Fails with a timeout once `now` is past `started + policy.timeout`.
pub fn check_timeout(
    operation: &str,
    policy: &PollingPolicy,
    started: Option<Timestamp>,
    now: Timestamp,
) -> Result<(), TaskFailure> {
    let Some(started) = started else {
        return Ok(());
    };
    let elapsed = (now - started).to_std().unwrap_or_default();
    if elapsed > policy.timeout {
        return Err(TaskFailure::Timeout {
            operation: operation.to_string(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            timeout_ms: u64::try_from(policy.timeout.as_millis()).unwrap_or(u64::MAX),
        });
    }
    Ok(())
}

/// A provider operation that can be polled.
#[async_trait]
pub trait ExternalOperation: Send + Sync {
    /// The implementing-task identifier.
    fn name(&self) -> &str;

    /// Backoff and timeout for polling.
    fn policy(&self) -> PollingPolicy;

    /// How provider states map onto outcomes.
    fn state_mapping(&self) -> &StateMapping;

    /// Fetches the current state; `Ok(None)` if the operation is not visible yet.
    async fn fetch_status(
        &self,
        stage: &StageExecution,
    ) -> Result<Option<ExternalStatus>, TaskFailure>;
}

/// Adapts an [`ExternalOperation`] into a polling [`Task`].
#[derive(Debug)]
pub struct PollingTask<O> {
    operation: O,
}

impl<O: ExternalOperation> PollingTask<O> {
    /// Wraps an operation.
    #[must_use]
    pub fn new(operation: O) -> Self {
        Self { operation }
    }

    /// Returns the wrapped operation.
    #[must_use]
    pub fn operation(&self) -> &O {
        &self.operation
    }
}

#[async_trait]
impl<O: ExternalOperation> Task for PollingTask<O> {
    fn name(&self) -> &str {
        self.operation.name()
    }

    fn polling(&self) -> Option<PollingPolicy> {
        Some(self.operation.policy())
    }

    async fn execute(&self, stage: &StageExecution) -> Result<TaskResult, TaskFailure> {
        let status = self.operation.fetch_status(stage).await?;
        let observed = status
            .as_ref()
            .map_or_else(|| "NOT_FOUND".to_string(), |s| s.state.clone());

        match self.operation.state_mapping().map(status.as_ref()) {
            PollOutcome::Succeeded => {
                Ok(TaskResult::succeeded().with_context(EXTERNAL_STATE_KEY, observed))
            }
            PollOutcome::Running => {
                Ok(TaskResult::running().with_context(EXTERNAL_STATE_KEY, observed))
            }
            PollOutcome::Failed { reason } => {
                Ok(TaskResult::terminal(reason).with_context(EXTERNAL_STATE_KEY, observed))
            }
            PollOutcome::Unrecognized { state } => Err(TaskFailure::UnrecognizedState {
                operation: self.operation.name().to_string(),
                state,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn stack_mapping() -> StateMapping {
        StateMapping::new()
            .succeeded(&["CREATE_COMPLETE", "UPDATE_COMPLETE"])
            .running(&["CREATE_IN_PROGRESS", "UPDATE_IN_PROGRESS"])
            .failed(&["CREATE_FAILED", "ROLLBACK_COMPLETE"])
            .reason_at("/statusReason")
            .reason_at("/error/message")
    }

    struct StaticOperation {
        mapping: StateMapping,
        status: Option<ExternalStatus>,
    }

    #[async_trait]
    impl ExternalOperation for StaticOperation {
        fn name(&self) -> &str {
            "waitForStack"
        }

        fn policy(&self) -> PollingPolicy {
            PollingPolicy::new(Duration::from_secs(10), Duration::from_secs(600))
        }

        fn state_mapping(&self) -> &StateMapping {
            &self.mapping
        }

        async fn fetch_status(
            &self,
            _stage: &StageExecution,
        ) -> Result<Option<ExternalStatus>, TaskFailure> {
            Ok(self.status.clone())
        }
    }

    #[test]
    fn test_mapping_outcomes() {
        let mapping = stack_mapping();
        assert_eq!(
            mapping.map(Some(&ExternalStatus::new("CREATE_COMPLETE"))),
            PollOutcome::Succeeded
        );
        assert_eq!(
            mapping.map(Some(&ExternalStatus::new("UPDATE_IN_PROGRESS"))),
            PollOutcome::Running
        );
        assert_eq!(mapping.map(None), PollOutcome::Running);
        assert_eq!(
            mapping.map(Some(&ExternalStatus::new("DELETE_SKIPPED"))),
            PollOutcome::Unrecognized {
                state: "DELETE_SKIPPED".to_string()
            }
        );
    }

    #[test]
    fn test_failure_reason_extraction() {
        let mapping = stack_mapping();
        let status = ExternalStatus::new("CREATE_FAILED")
            .with_payload(json!({"statusReason": "", "error": {"message": "Bucket exists"}}));
        assert_eq!(
            mapping.map(Some(&status)),
            PollOutcome::Failed {
                reason: "Bucket exists".to_string()
            }
        );

        let bare = ExternalStatus::new("ROLLBACK_COMPLETE");
        assert_eq!(
            mapping.map(Some(&bare)),
            PollOutcome::Failed {
                reason: "Operation reached failure state ROLLBACK_COMPLETE".to_string()
            }
        );
    }

    #[test]
    fn test_check_timeout() {
        let policy = PollingPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        let started = Utc::now();

        assert!(check_timeout("wait", &policy, Some(started), started + chrono::Duration::seconds(59)).is_ok());
        assert!(check_timeout("wait", &policy, None, started).is_ok());

        let err = check_timeout("wait", &policy, Some(started), started + chrono::Duration::seconds(61))
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_polling_task_not_found_is_running() {
        let task = PollingTask::new(StaticOperation {
            mapping: stack_mapping(),
            status: None,
        });
        let stage = StageExecution::new("s", "1", "deployStack", "Deploy");

        let result = task.execute(&stage).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Running);
        assert_eq!(result.context[EXTERNAL_STATE_KEY], json!("NOT_FOUND"));
        assert!(task.polling().is_some());
    }

    #[tokio::test]
    async fn test_polling_task_fails_closed_on_unknown_state() {
        let task = PollingTask::new(StaticOperation {
            mapping: stack_mapping(),
            status: Some(ExternalStatus::new("IMPORT_IN_PROGRESS")),
        });
        let stage = StageExecution::new("s", "1", "deployStack", "Deploy");

        let err = task.execute(&stage).await.unwrap_err();
        assert!(matches!(err, TaskFailure::UnrecognizedState { .. }));
    }

    #[tokio::test]
    async fn test_polling_task_failure_is_terminal() {
        let task = PollingTask::new(StaticOperation {
            mapping: stack_mapping(),
            status: Some(
                ExternalStatus::new("CREATE_FAILED").with_payload(json!({"statusReason": "Limit exceeded"})),
            ),
        });
        let stage = StageExecution::new("s", "1", "deployStack", "Deploy");

        let result = task.execute(&stage).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Terminal);
        assert_eq!(result.error.as_deref(), Some("Limit exceeded"));
    }
}
