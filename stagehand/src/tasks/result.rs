//! Task results.

use crate::core::ExecutionStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The outcome of one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// The resulting status.
    pub status: ExecutionStatus,
    /// Entries merged into the stage context.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Entries merged into the stage outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Failure reason for terminal results.
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResult {
    /// Creates a result with the given status.
    #[must_use]
    pub fn with_status(status: ExecutionStatus) -> Self {
        Self {
            status,
            context: BTreeMap::new(),
            outputs: BTreeMap::new(),
            error: None,
        }
    }

    /// The task finished successfully.
    #[must_use]
    pub fn succeeded() -> Self {
        Self::with_status(ExecutionStatus::Succeeded)
    }

    /// The task is still in progress.
    #[must_use]
    pub fn running() -> Self {
        Self::with_status(ExecutionStatus::Running)
    }

    /// The task chose not to run.
    #[must_use]
    pub fn skipped() -> Self {
        Self::with_status(ExecutionStatus::Skipped)
    }

    /// The task was canceled.
    #[must_use]
    pub fn canceled() -> Self {
        Self::with_status(ExecutionStatus::Canceled)
    }

    /// The task failed terminally.
    #[must_use]
    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::with_status(ExecutionStatus::Terminal)
        }
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Adds an output entry.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_factories() {
        assert_eq!(TaskResult::succeeded().status, ExecutionStatus::Succeeded);
        assert_eq!(TaskResult::running().status, ExecutionStatus::Running);
        assert_eq!(TaskResult::skipped().status, ExecutionStatus::Skipped);
        assert_eq!(TaskResult::canceled().status, ExecutionStatus::Canceled);

        let failed = TaskResult::terminal("quota exceeded");
        assert_eq!(failed.status, ExecutionStatus::Terminal);
        assert_eq!(failed.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn test_builders() {
        let result = TaskResult::succeeded()
            .with_context("serverGroup", "app-v002")
            .with_output("deployedAt", json!(1_700_000_000));
        assert_eq!(result.context["serverGroup"], json!("app-v002"));
        assert_eq!(result.outputs["deployedAt"], json!(1_700_000_000));
    }
}
