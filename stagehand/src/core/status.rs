//! Execution status and execution type enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of execution being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// A run of a configured pipeline.
    Pipeline,
    /// An ad-hoc orchestration (a one-off sequence of tasks).
    Orchestration,
}

impl Default for ExecutionType {
    fn default() -> Self {
        Self::Pipeline
    }
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipeline => write!(f, "pipeline"),
            Self::Orchestration => write!(f, "orchestration"),
        }
    }
}

/// The status of an execution, stage or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Not yet started.
    NotStarted,
    /// Currently running (or polling).
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed, but the pipeline was told to continue.
    FailedContinue,
    /// Skipped without running.
    Skipped,
    /// Stopped; the branch halts without failing the execution.
    Stopped,
    /// Canceled by a user or by a failing sibling.
    Canceled,
    /// Failed terminally.
    Terminal,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "NOT_STARTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::FailedContinue => write!(f, "FAILED_CONTINUE"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Terminal => write!(f, "TERMINAL"),
        }
    }
}

impl ExecutionStatus {
    /// Returns true once the status can no longer change without a restart.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }

    /// Returns true if the status halts the branch it occurs in.
    #[must_use]
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Terminal | Self::Canceled | Self::Stopped)
    }

    /// Returns true if downstream work may proceed after this status.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped | Self::FailedContinue)
    }

    /// Every status in the complete set.
    #[must_use]
    pub fn complete_statuses() -> Vec<Self> {
        vec![
            Self::Succeeded,
            Self::FailedContinue,
            Self::Skipped,
            Self::Stopped,
            Self::Canceled,
            Self::Terminal,
        ]
    }
}
