//! Stage executions.

use super::context::StageContext;
use super::task::TaskExecution;
use crate::core::ExecutionStatus;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A named step of an execution, made of sequentially run tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    /// Stage id.
    pub id: String,
    /// Stable reference id used by the stage graph.
    pub ref_id: String,
    /// Stage type (e.g. "deploy", "wait").
    #[serde(rename = "type")]
    pub stage_type: String,
    /// Display name.
    pub name: String,
    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,
    /// Reference ids of stages that must complete first.
    #[serde(default)]
    pub requisite_stage_ref_ids: Vec<String>,
    /// Cross-task state.
    #[serde(default)]
    pub context: StageContext,
    /// Values published to downstream stages.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Tasks in execution order.
    #[serde(default)]
    pub tasks: Vec<TaskExecution>,
    /// When the stage started.
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    /// When the stage completed.
    #[serde(default)]
    pub end_time: Option<Timestamp>,
}

impl StageExecution {
    /// Creates a not-started stage.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        ref_id: impl Into<String>,
        stage_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ref_id: ref_id.into(),
            stage_type: stage_type.into(),
            name: name.into(),
            status: ExecutionStatus::NotStarted,
            requisite_stage_ref_ids: Vec::new(),
            context: StageContext::new(),
            outputs: BTreeMap::new(),
            tasks: Vec::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Returns true if the stage has no upstream stages.
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.requisite_stage_ref_ids.is_empty()
    }

    /// Looks up a task by id.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Looks up a task by id, mutably.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Returns the task that follows `task_id`, if any.
    #[must_use]
    pub fn next_task(&self, task_id: &str) -> Option<&TaskExecution> {
        let index = self.tasks.iter().position(|t| t.id == task_id)?;
        self.tasks.get(index + 1)
    }

    /// The status a failing task gives this stage.
    ///
    /// `continuePipeline` turns a failure into `FAILED_CONTINUE`;
    /// `failPipeline = false` turns it into `STOPPED`.
    #[must_use]
    pub fn failure_status(&self, default: ExecutionStatus) -> ExecutionStatus {
        if self.context.continue_pipeline() {
            ExecutionStatus::FailedContinue
        } else if !self.context.fail_pipeline() {
            ExecutionStatus::Stopped
        } else {
            default
        }
    }

    /// Derives the stage status from its tasks.
    ///
    /// The first halting task decides; otherwise any `FAILED_CONTINUE` wins;
    /// otherwise the stage succeeded.
    #[must_use]
    pub fn derive_status(&self) -> ExecutionStatus {
        if let Some(halted) = self.tasks.iter().find(|t| t.status.is_halt()) {
            return halted.status;
        }
        if self
            .tasks
            .iter()
            .any(|t| t.status == ExecutionStatus::FailedContinue)
        {
            return ExecutionStatus::FailedContinue;
        }
        ExecutionStatus::Succeeded
    }

    /// Completes the stage, settling any task that never finished.
    ///
    /// Tasks that never ran become `SKIPPED` and tasks still running become
    /// `CANCELED`, so a complete stage only ever holds complete tasks.
    pub fn complete(&mut self, status: ExecutionStatus, now: Timestamp) {
        for task in &mut self.tasks {
            match task.status {
                ExecutionStatus::NotStarted => task.complete(ExecutionStatus::Skipped, now),
                ExecutionStatus::Running => task.complete(ExecutionStatus::Canceled, now),
                _ => {}
            }
        }
        self.status = status;
        self.end_time = Some(now);
    }

    /// Resets the stage and its tasks to `NOT_STARTED`.
    pub fn reset(&mut self) {
        self.status = ExecutionStatus::NotStarted;
        self.start_time = None;
        self.end_time = None;
        for task in &mut self.tasks {
            task.reset();
        }
    }
}
