//! Queue message schema.

use crate::core::{ExecutionStatus, ExecutionType};
use crate::model::{PipelineExecution, StageExecution, TaskExecution};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Messages that drive executions forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "camelCase")]
pub enum Message {
    /// Start a not-started execution.
    #[serde(rename_all = "camelCase")]
    StartExecution {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
    },
    /// Start a stage whose upstream stages are complete.
    #[serde(rename_all = "camelCase")]
    StartStage {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
        /// Stage id.
        stage_id: String,
    },
    /// Run one attempt of a task.
    #[serde(rename_all = "camelCase")]
    RunTask {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
        /// Stage id.
        stage_id: String,
        /// Task id.
        task_id: String,
        /// Implementing-task identifier.
        task_type: String,
    },
    /// Record a task's final status.
    #[serde(rename_all = "camelCase")]
    CompleteTask {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
        /// Stage id.
        stage_id: String,
        /// Task id.
        task_id: String,
        /// Status to record.
        status: ExecutionStatus,
        /// Status the task itself reported.
        original_status: ExecutionStatus,
    },
    /// Settle a stage after its tasks finished.
    #[serde(rename_all = "camelCase")]
    CompleteStage {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
        /// Stage id.
        stage_id: String,
    },
    /// Settle the execution if nothing is left to run.
    #[serde(rename_all = "camelCase")]
    CompleteExecution {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
    },
    /// Cancel one stage.
    #[serde(rename_all = "camelCase")]
    CancelStage {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
        /// Stage id.
        stage_id: String,
    },
    /// Cancel the whole execution.
    #[serde(rename_all = "camelCase")]
    CancelExecution {
        /// Execution type.
        execution_type: ExecutionType,
        /// Execution id.
        execution_id: String,
        /// Owning application.
        application: String,
        /// Who canceled.
        #[serde(default)]
        user: Option<String>,
        /// Why.
        #[serde(default)]
        reason: Option<String>,
    },
}

impl Message {
    /// `StartExecution` for an execution.
    #[must_use]
    pub fn start_execution(execution: &PipelineExecution) -> Self {
        Self::StartExecution {
            execution_type: execution.execution_type,
            execution_id: execution.id.clone(),
            application: execution.application.clone(),
        }
    }

    /// `StartStage` for a stage.
    #[must_use]
    pub fn start_stage(execution: &PipelineExecution, stage: &StageExecution) -> Self {
        Self::StartStage {
            execution_type: execution.execution_type,
            execution_id: execution.id.clone(),
            application: execution.application.clone(),
            stage_id: stage.id.clone(),
        }
    }

    /// `RunTask` for a task.
    #[must_use]
    pub fn run_task(
        execution: &PipelineExecution,
        stage: &StageExecution,
        task: &TaskExecution,
    ) -> Self {
        Self::RunTask {
            execution_type: execution.execution_type,
            execution_id: execution.id.clone(),
            application: execution.application.clone(),
            stage_id: stage.id.clone(),
            task_id: task.id.clone(),
            task_type: task.implementing_task.clone(),
        }
    }

    /// `CompleteStage` for a stage.
    #[must_use]
    pub fn complete_stage(execution: &PipelineExecution, stage: &StageExecution) -> Self {
        Self::CompleteStage {
            execution_type: execution.execution_type,
            execution_id: execution.id.clone(),
            application: execution.application.clone(),
            stage_id: stage.id.clone(),
        }
    }

    /// `CompleteExecution` for an execution.
    #[must_use]
    pub fn complete_execution(execution: &PipelineExecution) -> Self {
        Self::CompleteExecution {
            execution_type: execution.execution_type,
            execution_id: execution.id.clone(),
            application: execution.application.clone(),
        }
    }

    /// `CancelStage` for a stage.
    #[must_use]
    pub fn cancel_stage(execution: &PipelineExecution, stage: &StageExecution) -> Self {
        Self::CancelStage {
            execution_type: execution.execution_type,
            execution_id: execution.id.clone(),
            application: execution.application.clone(),
            stage_id: stage.id.clone(),
        }
    }

    /// The message type tag.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::StartExecution { .. } => "startExecution",
            Self::StartStage { .. } => "startStage",
            Self::RunTask { .. } => "runTask",
            Self::CompleteTask { .. } => "completeTask",
            Self::CompleteStage { .. } => "completeStage",
            Self::CompleteExecution { .. } => "completeExecution",
            Self::CancelStage { .. } => "cancelStage",
            Self::CancelExecution { .. } => "cancelExecution",
        }
    }

    /// The target execution type.
    #[must_use]
    pub fn execution_type(&self) -> ExecutionType {
        match self {
            Self::StartExecution { execution_type, .. }
            | Self::StartStage { execution_type, .. }
            | Self::RunTask { execution_type, .. }
            | Self::CompleteTask { execution_type, .. }
            | Self::CompleteStage { execution_type, .. }
            | Self::CompleteExecution { execution_type, .. }
            | Self::CancelStage { execution_type, .. }
            | Self::CancelExecution { execution_type, .. } => *execution_type,
        }
    }

    /// The target execution id.
    #[must_use]
    pub fn execution_id(&self) -> &str {
        match self {
            Self::StartExecution { execution_id, .. }
            | Self::StartStage { execution_id, .. }
            | Self::RunTask { execution_id, .. }
            | Self::CompleteTask { execution_id, .. }
            | Self::CompleteStage { execution_id, .. }
            | Self::CompleteExecution { execution_id, .. }
            | Self::CancelStage { execution_id, .. }
            | Self::CancelExecution { execution_id, .. } => execution_id,
        }
    }

    /// The owning application.
    #[must_use]
    pub fn application(&self) -> &str {
        match self {
            Self::StartExecution { application, .. }
            | Self::StartStage { application, .. }
            | Self::RunTask { application, .. }
            | Self::CompleteTask { application, .. }
            | Self::CompleteStage { application, .. }
            | Self::CompleteExecution { application, .. }
            | Self::CancelStage { application, .. }
            | Self::CancelExecution { application, .. } => application,
        }
    }

    /// The target stage id, for stage and task messages.
    #[must_use]
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::StartStage { stage_id, .. }
            | Self::RunTask { stage_id, .. }
            | Self::CompleteTask { stage_id, .. }
            | Self::CompleteStage { stage_id, .. }
            | Self::CancelStage { stage_id, .. } => Some(stage_id),
            Self::StartExecution { .. }
            | Self::CompleteExecution { .. }
            | Self::CancelExecution { .. } => None,
        }
    }

    /// The target task id, for task messages.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::RunTask { task_id, .. } | Self::CompleteTask { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// SHA-256 of the serialized message, used to coalesce duplicates.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }
}

/// A message plus its delivery count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// The message.
    #[serde(flatten)]
    pub message: Message,
    /// How many times the message has been delivered.
    #[serde(default)]
    pub attempt_count: u32,
}

impl Envelope {
    /// Wraps a message that has not been delivered yet.
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message,
            attempt_count: 0,
        }
    }
}
