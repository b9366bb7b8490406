//! Stage-level handlers.

use super::Dispatcher;
use crate::core::ExecutionStatus;
use crate::errors::EngineError;
use crate::model::{PipelineExecution, StageExecution};
use crate::queue::Message;
use tracing::{info, warn};

impl Dispatcher {
    pub(super) async fn start_stage(
        &self,
        message: &Message,
        stage_id: &str,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.load_active(message).await? else {
            return Ok(());
        };
        let Some(stage) = execution.stage(stage_id) else {
            self.drop_message(message, "stage not found");
            return Ok(());
        };
        if stage.status != ExecutionStatus::NotStarted {
            self.drop_message(message, "stage already started");
            return Ok(());
        }
        if !execution.upstream_succeeded(stage) {
            self.drop_message(message, "upstream stages not complete");
            return Ok(());
        }
        if execution.canceled {
            self.drop_message(message, "execution canceled");
            return Ok(());
        }

        let now = self.clock.now();
        let mut stage = stage.clone();
        stage.status = ExecutionStatus::Running;
        stage.start_time = Some(now);
        stage.end_time = None;

        let follow_up = match stage.tasks.first_mut() {
            Some(first) => {
                first.start(now);
                let first = first.clone();
                Message::run_task(&execution, &stage, &first)
            }
            None => Message::complete_stage(&execution, &stage),
        };

        self.repository
            .store_stage(execution.execution_type, &execution.id, &stage)
            .await?;
        info!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            stage_type = %stage.stage_type,
            "Stage started"
        );
        self.push(follow_up).await
    }

    pub(super) async fn complete_stage(
        &self,
        message: &Message,
        stage_id: &str,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.load_active(message).await? else {
            return Ok(());
        };
        let Some(stage) = execution.stage(stage_id) else {
            self.drop_message(message, "stage not found");
            return Ok(());
        };
        if stage.status.is_complete() {
            self.drop_message(message, "stage already complete");
            return Ok(());
        }

        let mut stage = stage.clone();
        let status = stage.derive_status();
        stage.complete(status, self.clock.now());
        self.repository
            .store_stage(execution.execution_type, &execution.id, &stage)
            .await?;
        info!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            %status,
            "Stage complete"
        );

        if !status.is_successful() {
            return self.push(Message::complete_execution(&execution)).await;
        }

        // Parallel branches write their own stages, so decide from a fresh read.
        let execution = self
            .repository
            .get(execution.execution_type, &execution.id)
            .await?;
        let Some(stage) = execution.stage(stage_id) else {
            return Ok(());
        };

        let startable: Vec<Message> = execution
            .downstream_stages(stage)
            .into_iter()
            .filter(|s| execution.is_startable(s))
            .map(|s| Message::start_stage(&execution, s))
            .collect();
        if startable.is_empty() {
            return self.push(Message::complete_execution(&execution)).await;
        }
        for start in startable {
            self.push(start).await?;
        }
        Ok(())
    }

    pub(super) async fn cancel_stage(
        &self,
        message: &Message,
        stage_id: &str,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.load_active(message).await? else {
            return Ok(());
        };
        let Some(stage) = execution.stage(stage_id) else {
            self.drop_message(message, "stage not found");
            return Ok(());
        };
        if stage.status.is_complete() {
            self.drop_message(message, "stage already complete");
            return Ok(());
        }

        self.cancel_stage_in_place(&execution, stage.clone(), execution.canceled_by.as_deref())
            .await?;
        self.push(Message::complete_execution(&execution)).await
    }

    /// Cancels a stage: gives running tasks a chance to clean up, settles the
    /// stage as `CANCELED` and cascades to a linked child execution.
    pub(super) async fn cancel_stage_in_place(
        &self,
        execution: &PipelineExecution,
        mut stage: StageExecution,
        user: Option<&str>,
    ) -> Result<(), EngineError> {
        let running: Vec<String> = stage
            .tasks
            .iter()
            .filter(|t| t.status == ExecutionStatus::Running)
            .map(|t| t.implementing_task.clone())
            .collect();
        for implementing_task in running {
            if let Some(task) = self.tasks.resolve(&implementing_task) {
                if let Some(result) = task.on_cancel(&stage).await {
                    stage.context.merge(&result.context);
                    stage.outputs.extend(result.outputs);
                }
            }
        }

        stage.complete(ExecutionStatus::Canceled, self.clock.now());
        self.repository
            .store_stage(execution.execution_type, &execution.id, &stage)
            .await?;
        info!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            "Stage canceled"
        );

        if let Some(child) = stage.context.child_execution() {
            let cascade = Message::CancelExecution {
                execution_type: child.execution_type,
                execution_id: child.execution_id.clone(),
                application: child.application.clone(),
                user: user.map(str::to_string),
                reason: Some(format!(
                    "Parent stage {} of {} was canceled",
                    stage.id, execution.id
                )),
            };
            // Cascading is best effort; the parent is already canceled.
            if let Err(err) = self.push(cascade).await {
                warn!(
                    execution_id = %execution.id,
                    stage_id = %stage.id,
                    child_execution_id = %child.execution_id,
                    error = %err,
                    "Failed to cascade cancellation to child execution"
                );
            }
        }
        Ok(())
    }
}
