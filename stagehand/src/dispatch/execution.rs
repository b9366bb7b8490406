//! Execution-level handlers.

use super::Dispatcher;
use crate::core::ExecutionStatus;
use crate::errors::EngineError;
use crate::model::PipelineExecution;
use crate::queue::Message;
use std::collections::BTreeMap;
use tracing::info;

impl Dispatcher {
    pub(super) async fn start_execution(&self, message: &Message) -> Result<(), EngineError> {
        let Some(execution) = self.load_active(message).await? else {
            return Ok(());
        };
        if execution.status != ExecutionStatus::NotStarted {
            self.drop_message(message, "execution already started");
            return Ok(());
        }

        if execution.canceled {
            info!(
                execution_id = %execution.id,
                application = %execution.application,
                "Execution canceled before it started"
            );
            self.repository
                .update_status(execution.execution_type, &execution.id, ExecutionStatus::Canceled)
                .await?;
            return Ok(());
        }

        self.repository
            .update_status(execution.execution_type, &execution.id, ExecutionStatus::Running)
            .await?;
        info!(
            execution_id = %execution.id,
            application = %execution.application,
            execution_type = %execution.execution_type,
            "Execution started"
        );

        let initial = execution.initial_stages();
        if initial.is_empty() {
            return self.push(Message::complete_execution(&execution)).await;
        }
        for stage in initial {
            self.push(Message::start_stage(&execution, stage)).await?;
        }
        Ok(())
    }

    pub(super) async fn complete_execution(&self, message: &Message) -> Result<(), EngineError> {
        let Some(mut execution) = self.load_active(message).await? else {
            return Ok(());
        };

        let halted = if execution
            .stages
            .iter()
            .any(|s| s.status == ExecutionStatus::Terminal)
        {
            Some(ExecutionStatus::Terminal)
        } else if execution
            .stages
            .iter()
            .any(|s| s.status == ExecutionStatus::Canceled)
        {
            Some(ExecutionStatus::Canceled)
        } else {
            None
        };

        if let Some(status) = halted {
            // A queued CancelStage would be dropped once the execution settles.
            let running: Vec<_> = execution
                .stages
                .iter()
                .filter(|s| s.status == ExecutionStatus::Running)
                .cloned()
                .collect();
            if !running.is_empty() {
                let user = execution.canceled_by.clone();
                for stage in running {
                    self.cancel_stage_in_place(&execution, stage, user.as_deref())
                        .await?;
                }
                execution = self
                    .repository
                    .get(execution.execution_type, &execution.id)
                    .await?;
            }
            return self.settle(&mut execution, status).await;
        }

        if execution
            .stages
            .iter()
            .any(|s| s.status == ExecutionStatus::Running)
        {
            return Ok(());
        }

        let startable: Vec<Message> = execution
            .stages
            .iter()
            .filter(|s| execution.is_startable(s))
            .map(|s| Message::start_stage(&execution, s))
            .collect();
        if !startable.is_empty() {
            for start in startable {
                self.push(start).await?;
            }
            return Ok(());
        }

        let status = if execution.canceled {
            ExecutionStatus::Canceled
        } else {
            ExecutionStatus::Succeeded
        };
        self.settle(&mut execution, status).await
    }

    /// Folds stage outputs into the execution and records its final status.
    async fn settle(
        &self,
        execution: &mut PipelineExecution,
        status: ExecutionStatus,
    ) -> Result<(), EngineError> {
        let mut outputs: BTreeMap<String, serde_json::Value> = execution.outputs.clone();
        for stage in &execution.stages {
            outputs.extend(stage.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if outputs != execution.outputs {
            execution.outputs = outputs;
            self.repository.store(execution).await?;
        }

        self.repository
            .update_status(execution.execution_type, &execution.id, status)
            .await?;
        info!(
            execution_id = %execution.id,
            application = %execution.application,
            %status,
            "Execution complete"
        );
        Ok(())
    }

    pub(super) async fn cancel_execution(
        &self,
        message: &Message,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.load_active(message).await? else {
            return Ok(());
        };

        self.repository
            .cancel(execution.execution_type, &execution.id, user, reason)
            .await?;

        for stage in &execution.stages {
            if stage.status == ExecutionStatus::Running {
                self.cancel_stage_in_place(&execution, stage.clone(), user)
                    .await?;
            }
        }

        self.repository
            .update_status(execution.execution_type, &execution.id, ExecutionStatus::Canceled)
            .await?;
        info!(
            execution_id = %execution.id,
            application = %execution.application,
            user = user.unwrap_or("anonymous"),
            reason = reason.unwrap_or(""),
            "Execution canceled"
        );
        Ok(())
    }
}
