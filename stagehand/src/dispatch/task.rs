//! Task completion handler.

use super::Dispatcher;
use crate::core::ExecutionStatus;
use crate::errors::EngineError;
use crate::queue::Message;
use tracing::info;

impl Dispatcher {
    pub(super) async fn complete_task(
        &self,
        message: &Message,
        stage_id: &str,
        task_id: &str,
        status: ExecutionStatus,
    ) -> Result<(), EngineError> {
        let Some(execution) = self.load_active(message).await? else {
            return Ok(());
        };
        let Some(stage) = execution.stage(stage_id) else {
            self.drop_message(message, "stage not found");
            return Ok(());
        };
        let Some(task) = stage.task(task_id) else {
            self.drop_message(message, "task not found");
            return Ok(());
        };
        if task.status.is_complete() {
            self.drop_message(message, "task already complete");
            return Ok(());
        }

        let now = self.clock.now();
        let next_task_id = stage.next_task(task_id).map(|t| t.id.clone());
        let mut stage = stage.clone();
        if let Some(task) = stage.task_mut(task_id) {
            task.complete(status, now);
        }
        info!(
            execution_id = %execution.id,
            stage_id = %stage.id,
            task_id,
            %status,
            "Task complete"
        );

        let advance = matches!(status, ExecutionStatus::Succeeded | ExecutionStatus::Skipped);
        let follow_up = match next_task_id {
            Some(next_id) if advance => match stage.task_mut(&next_id) {
                Some(next) => {
                    next.start(now);
                    let next = next.clone();
                    Message::run_task(&execution, &stage, &next)
                }
                None => Message::complete_stage(&execution, &stage),
            },
            _ => Message::complete_stage(&execution, &stage),
        };

        self.repository
            .store_stage(execution.execution_type, &execution.id, &stage)
            .await?;
        self.push(follow_up).await
    }
}
