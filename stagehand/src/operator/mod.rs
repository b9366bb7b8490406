//! Operator-initiated changes to running or finished executions.
//!
//! The [`CompoundExecutionOperator`] is the entry point for restarts and
//! cancellations requested from outside the queue loop. Every operation
//! checks partition ownership before touching the repository, then hands
//! the rest of the work to the dispatcher through the queue.

use crate::core::{ExecutionStatus, ExecutionType};
use crate::errors::OperatorError;
use crate::model::{
    keys, tasks_from_definitions, PipelineExecution, RestartDetails, StageExecution,
    TaskDefinition,
};
use crate::queue::{Message, Queue};
use crate::repository::ExecutionRepository;
use crate::utils::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Parameters for restarting a stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartRequest {
    /// Who requested the restart.
    pub user: String,
    /// Replacement task list; `None` resets the existing tasks.
    #[serde(default)]
    pub tasks: Option<Vec<TaskDefinition>>,
    /// Entries merged into the stage context.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Keep the link to a previously started child execution.
    #[serde(default)]
    pub skip_restart: bool,
}

impl RestartRequest {
    /// A restart that resets the stage's existing tasks.
    #[must_use]
    pub fn by(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    /// Replaces the stage's tasks.
    #[must_use]
    pub fn with_tasks(mut self, tasks: Vec<TaskDefinition>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Keeps the child execution link.
    #[must_use]
    pub fn skipping_restart(mut self) -> Self {
        self.skip_restart = true;
        self
    }
}

/// Restarts and cancels executions on behalf of users.
pub struct CompoundExecutionOperator {
    repository: Arc<dyn ExecutionRepository>,
    queue: Arc<dyn Queue>,
    clock: Arc<dyn Clock>,
}

impl CompoundExecutionOperator {
    /// Creates an operator.
    #[must_use]
    pub fn new(repository: Arc<dyn ExecutionRepository>, queue: Arc<dyn Queue>) -> Self {
        Self {
            repository,
            queue,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the clock used for restart timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Restarts a complete stage and everything downstream of it.
    ///
    /// # Errors
    ///
    /// Fails with [`OperatorError::ForeignExecution`] if another partition
    /// owns the execution, and [`OperatorError::InvalidState`] if the stage
    /// is missing or still in progress.
    pub async fn restart_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage_id: &str,
        request: RestartRequest,
    ) -> Result<(), OperatorError> {
        let execution = self.load_owned(execution_type, execution_id).await?;
        let Some(stage) = execution.stage(stage_id) else {
            return Err(OperatorError::InvalidState {
                operation: "restart_stage",
                reason: format!("execution {execution_id} has no stage {stage_id}"),
            });
        };
        if !stage.status.is_complete() {
            return Err(OperatorError::InvalidState {
                operation: "restart_stage",
                reason: format!("stage {stage_id} is {}", stage.status),
            });
        }

        let now = self.clock.now();
        let mut stage = stage.clone();
        stage.reset();
        if let Some(tasks) = &request.tasks {
            stage.tasks = tasks_from_definitions(tasks);
        }
        stage.context.merge(&request.context);

        let previous_exception = stage.context.remove(keys::EXCEPTION);
        stage.context.insert(
            keys::RESTART_DETAILS,
            &RestartDetails {
                restarted_by: request.user.clone(),
                restart_time: now,
                previous_exception,
            },
        )?;
        if !request.skip_restart {
            stage.context.remove(keys::CHILD_EXECUTION);
        }

        let downstream = reset_downstream(&execution, stage_id);
        for reset in &downstream {
            self.repository
                .store_stage(execution_type, execution_id, reset)
                .await?;
        }

        stage.status = ExecutionStatus::Running;
        stage.start_time = Some(now);
        let follow_up = match stage.tasks.first_mut() {
            Some(first) => {
                first.start(now);
                let first = first.clone();
                Message::run_task(&execution, &stage, &first)
            }
            None => Message::complete_stage(&execution, &stage),
        };
        self.repository
            .store_stage(execution_type, execution_id, &stage)
            .await?;
        self.repository
            .update_status(execution_type, execution_id, ExecutionStatus::Running)
            .await?;

        info!(
            execution_id,
            application = %execution.application,
            stage_id,
            user = %request.user,
            downstream_reset = downstream.len(),
            "Stage restarted"
        );
        self.queue.push(follow_up, Duration::ZERO).await?;
        Ok(())
    }

    /// Cancels an execution.
    ///
    /// The cancellation is recorded immediately; running stages are wound
    /// down asynchronously by the dispatcher.
    ///
    /// # Errors
    ///
    /// Fails if another partition owns the execution or the repository or
    /// queue is unavailable.
    pub async fn cancel(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), OperatorError> {
        let execution = self.load_owned(execution_type, execution_id).await?;
        self.repository
            .cancel(execution_type, execution_id, user, reason)
            .await?;
        info!(
            execution_id,
            application = %execution.application,
            user = user.unwrap_or("anonymous"),
            "Cancellation requested"
        );
        self.queue
            .push(
                Message::CancelExecution {
                    execution_type,
                    execution_id: execution.id.clone(),
                    application: execution.application.clone(),
                    user: user.map(str::to_string),
                    reason: reason.map(str::to_string),
                },
                Duration::ZERO,
            )
            .await?;
        Ok(())
    }

    /// Cancels one stage.
    ///
    /// # Errors
    ///
    /// Fails if another partition owns the execution, or the stage is
    /// missing.
    pub async fn cancel_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage_id: &str,
    ) -> Result<(), OperatorError> {
        let execution = self.load_owned(execution_type, execution_id).await?;
        let Some(stage) = execution.stage(stage_id) else {
            return Err(OperatorError::InvalidState {
                operation: "cancel_stage",
                reason: format!("execution {execution_id} has no stage {stage_id}"),
            });
        };
        self.queue
            .push(Message::cancel_stage(&execution, stage), Duration::ZERO)
            .await?;
        Ok(())
    }

    async fn load_owned(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
    ) -> Result<PipelineExecution, OperatorError> {
        let execution = self.repository.get(execution_type, execution_id).await?;
        if !self
            .repository
            .handles_partition(execution.partition.as_deref())
        {
            return Err(OperatorError::ForeignExecution {
                id: execution.id,
                partition: execution.partition,
                local_partition: self.repository.partition().map(str::to_string),
            });
        }
        Ok(execution)
    }
}

/// Every stage downstream of `stage_id`, reset to `NOT_STARTED`.
fn reset_downstream(execution: &PipelineExecution, stage_id: &str) -> Vec<StageExecution> {
    execution
        .all_downstream_stage_ids(stage_id)
        .iter()
        .filter_map(|id| execution.stage(id))
        .filter(|s| s.status != ExecutionStatus::NotStarted)
        .map(|s| {
            let mut reset = s.clone();
            reset.reset();
            reset
        })
        .collect()
}

impl std::fmt::Debug for CompoundExecutionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompoundExecutionOperator")
            .field("partition", &self.repository.partition())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus::{Canceled, NotStarted, Running, Succeeded, Terminal};
    use crate::model::ChildExecutionLink;
    use crate::repository::InMemoryExecutionRepository;
    use crate::testing::{
        assert_execution_status, assert_stage_status, assert_task_statuses, fixtures,
        stage_by_ref, FailingTask, ScriptedTask, TestHarness,
    };
    use crate::queue::InMemoryQueue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn operator(harness: &TestHarness) -> CompoundExecutionOperator {
        CompoundExecutionOperator::new(harness.repository().clone(), harness.queue().clone())
            .with_clock(harness.clock().clone())
    }

    #[tokio::test]
    async fn test_restart_of_foreign_execution_fails_fast() {
        let repository = Arc::new(InMemoryExecutionRepository::new().with_partition("us-east-1"));
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(60), 10));
        let mut execution = fixtures::single_task("deploy");
        execution.stages[0].status = Terminal;
        let id = repository.create(execution).await.unwrap();

        let mut stored = repository.get(ExecutionType::Pipeline, &id).await.unwrap();
        stored.partition = Some("eu-west-1".to_string());
        repository.store(&stored).await.unwrap();

        let operator = CompoundExecutionOperator::new(repository.clone(), queue.clone());
        let err = operator
            .restart_stage(
                ExecutionType::Pipeline,
                &id,
                &stored.stages[0].id,
                RestartRequest::by("alice"),
            )
            .await
            .unwrap_err();

        match err {
            OperatorError::ForeignExecution {
                partition,
                local_partition,
                ..
            } => {
                assert_eq!(partition.as_deref(), Some("eu-west-1"));
                assert_eq!(local_partition.as_deref(), Some("us-east-1"));
            }
            other => panic!("expected ForeignExecution, got {other:?}"),
        }
        assert!(queue.is_empty());
        let unchanged = repository.get(ExecutionType::Pipeline, &id).await.unwrap();
        assert_eq!(unchanged.stages[0].status, Terminal);
    }

    #[tokio::test]
    async fn test_restart_of_running_stage_is_rejected() {
        let harness = TestHarness::new();
        let mut execution = fixtures::single_task("deploy");
        execution.stages[0].status = Running;
        let stage_id = execution.stages[0].id.clone();
        let id = harness.repository().create(execution).await.unwrap();

        let err = operator(&harness)
            .restart_stage(ExecutionType::Pipeline, &id, &stage_id, RestartRequest::by("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_restart_with_new_tasks_recovers_failed_pipeline() {
        let deploy = Arc::new(ScriptedTask::succeeding("deploy"));
        let harness = TestHarness::new().with_task(FailingTask::http("broken", 400));
        harness.register(deploy.clone());

        let id = harness
            .launch(fixtures::stage_chain(&["broken", "deploy"]))
            .await
            .unwrap();
        harness.drain().await.unwrap();
        let failed = harness.execution(&id).await.unwrap();
        assert_execution_status(&failed, Terminal);
        assert_stage_status(&failed, "2", NotStarted);

        let stage_id = stage_by_ref(&failed, "1").id.clone();
        operator(&harness)
            .restart_stage(
                ExecutionType::Pipeline,
                &id,
                &stage_id,
                RestartRequest::by("alice@example.com")
                    .with_tasks(vec![TaskDefinition::new("retryDeploy", "deploy")])
                    .with_context("amiName", "ami-456"),
            )
            .await
            .unwrap();

        let restarted = harness.execution(&id).await.unwrap();
        assert_execution_status(&restarted, Running);
        assert!(restarted.end_time.is_none());
        assert_task_statuses(&restarted, "1", &[Running]);

        let stage = stage_by_ref(&restarted, "1");
        assert!(stage.context.exception().is_none());
        assert_eq!(stage.context.get_value("amiName"), Some(&json!("ami-456")));
        let details = stage.context.restart_details().unwrap();
        assert_eq!(details.restarted_by, "alice@example.com");
        assert_eq!(details.restart_time, harness.clock().now());
        let previous = details.previous_exception.unwrap();
        assert_eq!(previous["exceptionType"], json!("RemoteCallError"));

        harness.drain().await.unwrap();
        let recovered = harness.execution(&id).await.unwrap();
        assert_execution_status(&recovered, Succeeded);
        assert_stage_status(&recovered, "1", Succeeded);
        assert_stage_status(&recovered, "2", Succeeded);
        assert_eq!(deploy.call_count(), 2);
    }

    #[tokio::test]
    async fn test_restart_resets_downstream_stages() {
        let wait = Arc::new(ScriptedTask::succeeding("wait"));
        let harness = TestHarness::new();
        harness.register(wait.clone());

        let id = harness.launch(fixtures::diamond("wait")).await.unwrap();
        harness.drain().await.unwrap();
        let done = harness.execution(&id).await.unwrap();
        let branch_b = stage_by_ref(&done, "3").clone();

        let stage_id = stage_by_ref(&done, "2").id.clone();
        operator(&harness)
            .restart_stage(ExecutionType::Pipeline, &id, &stage_id, RestartRequest::by("bob"))
            .await
            .unwrap();

        let restarted = harness.execution(&id).await.unwrap();
        assert_stage_status(&restarted, "1", Succeeded);
        assert_stage_status(&restarted, "2", Running);
        assert_eq!(stage_by_ref(&restarted, "3"), &branch_b);
        assert_stage_status(&restarted, "4", NotStarted);
        assert_task_statuses(&restarted, "4", &[NotStarted]);
        assert!(stage_by_ref(&restarted, "4").end_time.is_none());

        harness.drain().await.unwrap();
        let again = harness.execution(&id).await.unwrap();
        assert_execution_status(&again, Succeeded);
        assert_stage_status(&again, "4", Succeeded);
        assert_eq!(wait.call_count(), 6);
    }

    #[tokio::test]
    async fn test_restart_clears_child_link_unless_skipped() {
        let harness = TestHarness::new();
        let link = ChildExecutionLink {
            execution_id: "child-1".to_string(),
            execution_type: ExecutionType::Pipeline,
            application: fixtures::APPLICATION.to_string(),
        };
        let mut execution = fixtures::pipeline(vec![
            fixtures::stage("1", &["trigger"], &[]),
            fixtures::stage("2", &["trigger"], &[]),
        ]);
        for stage in &mut execution.stages {
            stage.status = Succeeded;
            stage.context.insert(keys::CHILD_EXECUTION, &link).unwrap();
        }
        execution.status = Succeeded;
        let first = execution.stages[0].id.clone();
        let second = execution.stages[1].id.clone();
        let id = harness.repository().create(execution).await.unwrap();

        let operator = operator(&harness);
        operator
            .restart_stage(ExecutionType::Pipeline, &id, &first, RestartRequest::by("carol"))
            .await
            .unwrap();
        operator
            .restart_stage(
                ExecutionType::Pipeline,
                &id,
                &second,
                RestartRequest::by("carol").skipping_restart(),
            )
            .await
            .unwrap();

        let restarted = harness.execution(&id).await.unwrap();
        assert!(stage_by_ref(&restarted, "1").context.child_execution().is_none());
        assert_eq!(
            stage_by_ref(&restarted, "2").context.child_execution(),
            Some(link)
        );
        assert_eq!(harness.queue().ready_len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_records_and_enqueues() {
        let harness = TestHarness::new().with_task(ScriptedTask::always_running(
            "wait",
            crate::tasks::PollingPolicy::new(Duration::from_secs(10), Duration::from_secs(3600)),
        ));
        let id = harness.launch(fixtures::single_task("wait")).await.unwrap();
        while harness.step().await.unwrap() {}

        operator(&harness)
            .cancel(ExecutionType::Pipeline, &id, Some("dave"), Some("wrong build"))
            .await
            .unwrap();
        let pending = harness.execution(&id).await.unwrap();
        assert!(pending.canceled);
        assert_eq!(pending.status, Running);

        while harness.step().await.unwrap() {}
        let canceled = harness.execution(&id).await.unwrap();
        assert_execution_status(&canceled, Canceled);
        assert_stage_status(&canceled, "1", Canceled);
        assert_eq!(canceled.cancellation_reason.as_deref(), Some("wrong build"));
    }

    #[tokio::test]
    async fn test_cancel_stage_settles_execution() {
        let harness = TestHarness::new().with_task(ScriptedTask::always_running(
            "wait",
            crate::tasks::PollingPolicy::new(Duration::from_secs(10), Duration::from_secs(3600)),
        ));
        let id = harness.launch(fixtures::single_task("wait")).await.unwrap();
        while harness.step().await.unwrap() {}

        let execution = harness.execution(&id).await.unwrap();
        operator(&harness)
            .cancel_stage(ExecutionType::Pipeline, &id, &execution.stages[0].id)
            .await
            .unwrap();
        while harness.step().await.unwrap() {}

        let settled = harness.execution(&id).await.unwrap();
        assert_stage_status(&settled, "1", Canceled);
        assert_execution_status(&settled, Canceled);
    }
}
