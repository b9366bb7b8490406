//! The task runner: one attempt of one task per `RunTask` message.
//!
//! An attempt holds the per-task lease for its whole duration. The outcome
//! is persisted on the stage before exactly one follow-up message is pushed:
//! a delayed `RunTask` for `RUNNING` results and retryable failures, or a
//! `CompleteTask` otherwise.

use super::Dispatcher;
use crate::config::dynamic_keys;
use crate::core::ExecutionStatus;
use crate::errors::EngineError;
use crate::exceptions::TaskFailure;
use crate::lock::task_lock_key;
use crate::model::{keys, PipelineExecution, StageExecution, TaskExecution};
use crate::observability::metric_names;
use crate::queue::Message;
use crate::tasks::{check_timeout, PollingPolicy, TaskResult};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

impl Dispatcher {
    pub(super) async fn run_task(
        &self,
        message: &Message,
        stage_id: &str,
        task_id: &str,
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
        if task.status != ExecutionStatus::Running {
            self.drop_message(message, "task not running");
            return Ok(());
        }
        if task.awaiting_completion() {
            self.drop_message(message, "task attempt already finished");
            return Ok(());
        }
        if execution.canceled {
            self.drop_message(message, "execution canceled");
            return Ok(());
        }

        let key = task_lock_key(&execution.id, stage_id, task_id);
        let Some(lease) = self.locks.try_acquire(&key, self.runner.lock_ttl()).await? else {
            warn!(
                execution_id = %execution.id,
                stage_id,
                task_id,
                "Task attempt already in flight elsewhere, dropping"
            );
            self.metrics.increment_counter(
                metric_names::TASK_LOCK_CONTENDED,
                &[("task", task.implementing_task.as_str())],
                1,
            );
            return Ok(());
        };

        let outcome = self.run_leased(message, stage_id, task_id).await;

        if let Err(err) = self.locks.release(&lease).await {
            warn!(key = %lease.key, error = %err, "Failed to release task lease");
        }
        outcome
    }

    /// Re-reads the task under its lease. A redelivered `RunTask` can take
    /// the lease after an earlier attempt released it but before that
    /// attempt's `CompleteTask` was handled.
    async fn run_leased(
        &self,
        message: &Message,
        stage_id: &str,
        task_id: &str,
    ) -> Result<(), EngineError> {
        let execution = self
            .repository
            .get(message.execution_type(), message.execution_id())
            .await?;
        let Some(stage) = execution.stage(stage_id) else {
            self.drop_message(message, "stage not found");
            return Ok(());
        };
        let Some(task) = stage.task(task_id) else {
            self.drop_message(message, "task not found");
            return Ok(());
        };
        if execution.status.is_complete()
            || task.status != ExecutionStatus::Running
            || task.awaiting_completion()
        {
            self.drop_message(message, "task attempt already finished");
            return Ok(());
        }
        self.run_attempt(&execution, stage.clone(), task.clone())
            .await
    }

    async fn run_attempt(
        &self,
        execution: &PipelineExecution,
        stage: StageExecution,
        task: TaskExecution,
    ) -> Result<(), EngineError> {
        let Some(implementation) = self.tasks.resolve(&task.implementing_task) else {
            let failure = TaskFailure::UnknownTaskType(task.implementing_task.clone());
            return self.fail_task(execution, stage, &task, None, failure).await;
        };

        let policy = implementation
            .polling()
            .map(|policy| effective_policy(&stage, policy));

        if let Some(policy) = &policy {
            if let Err(failure) =
                check_timeout(&task.name, policy, task.start_time, self.clock.now())
            {
                self.metrics.increment_counter(
                    metric_names::TASK_TIMEOUTS,
                    &[("task", implementation.name())],
                    1,
                );
                if stage.context.mark_successful_on_timeout() {
                    info!(
                        execution_id = %execution.id,
                        stage_id = %stage.id,
                        task_id = %task.id,
                        "Task timed out, marking successful as requested"
                    );
                    return self
                        .finish_task(
                            execution,
                            stage,
                            &task,
                            ExecutionStatus::Succeeded,
                            ExecutionStatus::Succeeded,
                        )
                        .await;
                }
                return self
                    .fail_task(execution, stage, &task, Some(*policy), failure)
                    .await;
            }
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(implementation.execute(&stage))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let result = outcome.unwrap_or_else(|panic| {
            Err(TaskFailure::Other(anyhow::anyhow!(
                "Task {} panicked: {}",
                implementation.name(),
                panic_message(panic.as_ref())
            )))
        });
        self.record_invocation(execution, &stage, &task, implementation.name(), &result, elapsed);

        match result {
            Ok(result) => self.apply_result(execution, stage, &task, policy, result).await,
            Err(failure) => self.fail_task(execution, stage, &task, policy, failure).await,
        }
    }

    async fn apply_result(
        &self,
        execution: &PipelineExecution,
        mut stage: StageExecution,
        task: &TaskExecution,
        policy: Option<PollingPolicy>,
        result: TaskResult,
    ) -> Result<(), EngineError> {
        stage.context.merge(&result.context);
        stage.outputs.extend(result.outputs);

        match result.status {
            status @ (ExecutionStatus::Succeeded
            | ExecutionStatus::Skipped
            | ExecutionStatus::FailedContinue
            | ExecutionStatus::Stopped) => {
                self.finish_task(execution, stage, task, status, status).await
            }
            ExecutionStatus::Running => {
                let delay = self.running_backoff(&stage, policy.as_ref());
                self.repository
                    .store_stage(execution.execution_type, &execution.id, &stage)
                    .await?;
                self.push_delayed(Message::run_task(execution, &stage, task), delay)
                    .await
            }
            ExecutionStatus::Terminal => {
                let reason = result
                    .error
                    .unwrap_or_else(|| format!("Task {} reported TERMINAL", task.name));
                self.fail_task(execution, stage, task, policy, TaskFailure::reported(reason))
                    .await
            }
            ExecutionStatus::Canceled => {
                let status = stage.failure_status(ExecutionStatus::Canceled);
                self.finish_task(execution, stage, task, status, ExecutionStatus::Canceled)
                    .await
            }
            ExecutionStatus::NotStarted => {
                let failure = TaskFailure::Other(anyhow::anyhow!(
                    "Task {} returned NOT_STARTED",
                    task.name
                ));
                self.fail_task(execution, stage, task, policy, failure).await
            }
        }
    }

    /// Classifies a failure and either schedules a retry or fails the task.
    async fn fail_task(
        &self,
        execution: &PipelineExecution,
        mut stage: StageExecution,
        task: &TaskExecution,
        policy: Option<PollingPolicy>,
        failure: TaskFailure,
    ) -> Result<(), EngineError> {
        let response = self.classifier.classify(&task.name, &failure);
        let attempts_made = task.retry_count + 1;

        if response.should_retry && self.runner.retry.allows_another_attempt(attempts_made) {
            let delay = self.retry_backoff(&stage, policy.as_ref(), task.retry_count);
            stage.context.set_exception(&response)?;
            if let Some(current) = stage.task_mut(&task.id) {
                current.retry_count = attempts_made;
            }
            warn!(
                execution_id = %execution.id,
                application = %execution.application,
                stage_id = %stage.id,
                task_id = %task.id,
                attempt = attempts_made,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %failure,
                "Retrying task after retryable failure"
            );
            self.metrics.increment_counter(
                metric_names::TASK_RETRIES,
                &[("task", task.implementing_task.as_str())],
                1,
            );
            self.repository
                .store_stage(execution.execution_type, &execution.id, &stage)
                .await?;
            return self
                .push_delayed(Message::run_task(execution, &stage, task), delay)
                .await;
        }

        let response = response.with_should_retry(false);
        stage.context.set_exception(&response)?;
        let status = stage.failure_status(ExecutionStatus::Terminal);
        error!(
            execution_id = %execution.id,
            application = %execution.application,
            stage_id = %stage.id,
            task_id = %task.id,
            attempts = attempts_made,
            exception_type = %response.exception_type,
            error = %failure,
            %status,
            "Task failed"
        );
        self.finish_task(execution, stage, task, status, ExecutionStatus::Terminal)
            .await
    }

    async fn finish_task(
        &self,
        execution: &PipelineExecution,
        mut stage: StageExecution,
        task: &TaskExecution,
        status: ExecutionStatus,
        original_status: ExecutionStatus,
    ) -> Result<(), EngineError> {
        if let Some(current) = stage.task_mut(&task.id) {
            current.record_outcome(self.clock.now());
        }
        self.repository
            .store_stage(execution.execution_type, &execution.id, &stage)
            .await?;
        self.push(Message::CompleteTask {
            execution_type: execution.execution_type,
            execution_id: execution.id.clone(),
            application: execution.application.clone(),
            stage_id: stage.id.clone(),
            task_id: task.id.clone(),
            status,
            original_status,
        })
        .await
    }

    /// Delay before re-running a task that reported `RUNNING`.
    fn running_backoff(&self, stage: &StageExecution, policy: Option<&PollingPolicy>) -> Duration {
        let declared = policy.map_or(
            Duration::from_millis(self.runner.default_backoff_ms),
            |p| p.backoff_period,
        );
        self.apply_backoff_overrides(stage, declared)
    }

    /// Delay before retry number `retry` (0-indexed) of a failed task.
    fn retry_backoff(
        &self,
        stage: &StageExecution,
        policy: Option<&PollingPolicy>,
        retry: u32,
    ) -> Duration {
        let declared = policy.map_or(Duration::ZERO, |p| p.backoff_period);
        let delay = self.runner.retry.delay_for(retry).max(declared);
        self.apply_backoff_overrides(stage, delay)
    }

    /// Raises a delay to the live global and per-provider minimums, capped
    /// at the configured maximum.
    fn apply_backoff_overrides(&self, stage: &StageExecution, delay: Duration) -> Duration {
        let global = Duration::from_millis(self.flags.get_u64(dynamic_keys::GLOBAL_BACKOFF_MS, 0));
        let provider = stage.context.cloud_provider().map_or(Duration::ZERO, |provider| {
            let key = dynamic_keys::provider_backoff_ms(&provider.to_string());
            Duration::from_millis(self.flags.get_u64(&key, 0))
        });
        delay.max(global).max(provider).min(self.runner.max_backoff())
    }

    fn record_invocation(
        &self,
        execution: &PipelineExecution,
        stage: &StageExecution,
        task: &TaskExecution,
        task_name: &str,
        result: &Result<TaskResult, TaskFailure>,
        elapsed: Duration,
    ) {
        let outcome = match result {
            Ok(result) => result.status.to_string(),
            Err(failure) => failure.kind().to_string(),
        };
        self.metrics.record_timer(
            metric_names::TASK_INVOCATION_DURATION,
            &[("task", task_name), ("outcome", outcome.as_str())],
            elapsed,
        );

        let threshold = Duration::from_millis(self.flags.get_u64(
            dynamic_keys::WARNING_INVOCATION_TIME_MS,
            self.runner.warning_invocation_time_ms,
        ));
        if elapsed > threshold {
            warn!(
                execution_id = %execution.id,
                stage_id = %stage.id,
                task_id = %task.id,
                task = task_name,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "Slow task invocation"
            );
        }
    }
}

/// Applies a `stageTimeoutMs` override from the stage context.
fn effective_policy(stage: &StageExecution, policy: PollingPolicy) -> PollingPolicy {
    match stage.context.get::<u64>(keys::STAGE_TIMEOUT_MS) {
        Some(timeout_ms) => PollingPolicy::new(policy.backoff_period, Duration::from_millis(timeout_ms)),
        None => policy,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StageContext;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_stage_timeout_override() {
        let mut stage = StageExecution::new("s1", "1", "wait", "Wait");
        let policy = PollingPolicy::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(effective_policy(&stage, policy), policy);

        let mut entries = BTreeMap::new();
        entries.insert(keys::STAGE_TIMEOUT_MS.to_string(), json!(1_000));
        stage.context = StageContext::from(entries);
        assert_eq!(
            effective_policy(&stage, policy).timeout,
            Duration::from_secs(1)
        );
    }
}
