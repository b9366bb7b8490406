//! Message handlers that advance executions.
//!
//! The [`Dispatcher`] owns every collaborator a handler needs and routes each
//! [`Envelope`] to exactly one handler. Handlers are idempotent: a message
//! for an execution that no longer exists or has already completed is
//! dropped at entry, so redelivery is always safe.

mod execution;
mod processor;
mod runner;
mod stage;
mod task;


pub use processor::{ProcessorHandle, QueueProcessor};

use crate::config::{DynamicConfig, InMemoryDynamicConfig, RunnerConfig};
use crate::errors::{EngineError, RepositoryError};
use crate::exceptions::ExceptionChain;
use crate::lock::{InMemoryLockManager, LockManager};
use crate::model::PipelineExecution;
use crate::observability::{metric_names, MetricsSink, NoOpMetricsSink};
use crate::queue::{Envelope, Message, Queue};
use crate::repository::ExecutionRepository;
use crate::tasks::TaskRegistry;
use crate::utils::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Routes queue messages to their handlers.
pub struct Dispatcher {
    repository: Arc<dyn ExecutionRepository>,
    queue: Arc<dyn Queue>,
    tasks: Arc<TaskRegistry>,
    classifier: Arc<ExceptionChain>,
    locks: Arc<dyn LockManager>,
    flags: Arc<dyn DynamicConfig>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    runner: RunnerConfig,
}

impl Dispatcher {
    /// Creates a dispatcher with in-process defaults for the optional
    /// collaborators.
    #[must_use]
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn Queue>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            repository,
            queue,
            tasks,
            classifier: Arc::new(ExceptionChain::default()),
            locks: Arc::new(InMemoryLockManager::new()),
            flags: Arc::new(InMemoryDynamicConfig::new()),
            metrics: Arc::new(NoOpMetricsSink),
            clock: Arc::new(SystemClock),
            runner: RunnerConfig::default(),
        }
    }

    /// Sets the exception classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<ExceptionChain>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the cluster lock manager.
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Sets the live settings source.
    #[must_use]
    pub fn with_flags(mut self, flags: Arc<dyn DynamicConfig>) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the runner configuration.
    #[must_use]
    pub fn with_runner_config(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    /// The repository handlers write to.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    /// The queue handlers push follow-up messages to.
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    /// Handles one delivery.
    ///
    /// Returns an error only for infrastructure failures; the caller should
    /// then leave the delivery unacked so it is redelivered.
    pub async fn handle(&self, envelope: &Envelope) -> Result<(), EngineError> {
        let message = &envelope.message;
        debug!(
            message_type = message.message_type(),
            execution_id = message.execution_id(),
            stage_id = message.stage_id(),
            task_id = message.task_id(),
            attempt = envelope.attempt_count,
            "Handling message"
        );

        match message {
            Message::StartExecution { .. } => self.start_execution(message).await,
            Message::StartStage { stage_id, .. } => self.start_stage(message, stage_id).await,
            Message::RunTask {
                stage_id, task_id, ..
            } => self.run_task(message, stage_id, task_id).await,
            Message::CompleteTask {
                stage_id,
                task_id,
                status,
                ..
            } => self.complete_task(message, stage_id, task_id, *status).await,
            Message::CompleteStage { stage_id, .. } => {
                self.complete_stage(message, stage_id).await
            }
            Message::CompleteExecution { .. } => self.complete_execution(message).await,
            Message::CancelStage { stage_id, .. } => self.cancel_stage(message, stage_id).await,
            Message::CancelExecution { user, reason, .. } => {
                self.cancel_execution(message, user.as_deref(), reason.as_deref())
                    .await
            }
        }
    }

    /// Loads the execution a message targets, or drops the message if the
    /// execution is gone or already complete.
    async fn load_active(
        &self,
        message: &Message,
    ) -> Result<Option<PipelineExecution>, EngineError> {
        let execution = match self
            .repository
            .get(message.execution_type(), message.execution_id())
            .await
        {
            Ok(execution) => execution,
            Err(RepositoryError::NotFound { .. }) => {
                self.drop_message(message, "execution not found");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if execution.status.is_complete() {
            self.drop_message(message, "execution already complete");
            return Ok(None);
        }
        Ok(Some(execution))
    }

    fn drop_message(&self, message: &Message, reason: &'static str) {
        warn!(
            message_type = message.message_type(),
            execution_id = message.execution_id(),
            stage_id = message.stage_id(),
            task_id = message.task_id(),
            reason,
            "Dropping message"
        );
        self.metrics.increment_counter(
            metric_names::MESSAGE_DROPPED,
            &[
                ("messageType", message.message_type()),
                ("reason", reason),
            ],
            1,
        );
    }

    async fn push(&self, message: Message) -> Result<(), EngineError> {
        self.queue.push(message, Duration::ZERO).await?;
        Ok(())
    }

    async fn push_delayed(&self, message: Message, delay: Duration) -> Result<(), EngineError> {
        self.queue.push(message, delay).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tasks", &self.tasks)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
