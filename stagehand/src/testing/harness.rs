//! An engine wired to in-memory collaborators.

use crate::config::{InMemoryDynamicConfig, RunnerConfig};
use crate::core::{ExecutionStatus, ExecutionType};
use crate::dispatch::Dispatcher;
use crate::errors::{EngineError, RepositoryError};
use crate::exceptions::ExceptionChain;
use crate::lock::InMemoryLockManager;
use crate::model::PipelineExecution;
use crate::observability::InMemoryMetricsSink;
use crate::queue::{InMemoryQueue, Message, Queue};
use crate::repository::{ExecutionRepository, InMemoryExecutionRepository};
use crate::tasks::{Task, TaskRegistry};
use crate::utils::ManualClock;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on deliveries handled by one [`TestHarness::drain`].
const MAX_DRAIN_STEPS: usize = 10_000;

/// Runs executions end to end against in-memory collaborators.
///
/// [`drain`](Self::drain) handles deliveries one at a time. When only
/// delayed messages remain it sleeps until the next one is due and moves
/// the manual clock by the same amount, so tests that run with a paused
/// tokio clock see backoffs and timeouts elapse instantly.
#[derive(Debug)]
pub struct TestHarness {
    repository: Arc<InMemoryExecutionRepository>,
    queue: Arc<InMemoryQueue>,
    tasks: Arc<TaskRegistry>,
    locks: Arc<InMemoryLockManager>,
    flags: Arc<InMemoryDynamicConfig>,
    metrics: Arc<InMemoryMetricsSink>,
    clock: Arc<ManualClock>,
    classifier: Arc<ExceptionChain>,
    runner: RunnerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl TestHarness {
    /// Creates a harness with default configuration.
    #[must_use]
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default();
        let clock = Arc::new(ManualClock::new(start));
        let repository = Arc::new(InMemoryExecutionRepository::new().with_clock(clock.clone()));
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(60), 10));
        let tasks = Arc::new(TaskRegistry::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let flags = Arc::new(InMemoryDynamicConfig::new());
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let classifier = Arc::new(ExceptionChain::default());
        let runner = RunnerConfig::default();

        let dispatcher = Self::build_dispatcher(
            &repository,
            &queue,
            &tasks,
            &locks,
            &flags,
            &metrics,
            &clock,
            &classifier,
            &runner,
        );
        Self {
            repository,
            queue,
            tasks,
            locks,
            flags,
            metrics,
            clock,
            classifier,
            runner,
            dispatcher,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_dispatcher(
        repository: &Arc<InMemoryExecutionRepository>,
        queue: &Arc<InMemoryQueue>,
        tasks: &Arc<TaskRegistry>,
        locks: &Arc<InMemoryLockManager>,
        flags: &Arc<InMemoryDynamicConfig>,
        metrics: &Arc<InMemoryMetricsSink>,
        clock: &Arc<ManualClock>,
        classifier: &Arc<ExceptionChain>,
        runner: &RunnerConfig,
    ) -> Arc<Dispatcher> {
        Arc::new(
            Dispatcher::new(repository.clone(), queue.clone(), tasks.clone())
                .with_locks(locks.clone())
                .with_flags(flags.clone())
                .with_metrics(metrics.clone())
                .with_clock(clock.clone())
                .with_classifier(classifier.clone())
                .with_runner_config(runner.clone()),
        )
    }

    fn rebuild(&mut self) {
        self.dispatcher = Self::build_dispatcher(
            &self.repository,
            &self.queue,
            &self.tasks,
            &self.locks,
            &self.flags,
            &self.metrics,
            &self.clock,
            &self.classifier,
            &self.runner,
        );
    }

    /// Registers a task.
    #[must_use]
    pub fn with_task(self, task: impl Task + 'static) -> Self {
        self.tasks.register(Arc::new(task));
        self
    }

    /// Registers a shared task, so the test can keep inspecting it.
    pub fn register(&self, task: Arc<dyn Task>) {
        self.tasks.register(task);
    }

    /// Replaces the runner configuration.
    #[must_use]
    pub fn with_runner_config(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self.rebuild();
        self
    }

    /// Replaces the exception classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: ExceptionChain) -> Self {
        self.classifier = Arc::new(classifier);
        self.rebuild();
        self
    }

    /// Replaces the queue.
    #[must_use]
    pub fn with_queue(mut self, queue: InMemoryQueue) -> Self {
        self.queue = Arc::new(queue);
        self.rebuild();
        self
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// The repository.
    #[must_use]
    pub fn repository(&self) -> &Arc<InMemoryExecutionRepository> {
        &self.repository
    }

    /// The queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<InMemoryQueue> {
        &self.queue
    }

    /// The lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<InMemoryLockManager> {
        &self.locks
    }

    /// Live settings.
    #[must_use]
    pub fn flags(&self) -> &Arc<InMemoryDynamicConfig> {
        &self.flags
    }

    /// Recorded metrics.
    #[must_use]
    pub fn metrics(&self) -> &Arc<InMemoryMetricsSink> {
        &self.metrics
    }

    /// The manual clock handlers read.
    #[must_use]
    pub fn clock(&self) -> &Arc<ManualClock> {
        &self.clock
    }

    /// Stores an execution and enqueues `StartExecution`.
    pub async fn launch(&self, execution: PipelineExecution) -> Result<String, EngineError> {
        let execution_type = execution.execution_type;
        let id = self.repository.create(execution).await?;
        let stored = self.repository.get(execution_type, &id).await?;
        self.queue
            .push(Message::start_execution(&stored), Duration::ZERO)
            .await?;
        Ok(id)
    }

    /// Fetches an execution of either type.
    pub async fn execution(&self, id: &str) -> Result<PipelineExecution, RepositoryError> {
        match self.repository.get(ExecutionType::Pipeline, id).await {
            Err(err) if err.is_not_found() => {
                self.repository.get(ExecutionType::Orchestration, id).await
            }
            other => other,
        }
    }

    /// Fetches an execution's status.
    pub async fn status(&self, id: &str) -> Result<ExecutionStatus, RepositoryError> {
        Ok(self.execution(id).await?.status)
    }

    /// Handles one ready delivery, returning false if none was ready.
    pub async fn step(&self) -> Result<bool, EngineError> {
        let Some(delivery) = self.queue.poll(1).await?.pop() else {
            return Ok(false);
        };
        self.dispatcher.handle(&delivery.envelope).await?;
        self.queue.ack(&delivery.receipt).await?;
        Ok(true)
    }

    /// Handles deliveries until the queue is empty, returning how many
    /// were handled.
    pub async fn drain(&self) -> Result<usize, EngineError> {
        let mut handled = 0;
        while handled < MAX_DRAIN_STEPS {
            if self.step().await? {
                handled += 1;
                continue;
            }
            let Some(due) = self.queue.next_delivery_at() else {
                return Ok(handled);
            };
            self.advance_until(due).await;
        }
        Err(EngineError::Internal(format!(
            "queue still busy after {MAX_DRAIN_STEPS} deliveries"
        )))
    }

    /// Sleeps until `due`, moving the manual clock along.
    async fn advance_until(&self, due: Instant) {
        let now = Instant::now();
        if due > now {
            let delta = chrono::Duration::from_std(due - now)
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.clock.advance(delta);
            tokio::time::sleep_until(due).await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
