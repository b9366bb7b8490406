//! Mock tasks, operations and repositories for testing.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{ExecutionStatus, ExecutionType};
use crate::errors::RepositoryError;
use crate::exceptions::{RemoteCallError, TaskFailure};
use crate::model::{ExecutionSummary, PipelineExecution, StageExecution};
use crate::repository::{ApplicationPage, ExecutionCriteria, ExecutionRepository};
use crate::tasks::{
    ExternalOperation, ExternalStatus, PollingPolicy, StateMapping, Task, TaskResult,
};

/// A task that returns scripted results in order, repeating the last one.
#[derive(Debug)]
pub struct ScriptedTask {
    name: String,
    script: Mutex<VecDeque<TaskResult>>,
    last: Mutex<Option<TaskResult>>,
    polling: Option<PollingPolicy>,
    cancel_result: Option<TaskResult>,
    call_count: Mutex<usize>,
    cancel_count: Mutex<usize>,
}

impl ScriptedTask {
    /// Creates a task that plays `results` in order.
    #[must_use]
    pub fn new(name: impl Into<String>, results: Vec<TaskResult>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(results.into()),
            last: Mutex::new(None),
            polling: None,
            cancel_result: None,
            call_count: Mutex::new(0),
            cancel_count: Mutex::new(0),
        }
    }

    /// A task that always succeeds.
    #[must_use]
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self::new(name, vec![TaskResult::succeeded()])
    }

    /// A polling task that never leaves `RUNNING`.
    #[must_use]
    pub fn always_running(name: impl Into<String>, policy: PollingPolicy) -> Self {
        Self::new(name, vec![TaskResult::running()]).with_polling(policy)
    }

    /// Declares a polling policy.
    #[must_use]
    pub fn with_polling(mut self, policy: PollingPolicy) -> Self {
        self.polling = Some(policy);
        self
    }

    /// Sets the result returned from `on_cancel`.
    #[must_use]
    pub fn with_cancel_result(mut self, result: TaskResult) -> Self {
        self.cancel_result = Some(result);
        self
    }

    /// Returns the number of times the task was executed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }

    /// Returns the number of times the task was canceled.
    #[must_use]
    pub fn cancel_count(&self) -> usize {
        *self.cancel_count.lock()
    }
}

#[async_trait]
impl Task for ScriptedTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn polling(&self) -> Option<PollingPolicy> {
        self.polling
    }

    async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskFailure> {
        *self.call_count.lock() += 1;
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(next) = next {
            *last = Some(next);
        }
        Ok(last.clone().unwrap_or_else(TaskResult::succeeded))
    }

    async fn on_cancel(&self, _stage: &StageExecution) -> Option<TaskResult> {
        *self.cancel_count.lock() += 1;
        self.cancel_result.clone()
    }
}

type FailureFactory = Box<dyn Fn() -> TaskFailure + Send + Sync>;

/// A task that fails on every attempt.
pub struct FailingTask {
    name: String,
    failure: FailureFactory,
    polling: Option<PollingPolicy>,
    call_count: Mutex<usize>,
}

impl FailingTask {
    /// Creates a task that fails with whatever `failure` builds.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        failure: impl Fn() -> TaskFailure + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            failure: Box::new(failure),
            polling: None,
            call_count: Mutex::new(0),
        }
    }

    /// A task whose remote call always fails with `status`.
    #[must_use]
    pub fn http(name: impl Into<String>, status: u16) -> Self {
        Self::new(name, move || {
            RemoteCallError::http(status, format!("Remote returned {status}"))
                .with_url("https://cloud.example.com/api")
                .into()
        })
    }

    /// A task that always fails with an opaque error.
    #[must_use]
    pub fn unexpected(name: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(name, move || {
            TaskFailure::Other(anyhow::anyhow!(message.clone()))
        })
    }

    /// Declares a polling policy.
    #[must_use]
    pub fn with_polling(mut self, policy: PollingPolicy) -> Self {
        self.polling = Some(policy);
        self
    }

    /// Returns the number of times the task was executed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.call_count.lock()
    }
}

impl fmt::Debug for FailingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailingTask")
            .field("name", &self.name)
            .field("call_count", &self.call_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Task for FailingTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn polling(&self) -> Option<PollingPolicy> {
        self.polling
    }

    async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskFailure> {
        *self.call_count.lock() += 1;
        Err((self.failure)())
    }
}

/// A task that panics when executed.
#[derive(Debug)]
pub struct PanickingTask {
    name: String,
}

impl PanickingTask {
    /// Creates a panicking task.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Task for PanickingTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskFailure> {
        panic!("{} exploded", self.name)
    }
}

/// An external operation that reports scripted states in order, repeating
/// the last one.
#[derive(Debug)]
pub struct ScriptedOperation {
    name: String,
    policy: PollingPolicy,
    mapping: StateMapping,
    statuses: Mutex<VecDeque<Option<ExternalStatus>>>,
    last: Mutex<Option<ExternalStatus>>,
    fetch_count: Mutex<usize>,
}

impl ScriptedOperation {
    /// Creates an operation.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        policy: PollingPolicy,
        mapping: StateMapping,
        statuses: Vec<Option<ExternalStatus>>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            mapping,
            statuses: Mutex::new(statuses.into()),
            last: Mutex::new(None),
            fetch_count: Mutex::new(0),
        }
    }

    /// Returns the number of status fetches.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        *self.fetch_count.lock()
    }
}

#[async_trait]
impl ExternalOperation for ScriptedOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> PollingPolicy {
        self.policy
    }

    fn state_mapping(&self) -> &StateMapping {
        &self.mapping
    }

    async fn fetch_status(
        &self,
        _stage: &StageExecution,
    ) -> Result<Option<ExternalStatus>, TaskFailure> {
        *self.fetch_count.lock() += 1;
        let mut statuses = self.statuses.lock();
        let mut last = self.last.lock();
        if let Some(next) = statuses.pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

/// A repository wrapper that injects failures and latency.
pub struct FaultyRepository {
    inner: Arc<dyn ExecutionRepository>,
    fail_all: AtomicBool,
    failing_applications: RwLock<HashSet<String>>,
    read_delay: Option<Duration>,
}

impl FaultyRepository {
    /// Wraps a repository.
    #[must_use]
    pub fn new(inner: Arc<dyn ExecutionRepository>) -> Self {
        Self {
            inner,
            fail_all: AtomicBool::new(false),
            failing_applications: RwLock::new(HashSet::new()),
            read_delay: None,
        }
    }

    /// Delays every list-style read.
    #[must_use]
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Fails every call from now on.
    pub fn fail_everything(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    /// Fails list-style reads scoped to one application.
    pub fn fail_application(&self, application: impl Into<String>) {
        self.failing_applications.write().insert(application.into());
    }

    /// Stops injecting failures.
    pub fn heal(&self) {
        self.fail_all.store(false, Ordering::SeqCst);
        self.failing_applications.write().clear();
    }

    fn check(&self, application: Option<&str>) -> Result<(), RepositoryError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("injected failure".to_string()));
        }
        if let Some(application) = application {
            if self.failing_applications.read().contains(application) {
                return Err(RepositoryError::Unavailable(format!(
                    "injected failure for {application}"
                )));
            }
        }
        Ok(())
    }

    async fn delay(&self) {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl fmt::Debug for FaultyRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyRepository")
            .field("fail_all", &self.fail_all.load(Ordering::SeqCst))
            .field("read_delay", &self.read_delay)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ExecutionRepository for FaultyRepository {
    fn partition(&self) -> Option<&str> {
        self.inner.partition()
    }

    async fn create(&self, execution: PipelineExecution) -> Result<String, RepositoryError> {
        self.check(None)?;
        self.inner.create(execution).await
    }

    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        self.check(None)?;
        self.inner.store(execution).await
    }

    async fn store_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage: &StageExecution,
    ) -> Result<(), RepositoryError> {
        self.check(None)?;
        self.inner
            .store_stage(execution_type, execution_id, stage)
            .await
    }

    async fn get(
        &self,
        execution_type: ExecutionType,
        id: &str,
    ) -> Result<PipelineExecution, RepositoryError> {
        self.check(None)?;
        self.inner.get(execution_type, id).await
    }

    async fn get_by_client_request_id(
        &self,
        execution_type: ExecutionType,
        client_request_id: &str,
    ) -> Result<Option<PipelineExecution>, RepositoryError> {
        self.check(None)?;
        self.inner
            .get_by_client_request_id(execution_type, client_request_id)
            .await
    }

    async fn list(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        self.delay().await;
        self.check(criteria.application.as_deref())?;
        self.inner.list(criteria).await
    }

    async fn list_by_this_instance(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        self.delay().await;
        self.check(criteria.application.as_deref())?;
        self.inner.list_by_this_instance(criteria).await
    }

    async fn summaries(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<ExecutionSummary>, RepositoryError> {
        self.delay().await;
        self.check(criteria.application.as_deref())?;
        self.inner.summaries(criteria).await
    }

    async fn application_names(
        &self,
        execution_type: ExecutionType,
    ) -> Result<Vec<String>, RepositoryError> {
        self.delay().await;
        self.check(None)?;
        self.inner.application_names(execution_type).await
    }

    async fn scan_applications(
        &self,
        execution_type: ExecutionType,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ApplicationPage, RepositoryError> {
        self.check(None)?;
        self.inner
            .scan_applications(execution_type, cursor, limit)
            .await
    }

    async fn delete(&self, execution_type: ExecutionType, id: &str) -> Result<(), RepositoryError> {
        self.check(None)?;
        self.inner.delete(execution_type, id).await
    }

    async fn delete_all(
        &self,
        execution_type: ExecutionType,
        ids: &[String],
    ) -> Result<usize, RepositoryError> {
        self.check(None)?;
        self.inner.delete_all(execution_type, ids).await
    }

    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        self.check(None)?;
        self.inner.update_status(execution_type, id, status).await
    }

    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.check(None)?;
        self.inner.cancel(execution_type, id, user, reason).await
    }
}
