//! Execution repository contract and implementations.
//!
//! The repository is the only shared mutable state between handlers.
//! Handlers write stage-scoped changes with [`ExecutionRepository::store_stage`]
//! and execution-level transitions with [`ExecutionRepository::update_status`],
//! so concurrently running branches never overwrite each other's stages.

mod dual;
mod memory;

pub use dual::DualExecutionRepository;
pub use memory::InMemoryExecutionRepository;

use crate::core::{ExecutionStatus, ExecutionType};
use crate::errors::RepositoryError;
use crate::model::{ExecutionSummary, PipelineExecution, StageExecution};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Filters for listing executions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCriteria {
    /// Execution type to list.
    pub execution_type: ExecutionType,
    /// Only this application.
    #[serde(default)]
    pub application: Option<String>,
    /// Only this pipeline configuration.
    #[serde(default)]
    pub pipeline_config_id: Option<String>,
    /// Only these statuses; empty means any.
    #[serde(default)]
    pub statuses: Vec<ExecutionStatus>,
    /// Maximum number of results, newest first.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ExecutionCriteria {
    /// Criteria matching every execution of a type.
    #[must_use]
    pub fn new(execution_type: ExecutionType) -> Self {
        Self {
            execution_type,
            ..Self::default()
        }
    }

    /// Restricts to one application.
    #[must_use]
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /// Restricts to one pipeline configuration.
    #[must_use]
    pub fn with_pipeline_config_id(mut self, id: impl Into<String>) -> Self {
        self.pipeline_config_id = Some(id.into());
        self
    }

    /// Restricts to the given statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ExecutionStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Restricts to complete executions.
    #[must_use]
    pub fn complete(self) -> Self {
        self.with_statuses(ExecutionStatus::complete_statuses())
    }

    /// Caps the number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the execution matches.
    #[must_use]
    pub fn matches(&self, execution: &PipelineExecution) -> bool {
        execution.execution_type == self.execution_type
            && self
                .application
                .as_ref()
                .map_or(true, |a| *a == execution.application)
            && self
                .pipeline_config_id
                .as_ref()
                .map_or(true, |p| execution.pipeline_config_id.as_ref() == Some(p))
            && (self.statuses.is_empty() || self.statuses.contains(&execution.status))
    }
}

/// One page of the application index.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplicationPage {
    /// `(application, execution count)` pairs in index order.
    pub entries: Vec<(String, usize)>,
    /// Cursor for the next page; `None` when the scan is finished.
    pub next_cursor: Option<String>,
}

/// Trait for execution storage backends.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// The partition this repository handles, if partitioned.
    fn partition(&self) -> Option<&str>;

    /// Returns true if this instance may mutate executions in `partition`.
    ///
    /// Unpartitioned executions are handled everywhere.
    fn handles_partition(&self, partition: Option<&str>) -> bool {
        match (self.partition(), partition) {
            (Some(local), Some(owner)) => local == owner,
            _ => true,
        }
    }

    /// Persists a new execution and returns its id.
    ///
    /// Creating twice with the same client request id returns the first id.
    async fn create(&self, execution: PipelineExecution) -> Result<String, RepositoryError>;

    /// Replaces a whole execution.
    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError>;

    /// Replaces one stage of an execution.
    async fn store_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage: &StageExecution,
    ) -> Result<(), RepositoryError>;

    /// Fetches an execution.
    async fn get(
        &self,
        execution_type: ExecutionType,
        id: &str,
    ) -> Result<PipelineExecution, RepositoryError>;

    /// Fetches an execution by client request id.
    async fn get_by_client_request_id(
        &self,
        execution_type: ExecutionType,
        client_request_id: &str,
    ) -> Result<Option<PipelineExecution>, RepositoryError>;

    /// Lists executions, newest first.
    async fn list(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError>;

    /// Lists executions owned by this instance's partition, newest first.
    async fn list_by_this_instance(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError>;

    /// Lists lightweight summaries, newest first.
    async fn summaries(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<ExecutionSummary>, RepositoryError>;

    /// Every application with at least one execution of the type.
    async fn application_names(
        &self,
        execution_type: ExecutionType,
    ) -> Result<Vec<String>, RepositoryError>;

    /// Scans the application index in pages, starting after `cursor`.
    async fn scan_applications(
        &self,
        execution_type: ExecutionType,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ApplicationPage, RepositoryError>;

    /// Deletes an execution. Deleting a missing execution is not an error.
    async fn delete(&self, execution_type: ExecutionType, id: &str) -> Result<(), RepositoryError>;

    /// Deletes several executions, returning how many existed.
    async fn delete_all(
        &self,
        execution_type: ExecutionType,
        ids: &[String],
    ) -> Result<usize, RepositoryError>;

    /// Moves an execution to `status`.
    ///
    /// `RUNNING` stamps the start time if unset; resuming a complete
    /// execution also clears its end time and cancellation. Complete
    /// statuses stamp the end time.
    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError>;

    /// Records a cancellation request.
    ///
    /// A not-started execution becomes `CANCELED` immediately.
    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError>;
}

/// Orders executions newest first by start time, falling back to build time.
pub(crate) fn sort_newest_first(executions: &mut [PipelineExecution]) {
    executions.sort_by(|a, b| {
        let at = a.start_time.or(a.build_time);
        let bt = b.start_time.or(b.build_time);
        bt.cmp(&at).then_with(|| b.id.cmp(&a.id))
    });
}

/// Orders summaries newest first by start time, falling back to build time.
pub(crate) fn sort_summaries_newest_first(summaries: &mut [ExecutionSummary]) {
    summaries.sort_by(|a, b| {
        b.sort_time()
            .cmp(&a.sort_time())
            .then_with(|| b.id.cmp(&a.id))
    });
}
