//! Age-based retention of pipeline executions.

use super::{delete_in_chunks, report_failure, CleanupAgent, CleanupReport};
use crate::config::{CleanupConfig, OldPipelineCleanupConfig};
use crate::core::ExecutionType;
use crate::errors::{EngineError, RepositoryError};
use crate::model::ExecutionSummary;
use crate::observability::MetricsSink;
use crate::repository::{sort_summaries_newest_first, ExecutionCriteria, ExecutionRepository};
use crate::utils::{Clock, SystemClock, Timestamp};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const AGENT_NAME: &str = "old-pipeline-cleanup";

/// Deletes complete pipeline executions past their retention age.
///
/// Executions are grouped by pipeline config. The newest
/// `minimum_executions` of each group are always kept; the rest are
/// deleted once they are older than the threshold.
pub struct OldPipelineCleanupAgent {
    repository: Arc<dyn ExecutionRepository>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    config: OldPipelineCleanupConfig,
    chunk_size: usize,
}

impl OldPipelineCleanupAgent {
    /// Creates the agent.
    #[must_use]
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        metrics: Arc<dyn MetricsSink>,
        config: &CleanupConfig,
    ) -> Self {
        Self {
            repository,
            metrics,
            clock: Arc::new(SystemClock),
            config: config.old_pipelines.clone(),
            chunk_size: config.chunk_size,
        }
    }

    /// Sets the clock ages are measured against.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cutoff_for(&self, application: &str) -> Timestamp {
        let days = if self
            .config
            .exceptional_applications
            .iter()
            .any(|a| a == application)
        {
            self.config.exceptional_threshold_days
        } else {
            self.config.threshold_days
        };
        self.clock.now() - chrono::Duration::days(i64::from(days))
    }

    /// Picks the executions of one application to delete.
    fn expired(&self, application: &str, summaries: Vec<ExecutionSummary>) -> Vec<String> {
        let cutoff = self.cutoff_for(application);
        let mut by_config: BTreeMap<Option<String>, Vec<ExecutionSummary>> = BTreeMap::new();
        for summary in summaries {
            by_config
                .entry(summary.pipeline_config_id.clone())
                .or_default()
                .push(summary);
        }

        let mut expired = Vec::new();
        for group in by_config.values_mut() {
            sort_summaries_newest_first(group);
            expired.extend(
                group
                    .iter()
                    .skip(self.config.minimum_executions)
                    .filter(|s| s.sort_time().is_some_and(|t| t < cutoff))
                    .map(|s| s.id.clone()),
            );
        }
        expired
    }

    async fn clean_application(&self, application: &str) -> Result<usize, RepositoryError> {
        let criteria = ExecutionCriteria::new(ExecutionType::Pipeline)
            .with_application(application)
            .complete();
        let summaries = self.repository.summaries(&criteria).await?;
        let expired = self.expired(application, summaries);
        if expired.is_empty() {
            return Ok(0);
        }
        debug!(
            agent = AGENT_NAME,
            application,
            count = expired.len(),
            "Deleting expired pipeline executions"
        );
        delete_in_chunks(
            self.repository.as_ref(),
            self.metrics.as_ref(),
            ExecutionType::Pipeline,
            application,
            &expired,
            self.chunk_size,
        )
        .await
    }
}

#[async_trait]
impl CleanupAgent for OldPipelineCleanupAgent {
    fn name(&self) -> &str {
        AGENT_NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    async fn run_pass(&self) -> Result<CleanupReport, EngineError> {
        let applications = self
            .repository
            .application_names(ExecutionType::Pipeline)
            .await?;

        let mut report = CleanupReport::default();
        for application in &applications {
            let outcome = self.clean_application(application).await;
            if let Err(err) = &outcome {
                report_failure(self.metrics.as_ref(), AGENT_NAME, application, err);
            }
            report.record(application, outcome);
        }
        Ok(report)
    }
}

impl std::fmt::Debug for OldPipelineCleanupAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OldPipelineCleanupAgent")
            .field("config", &self.config)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionStatus;
    use crate::observability::{metric_names, InMemoryMetricsSink};
    use crate::config::{dynamic_keys, InMemoryDynamicConfig};
    use crate::repository::{DualExecutionRepository, InMemoryExecutionRepository};
    use crate::testing::{fixtures, FaultyRepository};
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn days_ago(days: i64) -> Timestamp {
        now() - chrono::Duration::days(days)
    }

    async fn seed(
        repository: &InMemoryExecutionRepository,
        application: &str,
        config_id: &str,
        ages_in_days: &[i64],
    ) {
        for age in ages_in_days {
            let execution = fixtures::completed(
                ExecutionType::Pipeline,
                application,
                Some(config_id),
                days_ago(*age),
            );
            repository.create(execution).await.unwrap();
        }
    }

    fn agent(
        repository: Arc<dyn ExecutionRepository>,
        metrics: Arc<InMemoryMetricsSink>,
        config: OldPipelineCleanupConfig,
    ) -> OldPipelineCleanupAgent {
        let cleanup = CleanupConfig {
            chunk_size: 2,
            old_pipelines: config,
            ..CleanupConfig::default()
        };
        OldPipelineCleanupAgent::new(repository, metrics, &cleanup)
            .with_clock(Arc::new(ManualClock::new(now())))
    }

    async fn remaining_ages(repository: &InMemoryExecutionRepository, application: &str) -> Vec<i64> {
        let criteria = ExecutionCriteria::new(ExecutionType::Pipeline).with_application(application);
        repository
            .summaries(&criteria)
            .await
            .unwrap()
            .iter()
            .map(|s| (now() - s.sort_time().unwrap()).num_days())
            .collect()
    }

    #[tokio::test]
    async fn test_keeps_minimum_and_deletes_old_executions() {
        let repository = Arc::new(InMemoryExecutionRepository::new());
        seed(
            &repository,
            "orca",
            "deploy",
            &[1, 2, 3, 40, 41, 42, 43, 44, 45, 46],
        )
        .await;
        let metrics = Arc::new(InMemoryMetricsSink::new());

        let report = agent(repository.clone(), metrics.clone(), OldPipelineCleanupConfig::default())
            .run_pass()
            .await
            .unwrap();

        assert_eq!(report.deleted, 5);
        assert!(report.failed_applications.is_empty());
        assert_eq!(remaining_ages(&repository, "orca").await, vec![1, 2, 3, 40, 41]);
        assert_eq!(
            metrics.counter_with(
                metric_names::CLEANUP_DELETED,
                &[("application", "orca"), ("executionType", "pipeline")]
            ),
            5
        );
    }

    #[tokio::test]
    async fn test_young_executions_survive_beyond_minimum() {
        let repository = Arc::new(InMemoryExecutionRepository::new());
        seed(&repository, "orca", "deploy", &[1, 2, 3, 4, 5, 6, 7, 8]).await;

        let report = agent(
            repository.clone(),
            Arc::new(InMemoryMetricsSink::new()),
            OldPipelineCleanupConfig::default(),
        )
        .run_pass()
        .await
        .unwrap();

        assert_eq!(report.deleted, 0);
        assert_eq!(repository.len(), 8);
    }

    #[tokio::test]
    async fn test_groups_by_pipeline_config() {
        let repository = Arc::new(InMemoryExecutionRepository::new());
        seed(&repository, "orca", "deploy", &[50, 51, 52]).await;
        seed(&repository, "orca", "rollback", &[60, 61, 62]).await;
        let config = OldPipelineCleanupConfig {
            minimum_executions: 2,
            ..OldPipelineCleanupConfig::default()
        };

        let report = agent(repository.clone(), Arc::new(InMemoryMetricsSink::new()), config)
            .run_pass()
            .await
            .unwrap();

        assert_eq!(report.deleted, 2);
        assert_eq!(remaining_ages(&repository, "orca").await, vec![50, 51, 60, 61]);
    }

    #[tokio::test]
    async fn test_exceptional_applications_use_their_own_threshold() {
        let repository = Arc::new(InMemoryExecutionRepository::new());
        seed(&repository, "orca", "deploy", &[40, 41, 42]).await;
        seed(&repository, "audit", "deploy", &[40, 41, 42]).await;
        let config = OldPipelineCleanupConfig {
            minimum_executions: 0,
            exceptional_applications: vec!["audit".to_string()],
            exceptional_threshold_days: 90,
            ..OldPipelineCleanupConfig::default()
        };

        let report = agent(repository.clone(), Arc::new(InMemoryMetricsSink::new()), config)
            .run_pass()
            .await
            .unwrap();

        assert_eq!(report.deleted, 3);
        assert!(remaining_ages(&repository, "orca").await.is_empty());
        assert_eq!(remaining_ages(&repository, "audit").await.len(), 3);
    }

    #[tokio::test]
    async fn test_running_executions_are_never_deleted() {
        let repository = Arc::new(InMemoryExecutionRepository::new());
        for _ in 0..8 {
            let mut execution = fixtures::completed(
                ExecutionType::Pipeline,
                "orca",
                Some("deploy"),
                days_ago(100),
            );
            execution.status = ExecutionStatus::Running;
            execution.end_time = None;
            repository.create(execution).await.unwrap();
        }

        let report = agent(
            repository.clone(),
            Arc::new(InMemoryMetricsSink::new()),
            OldPipelineCleanupConfig::default(),
        )
        .run_pass()
        .await
        .unwrap();

        assert_eq!(report.deleted, 0);
        assert_eq!(repository.len(), 8);
    }

    #[tokio::test]
    async fn test_failure_for_one_application_does_not_stop_others() {
        let inner = Arc::new(InMemoryExecutionRepository::new());
        seed(&inner, "broken", "deploy", &[40, 41, 42, 43, 44, 45]).await;
        seed(&inner, "healthy", "deploy", &[40, 41, 42, 43, 44, 45]).await;
        let faulty = Arc::new(FaultyRepository::new(inner.clone()));
        faulty.fail_application("broken");
        let metrics = Arc::new(InMemoryMetricsSink::new());

        let report = agent(faulty, metrics.clone(), OldPipelineCleanupConfig::default())
            .run_pass()
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed_applications, vec!["broken".to_string()]);
        assert_eq!(remaining_ages(&inner, "broken").await.len(), 6);
        assert_eq!(remaining_ages(&inner, "healthy").await.len(), 5);
        assert_eq!(
            metrics.counter_with(
                metric_names::CLEANUP_ERRORS,
                &[("agent", AGENT_NAME), ("application", "broken")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn test_secondary_records_do_not_count_toward_minimum() {
        let primary = Arc::new(InMemoryExecutionRepository::new());
        let secondary = Arc::new(InMemoryExecutionRepository::new());
        seed(&primary, "orca", "deploy", &[40, 41, 42, 43, 44]).await;
        seed(&secondary, "orca", "deploy", &[1, 2, 3, 4, 5]).await;
        let flags = Arc::new(InMemoryDynamicConfig::new());
        flags.set(dynamic_keys::READ_FALLBACK_ENABLED, true);
        let dual = Arc::new(DualExecutionRepository::new(
            primary.clone(),
            secondary.clone(),
            flags,
        ));

        let report = agent(dual, Arc::new(InMemoryMetricsSink::new()), OldPipelineCleanupConfig::default())
            .run_pass()
            .await
            .unwrap();

        assert_eq!(report.deleted, 0);
        assert_eq!(remaining_ages(&primary, "orca").await, vec![40, 41, 42, 43, 44]);
        assert_eq!(secondary.len(), 5);
    }
}
