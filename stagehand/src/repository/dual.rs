//! Repository that reads across a primary and a secondary backend.
//!
//! Writes always go to the primary. Point reads fall back to the secondary
//! only while the read-fallback flag is on and the primary reports
//! not-found; list reads query both backends concurrently and merge.
//! Retention reads (summaries and the application index) see the primary
//! only.

use super::{sort_newest_first, ApplicationPage, ExecutionCriteria, ExecutionRepository};
use crate::config::{dynamic_keys, DynamicConfig};
use crate::core::{ExecutionStatus, ExecutionType};
use crate::errors::RepositoryError;
use crate::model::{ExecutionSummary, PipelineExecution, StageExecution};
use crate::observability::{metric_names, MetricsSink, NoOpMetricsSink};
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Dual-backend execution repository.
pub struct DualExecutionRepository {
    primary: Arc<dyn ExecutionRepository>,
    secondary: Arc<dyn ExecutionRepository>,
    flags: Arc<dyn DynamicConfig>,
    metrics: Arc<dyn MetricsSink>,
    list_timeout: Duration,
}

impl DualExecutionRepository {
    /// Creates a dual repository.
    #[must_use]
    pub fn new(
        primary: Arc<dyn ExecutionRepository>,
        secondary: Arc<dyn ExecutionRepository>,
        flags: Arc<dyn DynamicConfig>,
    ) -> Self {
        Self {
            primary,
            secondary,
            flags,
            metrics: Arc::new(NoOpMetricsSink),
            list_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets how long list reads wait for the secondary.
    #[must_use]
    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }

    fn fallback_enabled(&self) -> bool {
        self.flags
            .get_bool(dynamic_keys::READ_FALLBACK_ENABLED, false)
    }

    /// Runs a read against both backends and merges the results.
    ///
    /// A primary failure is returned; a secondary failure or timeout is
    /// logged and the primary's result stands alone.
    async fn read_both<T, P, S>(
        &self,
        operation: &'static str,
        primary: P,
        secondary: S,
    ) -> Result<(Vec<T>, Vec<T>), RepositoryError>
    where
        P: Future<Output = Result<Vec<T>, RepositoryError>>,
        S: Future<Output = Result<Vec<T>, RepositoryError>>,
    {
        let (primary, secondary) =
            tokio::join!(primary, tokio::time::timeout(self.list_timeout, secondary));
        let primary = primary?;

        let secondary = match secondary {
            Ok(Ok(found)) => found,
            Ok(Err(err)) => {
                warn!(operation, error = %err, "Secondary repository read failed");
                self.record_secondary_failure(operation, "error");
                Vec::new()
            }
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = u64::try_from(self.list_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Secondary repository read timed out"
                );
                self.record_secondary_failure(operation, "timeout");
                Vec::new()
            }
        };
        Ok((primary, secondary))
    }

    fn record_secondary_failure(&self, operation: &str, cause: &str) {
        self.metrics.increment_counter(
            metric_names::DUAL_SECONDARY_FAILURES,
            &[("operation", operation), ("cause", cause)],
            1,
        );
    }

    fn record_fallback(&self, operation: &str) {
        self.metrics
            .increment_counter(metric_names::DUAL_FALLBACK_READS, &[("operation", operation)], 1);
    }
}

impl std::fmt::Debug for DualExecutionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualExecutionRepository")
            .field("list_timeout", &self.list_timeout)
            .field("fallback_enabled", &self.fallback_enabled())
            .finish_non_exhaustive()
    }
}

/// Appends secondary entries whose id the primary does not already hold.
fn merge_by_id<T>(mut primary: Vec<T>, secondary: Vec<T>, id: impl Fn(&T) -> &str) -> Vec<T> {
    let seen: HashSet<String> = primary.iter().map(|e| id(e).to_string()).collect();
    primary.extend(secondary.into_iter().filter(|e| !seen.contains(id(e))));
    primary
}

#[async_trait]
impl ExecutionRepository for DualExecutionRepository {
    fn partition(&self) -> Option<&str> {
        self.primary.partition()
    }

    async fn create(&self, execution: PipelineExecution) -> Result<String, RepositoryError> {
        self.primary.create(execution).await
    }

    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        self.primary.store(execution).await
    }

    async fn store_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage: &StageExecution,
    ) -> Result<(), RepositoryError> {
        self.primary
            .store_stage(execution_type, execution_id, stage)
            .await
    }

    async fn get(
        &self,
        execution_type: ExecutionType,
        id: &str,
    ) -> Result<PipelineExecution, RepositoryError> {
        match self.primary.get(execution_type, id).await {
            Err(err) if err.is_not_found() && self.fallback_enabled() => {
                debug!(%execution_type, id, "Execution not in primary, reading secondary");
                match self.secondary.get(execution_type, id).await {
                    Ok(found) => {
                        self.record_fallback("get");
                        Ok(found)
                    }
                    Err(secondary) if secondary.is_not_found() => Err(err),
                    Err(secondary) => Err(secondary),
                }
            }
            other => other,
        }
    }

    async fn get_by_client_request_id(
        &self,
        execution_type: ExecutionType,
        client_request_id: &str,
    ) -> Result<Option<PipelineExecution>, RepositoryError> {
        let found = self
            .primary
            .get_by_client_request_id(execution_type, client_request_id)
            .await?;
        if found.is_some() || !self.fallback_enabled() {
            return Ok(found);
        }

        let fallback = self
            .secondary
            .get_by_client_request_id(execution_type, client_request_id)
            .await?;
        if fallback.is_some() {
            self.record_fallback("get_by_client_request_id");
        }
        Ok(fallback)
    }

    async fn list(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        let (primary, secondary) = self
            .read_both("list", self.primary.list(criteria), self.secondary.list(criteria))
            .await?;
        let mut merged = merge_by_id(primary, secondary, |e| e.id.as_str());
        sort_newest_first(&mut merged);
        if let Some(limit) = criteria.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    async fn list_by_this_instance(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        let (primary, secondary) = self
            .read_both(
                "list_by_this_instance",
                self.primary.list_by_this_instance(criteria),
                self.secondary.list_by_this_instance(criteria),
            )
            .await?;
        let mut merged = merge_by_id(primary, secondary, |e| e.id.as_str());
        sort_newest_first(&mut merged);
        if let Some(limit) = criteria.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    /// Summaries feed retention, and deletes reach the primary only, so the
    /// secondary's records must not take the "keep newest" slots.
    async fn summaries(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<ExecutionSummary>, RepositoryError> {
        self.primary.summaries(criteria).await
    }

    async fn application_names(
        &self,
        execution_type: ExecutionType,
    ) -> Result<Vec<String>, RepositoryError> {
        self.primary.application_names(execution_type).await
    }

    /// Scans the primary's index only.
    async fn scan_applications(
        &self,
        execution_type: ExecutionType,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ApplicationPage, RepositoryError> {
        self.primary
            .scan_applications(execution_type, cursor, limit)
            .await
    }

    async fn delete(&self, execution_type: ExecutionType, id: &str) -> Result<(), RepositoryError> {
        self.primary.delete(execution_type, id).await
    }

    async fn delete_all(
        &self,
        execution_type: ExecutionType,
        ids: &[String],
    ) -> Result<usize, RepositoryError> {
        self.primary.delete_all(execution_type, ids).await
    }

    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        self.primary.update_status(execution_type, id, status).await
    }

    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        self.primary.cancel(execution_type, id, user, reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryDynamicConfig;
    use crate::observability::InMemoryMetricsSink;
    use crate::repository::InMemoryExecutionRepository;
    use crate::testing::FaultyRepository;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    struct Fixture {
        primary: Arc<InMemoryExecutionRepository>,
        secondary: Arc<InMemoryExecutionRepository>,
        flags: Arc<InMemoryDynamicConfig>,
        metrics: Arc<InMemoryMetricsSink>,
        dual: DualExecutionRepository,
    }

    fn fixture() -> Fixture {
        let primary = Arc::new(InMemoryExecutionRepository::new());
        let secondary = Arc::new(InMemoryExecutionRepository::new());
        let flags = Arc::new(InMemoryDynamicConfig::new());
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let dual = DualExecutionRepository::new(primary.clone(), secondary.clone(), flags.clone())
            .with_metrics(metrics.clone());
        Fixture {
            primary,
            secondary,
            flags,
            metrics,
            dual,
        }
    }

    fn execution(id: &str, hour: u32) -> PipelineExecution {
        let mut e = PipelineExecution::new(id, ExecutionType::Pipeline, "app");
        e.start_time = Some(Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap());
        e
    }

    #[tokio::test]
    async fn test_get_falls_back_only_when_enabled() {
        let f = fixture();
        f.secondary.create(execution("old", 1)).await.unwrap();

        let err = f.dual.get(ExecutionType::Pipeline, "old").await.unwrap_err();
        assert!(err.is_not_found());

        f.flags
            .set(dynamic_keys::READ_FALLBACK_ENABLED, true);
        let found = f.dual.get(ExecutionType::Pipeline, "old").await.unwrap();
        assert_eq!(found.id, "old");
        assert_eq!(f.metrics.counter(metric_names::DUAL_FALLBACK_READS), 1);

        let missing = f
            .dual
            .get(ExecutionType::Pipeline, "nowhere")
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_get_does_not_fall_back_on_other_errors() {
        let primary = Arc::new(FaultyRepository::new(Arc::new(
            InMemoryExecutionRepository::new(),
        )));
        primary.fail_everything();
        let secondary = Arc::new(InMemoryExecutionRepository::new());
        secondary.create(execution("old", 1)).await.unwrap();
        let flags = Arc::new(InMemoryDynamicConfig::new());
        flags.set(dynamic_keys::READ_FALLBACK_ENABLED, true);

        let dual = DualExecutionRepository::new(primary, secondary, flags);
        let err = dual.get(ExecutionType::Pipeline, "old").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_writes_go_to_primary() {
        let f = fixture();
        f.dual.create(execution("new", 1)).await.unwrap();

        assert_eq!(f.primary.len(), 1);
        assert!(f.secondary.is_empty());
    }

    #[tokio::test]
    async fn test_list_merges_with_primary_winning() {
        let f = fixture();
        let mut fresh = execution("shared", 2);
        fresh.status = ExecutionStatus::Running;
        f.primary.create(fresh).await.unwrap();
        f.primary.create(execution("p-only", 3)).await.unwrap();
        f.secondary.create(execution("shared", 2)).await.unwrap();
        f.secondary.create(execution("s-only", 1)).await.unwrap();

        let listed = f
            .dual
            .list(&ExecutionCriteria::new(ExecutionType::Pipeline))
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["p-only", "shared", "s-only"]);
        assert_eq!(listed[1].status, ExecutionStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_tolerates_slow_secondary() {
        let primary = Arc::new(InMemoryExecutionRepository::new());
        primary.create(execution("p", 1)).await.unwrap();
        let inner = Arc::new(InMemoryExecutionRepository::new());
        inner.create(execution("s", 2)).await.unwrap();
        let secondary =
            Arc::new(FaultyRepository::new(inner).with_read_delay(Duration::from_secs(30)));
        let metrics = Arc::new(InMemoryMetricsSink::new());

        let dual = DualExecutionRepository::new(
            primary,
            secondary,
            Arc::new(InMemoryDynamicConfig::new()),
        )
        .with_metrics(metrics.clone())
        .with_list_timeout(Duration::from_secs(1));

        let listed = dual
            .list(&ExecutionCriteria::new(ExecutionType::Pipeline))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "p");
        assert_eq!(metrics.counter(metric_names::DUAL_SECONDARY_FAILURES), 1);
    }

    #[tokio::test]
    async fn test_list_tolerates_failing_secondary() {
        let primary = Arc::new(InMemoryExecutionRepository::new());
        primary.create(execution("p", 1)).await.unwrap();
        let secondary = Arc::new(FaultyRepository::new(Arc::new(
            InMemoryExecutionRepository::new(),
        )));
        secondary.fail_everything();

        let dual = DualExecutionRepository::new(
            primary,
            secondary,
            Arc::new(InMemoryDynamicConfig::new()),
        );
        let listed = dual
            .list(&ExecutionCriteria::new(ExecutionType::Pipeline))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "p");
    }

    #[tokio::test]
    async fn test_retention_reads_see_primary_only() {
        let f = fixture();
        f.primary.create(execution("p", 1)).await.unwrap();
        let mut other = execution("s", 2);
        other.application = "legacy".to_string();
        f.secondary.create(other).await.unwrap();
        f.secondary.create(execution("s-app", 3)).await.unwrap();

        let summaries = f
            .dual
            .summaries(&ExecutionCriteria::new(ExecutionType::Pipeline))
            .await
            .unwrap();
        let ids: Vec<&str> = summaries.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["p"]);

        let names = f
            .dual
            .application_names(ExecutionType::Pipeline)
            .await
            .unwrap();
        assert_eq!(names, vec!["app"]);
    }
}
