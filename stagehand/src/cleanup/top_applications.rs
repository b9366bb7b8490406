//! Count-based retention of orchestrations.

use super::{delete_in_chunks, report_failure, CleanupAgent, CleanupReport};
use crate::config::{CleanupConfig, TopApplicationCleanupConfig};
use crate::core::ExecutionType;
use crate::errors::{EngineError, RepositoryError};
use crate::observability::MetricsSink;
use crate::repository::{sort_summaries_newest_first, ExecutionCriteria, ExecutionRepository};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const AGENT_NAME: &str = "top-application-cleanup";

/// Caps the number of orchestrations kept per application.
///
/// Walks the application index page by page. For every application over
/// the threshold, the oldest complete orchestrations are deleted until the
/// count is back at the threshold.
pub struct TopApplicationExecutionCleanupAgent {
    repository: Arc<dyn ExecutionRepository>,
    metrics: Arc<dyn MetricsSink>,
    config: TopApplicationCleanupConfig,
    chunk_size: usize,
}

impl TopApplicationExecutionCleanupAgent {
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
            config: config.top_applications.clone(),
            chunk_size: config.chunk_size,
        }
    }

    async fn clean_application(
        &self,
        application: &str,
        count: usize,
    ) -> Result<usize, RepositoryError> {
        let excess = count.saturating_sub(self.config.threshold);
        let criteria = ExecutionCriteria::new(ExecutionType::Orchestration)
            .with_application(application)
            .complete();
        let mut summaries = self.repository.summaries(&criteria).await?;
        sort_summaries_newest_first(&mut summaries);

        let oldest: Vec<String> = summaries
            .iter()
            .rev()
            .take(excess)
            .map(|s| s.id.clone())
            .collect();
        info!(
            agent = AGENT_NAME,
            application,
            count,
            deleting = oldest.len(),
            "Application over orchestration threshold"
        );
        delete_in_chunks(
            self.repository.as_ref(),
            self.metrics.as_ref(),
            ExecutionType::Orchestration,
            application,
            &oldest,
            self.chunk_size,
        )
        .await
    }
}

#[async_trait]
impl CleanupAgent for TopApplicationExecutionCleanupAgent {
    fn name(&self) -> &str {
        AGENT_NAME
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.interval_ms)
    }

    async fn run_pass(&self) -> Result<CleanupReport, EngineError> {
        let mut report = CleanupReport::default();
        let mut cursor: Option<String> = None;
        let mut pages = 0_usize;

        loop {
            let page = self
                .repository
                .scan_applications(
                    ExecutionType::Orchestration,
                    cursor.as_deref(),
                    self.config.page_size.max(1),
                )
                .await?;
            pages += 1;

            for (application, count) in &page.entries {
                if *count <= self.config.threshold {
                    continue;
                }
                let outcome = self.clean_application(application, *count).await;
                if let Err(err) = &outcome {
                    report_failure(self.metrics.as_ref(), AGENT_NAME, application, err);
                }
                report.record(application, outcome);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(agent = AGENT_NAME, pages, "Application index scan complete");
        Ok(report)
    }
}

impl std::fmt::Debug for TopApplicationExecutionCleanupAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopApplicationExecutionCleanupAgent")
            .field("config", &self.config)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}
