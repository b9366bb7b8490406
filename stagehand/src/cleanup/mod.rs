//! Scheduled retention agents.
//!
//! Each [`CleanupAgent`] runs one pass at a time on its own interval. The
//! [`AgentScheduler`] takes a cluster-wide lease per agent before each pass,
//! so only one worker in the fleet runs a given agent at once.

mod old_pipelines;
mod top_applications;

pub use old_pipelines::OldPipelineCleanupAgent;
pub use top_applications::TopApplicationExecutionCleanupAgent;

use crate::config::CleanupConfig;
use crate::core::ExecutionType;
use crate::errors::{EngineError, RepositoryError};
use crate::lock::{agent_lock_key, LockManager};
use crate::observability::{metric_names, MetricsSink};
use crate::repository::ExecutionRepository;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// The outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Executions deleted.
    pub deleted: usize,
    /// Applications whose cleanup failed.
    pub failed_applications: Vec<String>,
}

impl CleanupReport {
    fn record(&mut self, application: &str, outcome: Result<usize, RepositoryError>) {
        match outcome {
            Ok(deleted) => self.deleted += deleted,
            Err(_) => self.failed_applications.push(application.to_string()),
        }
    }
}

/// A retention policy run on a schedule.
#[async_trait]
pub trait CleanupAgent: Send + Sync {
    /// Stable name, used for the lease key and metric tags.
    fn name(&self) -> &str;

    /// Time between passes.
    fn interval(&self) -> Duration;

    /// Runs one pass.
    ///
    /// Per-application failures are reported in the result; an error means
    /// the pass could not run at all.
    async fn run_pass(&self) -> Result<CleanupReport, EngineError>;
}

/// Deletes `ids` in chunks, counting deletions against `application`.
pub(crate) async fn delete_in_chunks(
    repository: &dyn ExecutionRepository,
    metrics: &dyn MetricsSink,
    execution_type: ExecutionType,
    application: &str,
    ids: &[String],
    chunk_size: usize,
) -> Result<usize, RepositoryError> {
    let type_tag = execution_type.to_string();
    let mut deleted = 0;
    for chunk in ids.chunks(chunk_size.max(1)) {
        let removed = repository.delete_all(execution_type, chunk).await?;
        metrics.increment_counter(
            metric_names::CLEANUP_DELETED,
            &[
                ("application", application),
                ("executionType", type_tag.as_str()),
            ],
            u64::try_from(removed).unwrap_or(u64::MAX),
        );
        deleted += removed;
    }
    Ok(deleted)
}

/// Logs and counts a failed per-application cleanup.
pub(crate) fn report_failure(
    metrics: &dyn MetricsSink,
    agent: &str,
    application: &str,
    err: &RepositoryError,
) {
    error!(agent, application, error = %err, "Cleanup failed for application");
    metrics.increment_counter(
        metric_names::CLEANUP_ERRORS,
        &[("agent", agent), ("application", application)],
        1,
    );
}

/// Runs cleanup agents under per-agent cluster leases.
pub struct AgentScheduler {
    agents: Vec<Arc<dyn CleanupAgent>>,
    locks: Arc<dyn LockManager>,
    metrics: Arc<dyn MetricsSink>,
    lock_ttl: Duration,
}

impl AgentScheduler {
    /// Creates a scheduler with no agents.
    #[must_use]
    pub fn new(
        locks: Arc<dyn LockManager>,
        metrics: Arc<dyn MetricsSink>,
        config: &CleanupConfig,
    ) -> Self {
        Self {
            agents: Vec::new(),
            locks,
            metrics,
            lock_ttl: config.lock_ttl(),
        }
    }

    /// Adds an agent.
    #[must_use]
    pub fn with_agent(mut self, agent: Arc<dyn CleanupAgent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Number of scheduled agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Returns true if no agents are scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Runs one pass of `agent` if its lease is free.
    ///
    /// Returns `Ok(None)` when another worker holds the lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock manager is unavailable or the pass
    /// itself failed.
    pub async fn run_once(
        &self,
        agent: &dyn CleanupAgent,
    ) -> Result<Option<CleanupReport>, EngineError> {
        let key = agent_lock_key(agent.name());
        let Some(lease) = self.locks.try_acquire(&key, self.lock_ttl).await? else {
            debug!(agent = agent.name(), "Agent lease held elsewhere, skipping pass");
            return Ok(None);
        };

        let started = Instant::now();
        let outcome = agent.run_pass().await;
        self.metrics.record_timer(
            metric_names::CLEANUP_PASS_DURATION,
            &[
                ("agent", agent.name()),
                ("success", if outcome.is_ok() { "true" } else { "false" }),
            ],
            started.elapsed(),
        );

        if let Err(err) = self.locks.release(&lease).await {
            warn!(agent = agent.name(), error = %err, "Failed to release agent lease");
        }

        let report = outcome?;
        info!(
            agent = agent.name(),
            deleted = report.deleted,
            failed_applications = report.failed_applications.len(),
            "Cleanup pass complete"
        );
        Ok(Some(report))
    }

    /// Spawns one loop per agent, each ticking on the agent's interval.
    #[must_use]
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = self
            .agents
            .iter()
            .map(|agent| {
                let agent = Arc::clone(agent);
                let scheduler = Arc::clone(&self);
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(agent.interval().max(Duration::from_millis(1)));
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                if let Err(err) = scheduler.run_once(agent.as_ref()).await {
                                    error!(agent = agent.name(), error = %err, "Cleanup pass failed");
                                }
                            }
                            _ = shutdown.changed() => break,
                        }
                    }
                    debug!(agent = agent.name(), "Agent loop stopped");
                })
            })
            .collect();
        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

impl std::fmt::Debug for AgentScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.agents.iter().map(|a| a.name()).collect();
        f.debug_struct("AgentScheduler")
            .field("agents", &names)
            .field("lock_ttl", &self.lock_ttl)
            .finish_non_exhaustive()
    }
}

/// Handle to running agent loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stops every agent loop, waiting for in-progress passes to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if an agent loop panicked.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            task.await
                .map_err(|err| EngineError::Internal(format!("agent loop failed: {err}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LockError;
    use crate::lock::{InMemoryLockManager, MockLockManager};
    use crate::observability::InMemoryMetricsSink;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct CountingAgent {
        passes: Mutex<usize>,
    }

    #[async_trait]
    impl CleanupAgent for CountingAgent {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run_pass(&self) -> Result<CleanupReport, EngineError> {
            *self.passes.lock() += 1;
            Ok(CleanupReport {
                deleted: 3,
                failed_applications: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_run_once_records_duration_and_releases_lease() {
        let locks = Arc::new(InMemoryLockManager::new());
        let metrics = Arc::new(InMemoryMetricsSink::new());
        let scheduler = AgentScheduler::new(locks.clone(), metrics.clone(), &CleanupConfig::default());
        let agent = CountingAgent::default();

        let report = scheduler.run_once(&agent).await.unwrap().unwrap();

        assert_eq!(report.deleted, 3);
        assert_eq!(metrics.timer_count(metric_names::CLEANUP_PASS_DURATION), 1);
        assert!(!locks.is_held(&agent_lock_key("counting")));
    }

    #[tokio::test]
    async fn test_run_once_skips_when_lease_is_held() {
        let locks = Arc::new(InMemoryLockManager::new());
        let held = locks
            .try_acquire(&agent_lock_key("counting"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(held.is_some());

        let metrics = Arc::new(InMemoryMetricsSink::new());
        let scheduler = AgentScheduler::new(locks, metrics.clone(), &CleanupConfig::default());
        let agent = CountingAgent::default();

        assert!(scheduler.run_once(&agent).await.unwrap().is_none());
        assert_eq!(*agent.passes.lock(), 0);
        assert_eq!(metrics.timer_count(metric_names::CLEANUP_PASS_DURATION), 0);
    }

    #[tokio::test]
    async fn test_lock_outage_surfaces_as_error() {
        let mut locks = MockLockManager::new();
        locks
            .expect_try_acquire()
            .withf(|key, _| key.ends_with(":counting"))
            .returning(|_, _| Err(LockError::Unavailable("timeout".to_string())));
        let scheduler = AgentScheduler::new(
            Arc::new(locks),
            Arc::new(InMemoryMetricsSink::new()),
            &CleanupConfig::default(),
        );
        let agent = CountingAgent::default();

        let err = scheduler.run_once(&agent).await.unwrap_err();
        assert!(matches!(err, EngineError::Lock(_)));
        assert_eq!(*agent.passes.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_scheduler_runs_on_interval() {
        let agent = Arc::new(CountingAgent::default());
        let scheduler = Arc::new(
            AgentScheduler::new(
                Arc::new(InMemoryLockManager::new()),
                Arc::new(InMemoryMetricsSink::new()),
                &CleanupConfig::default(),
            )
            .with_agent(agent.clone()),
        );
        assert_eq!(scheduler.len(), 1);

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_secs(150)).await;
        handle.shutdown().await.unwrap();

        // Ticks at 0s, 60s and 120s.
        assert_eq!(*agent.passes.lock(), 3);
    }
}
