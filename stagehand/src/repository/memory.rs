//! In-memory execution repository.

use super::{
    sort_newest_first, sort_summaries_newest_first, ApplicationPage, ExecutionCriteria,
    ExecutionRepository,
};
use crate::core::{ExecutionStatus, ExecutionType};
use crate::errors::RepositoryError;
use crate::model::{ExecutionSummary, PipelineExecution, StageExecution};
use crate::utils::{Clock, SystemClock};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

type ExecutionKey = (ExecutionType, String);

#[derive(Default)]
struct Store {
    executions: HashMap<ExecutionKey, PipelineExecution>,
    by_client_request: HashMap<ExecutionKey, String>,
    by_application: BTreeMap<ExecutionKey, BTreeSet<String>>,
}

impl Store {
    fn index(&mut self, execution: &PipelineExecution) {
        self.by_application
            .entry((execution.execution_type, execution.application.clone()))
            .or_default()
            .insert(execution.id.clone());
        if let Some(request_id) = &execution.client_request_id {
            self.by_client_request.insert(
                (execution.execution_type, request_id.clone()),
                execution.id.clone(),
            );
        }
    }

    fn remove(&mut self, execution_type: ExecutionType, id: &str) -> bool {
        let Some(removed) = self.executions.remove(&(execution_type, id.to_string())) else {
            return false;
        };
        let app_key = (execution_type, removed.application.clone());
        if let Some(ids) = self.by_application.get_mut(&app_key) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_application.remove(&app_key);
            }
        }
        if let Some(request_id) = removed.client_request_id {
            self.by_client_request.remove(&(execution_type, request_id));
        }
        true
    }

    fn get_mut(
        &mut self,
        execution_type: ExecutionType,
        id: &str,
    ) -> Result<&mut PipelineExecution, RepositoryError> {
        self.executions
            .get_mut(&(execution_type, id.to_string()))
            .ok_or_else(|| RepositoryError::not_found(execution_type, id))
    }
}

/// Execution repository backed by process memory.
///
/// Keeps a per-application index so retention scans can page through
/// applications without loading executions.
pub struct InMemoryExecutionRepository {
    store: RwLock<Store>,
    partition: Option<String>,
    clock: Arc<dyn Clock>,
}

impl InMemoryExecutionRepository {
    /// Creates an empty, unpartitioned repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: RwLock::new(Store::default()),
            partition: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the partition this repository handles.
    #[must_use]
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Sets the clock used for status timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of stored executions across both types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().executions.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching(&self, criteria: &ExecutionCriteria) -> Vec<PipelineExecution> {
        let store = self.store.read();
        let mut found: Vec<PipelineExecution> = match &criteria.application {
            Some(app) => store
                .by_application
                .get(&(criteria.execution_type, app.clone()))
                .into_iter()
                .flatten()
                .filter_map(|id| store.executions.get(&(criteria.execution_type, id.clone())))
                .filter(|e| criteria.matches(e))
                .cloned()
                .collect(),
            None => store
                .executions
                .values()
                .filter(|e| criteria.matches(e))
                .cloned()
                .collect(),
        };
        drop(store);

        sort_newest_first(&mut found);
        if let Some(limit) = criteria.limit {
            found.truncate(limit);
        }
        found
    }
}

impl Default for InMemoryExecutionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryExecutionRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryExecutionRepository")
            .field("partition", &self.partition)
            .field("executions", &self.len())
            .finish()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    async fn create(&self, mut execution: PipelineExecution) -> Result<String, RepositoryError> {
        let mut store = self.store.write();

        if let Some(request_id) = &execution.client_request_id {
            if let Some(existing) = store
                .by_client_request
                .get(&(execution.execution_type, request_id.clone()))
            {
                return Ok(existing.clone());
            }
        }

        let key = (execution.execution_type, execution.id.clone());
        if store.executions.contains_key(&key) {
            return Err(RepositoryError::Duplicate(execution.id));
        }

        if execution.partition.is_none() {
            execution.partition = self.partition.clone();
        }
        if execution.build_time.is_none() {
            execution.build_time = Some(self.clock.now());
        }

        store.index(&execution);
        let id = execution.id.clone();
        store.executions.insert(key, execution);
        Ok(id)
    }

    async fn store(&self, execution: &PipelineExecution) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        let key = (execution.execution_type, execution.id.clone());

        // An application rename must not leave a stale index entry behind.
        let previous_app = store.executions.get(&key).map(|e| e.application.clone());
        if let Some(previous_app) = previous_app {
            if previous_app != execution.application {
                let app_key = (execution.execution_type, previous_app);
                if let Some(ids) = store.by_application.get_mut(&app_key) {
                    ids.remove(&execution.id);
                    if ids.is_empty() {
                        store.by_application.remove(&app_key);
                    }
                }
            }
        }

        store.index(execution);
        store.executions.insert(key, execution.clone());
        Ok(())
    }

    async fn store_stage(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        stage: &StageExecution,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.write();
        let execution = store.get_mut(execution_type, execution_id)?;
        let slot = execution
            .stage_mut(&stage.id)
            .ok_or_else(|| RepositoryError::StageNotFound {
                execution_id: execution_id.to_string(),
                stage_id: stage.id.clone(),
            })?;
        *slot = stage.clone();
        Ok(())
    }

    async fn get(
        &self,
        execution_type: ExecutionType,
        id: &str,
    ) -> Result<PipelineExecution, RepositoryError> {
        self.store
            .read()
            .executions
            .get(&(execution_type, id.to_string()))
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(execution_type, id))
    }

    async fn get_by_client_request_id(
        &self,
        execution_type: ExecutionType,
        client_request_id: &str,
    ) -> Result<Option<PipelineExecution>, RepositoryError> {
        let store = self.store.read();
        Ok(store
            .by_client_request
            .get(&(execution_type, client_request_id.to_string()))
            .and_then(|id| store.executions.get(&(execution_type, id.clone())))
            .cloned())
    }

    async fn list(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        Ok(self.matching(criteria))
    }

    async fn list_by_this_instance(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        let unlimited = ExecutionCriteria {
            limit: None,
            ..criteria.clone()
        };
        let mut owned: Vec<PipelineExecution> = self
            .matching(&unlimited)
            .into_iter()
            .filter(|e| e.partition.as_deref() == self.partition.as_deref())
            .collect();
        if let Some(limit) = criteria.limit {
            owned.truncate(limit);
        }
        Ok(owned)
    }

    async fn summaries(
        &self,
        criteria: &ExecutionCriteria,
    ) -> Result<Vec<ExecutionSummary>, RepositoryError> {
        let mut summaries: Vec<ExecutionSummary> =
            self.matching(criteria).iter().map(PipelineExecution::summary).collect();
        sort_summaries_newest_first(&mut summaries);
        Ok(summaries)
    }

    async fn application_names(
        &self,
        execution_type: ExecutionType,
    ) -> Result<Vec<String>, RepositoryError> {
        Ok(self
            .store
            .read()
            .by_application
            .keys()
            .filter(|(t, _)| *t == execution_type)
            .map(|(_, app)| app.clone())
            .collect())
    }

    async fn scan_applications(
        &self,
        execution_type: ExecutionType,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ApplicationPage, RepositoryError> {
        let store = self.store.read();
        let mut entries: Vec<(String, usize)> = store
            .by_application
            .iter()
            .filter(|((t, app), _)| {
                *t == execution_type && cursor.map_or(true, |c| app.as_str() > c)
            })
            .take(limit.saturating_add(1))
            .map(|((_, app), ids)| (app.clone(), ids.len()))
            .collect();

        let next_cursor = if entries.len() > limit {
            entries.truncate(limit);
            entries.last().map(|(app, _)| app.clone())
        } else {
            None
        };
        Ok(ApplicationPage {
            entries,
            next_cursor,
        })
    }

    async fn delete(&self, execution_type: ExecutionType, id: &str) -> Result<(), RepositoryError> {
        self.store.write().remove(execution_type, id);
        Ok(())
    }

    async fn delete_all(
        &self,
        execution_type: ExecutionType,
        ids: &[String],
    ) -> Result<usize, RepositoryError> {
        let mut store = self.store.write();
        Ok(ids
            .iter()
            .filter(|id| store.remove(execution_type, id))
            .count())
    }

    async fn update_status(
        &self,
        execution_type: ExecutionType,
        id: &str,
        status: ExecutionStatus,
    ) -> Result<(), RepositoryError> {
        let now = self.clock.now();
        let mut store = self.store.write();
        let execution = store.get_mut(execution_type, id)?;

        if status == ExecutionStatus::Running {
            if execution.status.is_complete() {
                execution.end_time = None;
                execution.canceled = false;
                execution.canceled_by = None;
                execution.cancellation_reason = None;
            }
            if execution.start_time.is_none() {
                execution.start_time = Some(now);
            }
        } else if status.is_complete() {
            execution.end_time = Some(now);
        }
        execution.status = status;
        Ok(())
    }

    async fn cancel(
        &self,
        execution_type: ExecutionType,
        id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let now = self.clock.now();
        let mut store = self.store.write();
        let execution = store.get_mut(execution_type, id)?;

        execution.canceled = true;
        if let Some(user) = user {
            execution.canceled_by = Some(user.to_string());
        }
        if let Some(reason) = reason {
            execution.cancellation_reason = Some(reason.to_string());
        }
        if execution.status == ExecutionStatus::NotStarted {
            execution.status = ExecutionStatus::Canceled;
            execution.end_time = Some(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn execution(id: &str, app: &str) -> PipelineExecution {
        let mut execution = PipelineExecution::new(id, ExecutionType::Pipeline, app);
        execution
            .stages
            .push(StageExecution::new("s1", "1", "wait", "Wait"));
        execution
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = InMemoryExecutionRepository::new().with_partition("east");
        let id = repo.create(execution("e1", "app")).await.unwrap();

        let stored = repo.get(ExecutionType::Pipeline, &id).await.unwrap();
        assert_eq!(stored.partition.as_deref(), Some("east"));
        assert!(stored.build_time.is_some());

        let err = repo
            .get(ExecutionType::Orchestration, &id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_is_idempotent_by_client_request_id() {
        let repo = InMemoryExecutionRepository::new();
        let mut first = execution("e1", "app");
        first.client_request_id = Some("req-1".to_string());
        let mut second = execution("e2", "app");
        second.client_request_id = Some("req-1".to_string());

        assert_eq!(repo.create(first).await.unwrap(), "e1");
        assert_eq!(repo.create(second).await.unwrap(), "e1");
        assert_eq!(repo.len(), 1);

        let found = repo
            .get_by_client_request_id(ExecutionType::Pipeline, "req-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "e1");
    }

    #[tokio::test]
    async fn test_create_duplicate_id() {
        let repo = InMemoryExecutionRepository::new();
        repo.create(execution("e1", "app")).await.unwrap();
        let err = repo.create(execution("e1", "app")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_store_stage_replaces_only_that_stage() {
        let repo = InMemoryExecutionRepository::new();
        let mut exec = execution("e1", "app");
        exec.stages
            .push(StageExecution::new("s2", "2", "wait", "Other"));
        repo.create(exec).await.unwrap();

        let mut stage = StageExecution::new("s1", "1", "wait", "Wait");
        stage.status = ExecutionStatus::Running;
        repo.store_stage(ExecutionType::Pipeline, "e1", &stage)
            .await
            .unwrap();

        let stored = repo.get(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.stage("s1").unwrap().status, ExecutionStatus::Running);
        assert_eq!(
            stored.stage("s2").unwrap().status,
            ExecutionStatus::NotStarted
        );

        let missing = StageExecution::new("nope", "9", "wait", "Nope");
        let err = repo
            .store_stage(ExecutionType::Pipeline, "e1", &missing)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::StageNotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filters() {
        let repo = InMemoryExecutionRepository::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..4 {
            let mut e = execution(&format!("e{i}"), if i % 2 == 0 { "even" } else { "odd" });
            e.start_time = Some(base + Duration::hours(i));
            e.status = if i == 3 {
                ExecutionStatus::Running
            } else {
                ExecutionStatus::Succeeded
            };
            repo.create(e).await.unwrap();
        }

        let all = repo
            .list(&ExecutionCriteria::new(ExecutionType::Pipeline))
            .await
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e3", "e2", "e1", "e0"]);

        let odd_complete = repo
            .list(
                &ExecutionCriteria::new(ExecutionType::Pipeline)
                    .with_application("odd")
                    .complete(),
            )
            .await
            .unwrap();
        assert_eq!(odd_complete.len(), 1);
        assert_eq!(odd_complete[0].id, "e1");

        let limited = repo
            .summaries(&ExecutionCriteria::new(ExecutionType::Pipeline).with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, "e3");
    }

    #[tokio::test]
    async fn test_list_by_this_instance() {
        let repo = InMemoryExecutionRepository::new().with_partition("east");
        repo.create(execution("mine", "app")).await.unwrap();
        let mut foreign = execution("theirs", "app");
        foreign.partition = Some("west".to_string());
        repo.create(foreign).await.unwrap();

        let owned = repo
            .list_by_this_instance(&ExecutionCriteria::new(ExecutionType::Pipeline))
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, "mine");
    }

    #[tokio::test]
    async fn test_scan_applications_pages() {
        let repo = InMemoryExecutionRepository::new();
        for (i, app) in ["a", "b", "b", "c", "d"].iter().enumerate() {
            repo.create(execution(&format!("e{i}"), app)).await.unwrap();
        }

        let first = repo
            .scan_applications(ExecutionType::Pipeline, None, 2)
            .await
            .unwrap();
        assert_eq!(
            first.entries,
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
        assert_eq!(first.next_cursor.as_deref(), Some("b"));

        let second = repo
            .scan_applications(ExecutionType::Pipeline, first.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(
            second.entries,
            vec![("c".to_string(), 1), ("d".to_string(), 1)]
        );
        assert_eq!(second.next_cursor, None);

        let names = repo
            .application_names(ExecutionType::Pipeline)
            .await
            .unwrap();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_delete_updates_indexes() {
        let repo = InMemoryExecutionRepository::new();
        let mut e = execution("e1", "app");
        e.client_request_id = Some("req".to_string());
        repo.create(e).await.unwrap();
        repo.create(execution("e2", "app")).await.unwrap();

        let deleted = repo
            .delete_all(
                ExecutionType::Pipeline,
                &["e1".to_string(), "missing".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(repo
            .get_by_client_request_id(ExecutionType::Pipeline, "req")
            .await
            .unwrap()
            .is_none());

        repo.delete(ExecutionType::Pipeline, "e2").await.unwrap();
        repo.delete(ExecutionType::Pipeline, "e2").await.unwrap();
        assert!(repo
            .application_names(ExecutionType::Pipeline)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_status_stamps_times() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let repo = InMemoryExecutionRepository::new().with_clock(clock.clone());
        repo.create(execution("e1", "app")).await.unwrap();

        repo.update_status(ExecutionType::Pipeline, "e1", ExecutionStatus::Running)
            .await
            .unwrap();
        clock.advance(Duration::minutes(5));
        repo.update_status(ExecutionType::Pipeline, "e1", ExecutionStatus::Succeeded)
            .await
            .unwrap();

        let stored = repo.get(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(stored.start_time, Some(start));
        assert_eq!(stored.end_time, Some(start + Duration::minutes(5)));

        repo.update_status(ExecutionType::Pipeline, "e1", ExecutionStatus::Running)
            .await
            .unwrap();
        let resumed = repo.get(ExecutionType::Pipeline, "e1").await.unwrap();
        assert_eq!(resumed.end_time, None);
        assert_eq!(resumed.start_time, Some(start));
    }

    #[tokio::test]
    async fn test_cancel_not_started_execution() {
        let repo = InMemoryExecutionRepository::new();
        repo.create(execution("e1", "app")).await.unwrap();

        repo.cancel(
            ExecutionType::Pipeline,
            "e1",
            Some("alice"),
            Some("no longer needed"),
        )
        .await
        .unwrap();

        let stored = repo.get(ExecutionType::Pipeline, "e1").await.unwrap();
        assert!(stored.canceled);
        assert_eq!(stored.status, ExecutionStatus::Canceled);
        assert_eq!(stored.canceled_by.as_deref(), Some("alice"));
        assert_eq!(
            stored.cancellation_reason.as_deref(),
            Some("no longer needed")
        );
    }
}
