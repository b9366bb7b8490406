//! Pipeline executions and their stage graph queries.

use super::stage::StageExecution;
use crate::core::{ExecutionStatus, ExecutionType};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// One run of a pipeline or orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    /// Execution id.
    pub id: String,
    /// Pipeline or orchestration.
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,
    /// Owning application.
    pub application: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// The pipeline configuration this run belongs to.
    #[serde(default)]
    pub pipeline_config_id: Option<String>,
    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,
    /// Stages, owned by value.
    #[serde(default)]
    pub stages: Vec<StageExecution>,
    /// When the execution was created.
    #[serde(default)]
    pub build_time: Option<Timestamp>,
    /// When the execution started running.
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    /// When the execution completed.
    #[serde(default)]
    pub end_time: Option<Timestamp>,
    /// The worker partition that owns this execution.
    #[serde(default)]
    pub partition: Option<String>,
    /// Whether cancellation was requested.
    #[serde(default)]
    pub canceled: bool,
    /// Who requested cancellation.
    #[serde(default)]
    pub canceled_by: Option<String>,
    /// Why cancellation was requested.
    #[serde(default)]
    pub cancellation_reason: Option<String>,
    /// Caller-supplied id used to make creation idempotent.
    #[serde(default)]
    pub client_request_id: Option<String>,
    /// Execution-level outputs.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

impl PipelineExecution {
    /// Creates an empty, not-started execution.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        execution_type: ExecutionType,
        application: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            execution_type,
            application: application.into(),
            name: None,
            pipeline_config_id: None,
            status: ExecutionStatus::NotStarted,
            stages: Vec::new(),
            build_time: None,
            start_time: None,
            end_time: None,
            partition: None,
            canceled: false,
            canceled_by: None,
            cancellation_reason: None,
            client_request_id: None,
            outputs: BTreeMap::new(),
        }
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn stage(&self, stage_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Looks up a stage by id, mutably.
    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    /// Looks up a stage by reference id.
    #[must_use]
    pub fn stage_by_ref(&self, ref_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.ref_id == ref_id)
    }

    /// Stages with no upstream dependencies.
    #[must_use]
    pub fn initial_stages(&self) -> Vec<&StageExecution> {
        self.stages.iter().filter(|s| s.is_initial()).collect()
    }

    /// Direct upstream stages of `stage`.
    #[must_use]
    pub fn upstream_stages(&self, stage: &StageExecution) -> Vec<&StageExecution> {
        stage
            .requisite_stage_ref_ids
            .iter()
            .filter_map(|r| self.stage_by_ref(r))
            .collect()
    }

    /// Direct downstream stages of `stage`.
    #[must_use]
    pub fn downstream_stages(&self, stage: &StageExecution) -> Vec<&StageExecution> {
        self.stages
            .iter()
            .filter(|s| s.requisite_stage_ref_ids.contains(&stage.ref_id))
            .collect()
    }

    /// Ids of every stage transitively downstream of `stage_id`.
    #[must_use]
    pub fn all_downstream_stage_ids(&self, stage_id: &str) -> Vec<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier: Vec<&StageExecution> = self.stage(stage_id).into_iter().collect();
        let mut ordered = Vec::new();

        while let Some(current) = frontier.pop() {
            for next in self.downstream_stages(current) {
                if seen.insert(next.id.clone()) {
                    ordered.push(next.id.clone());
                    frontier.push(next);
                }
            }
        }
        ordered
    }

    /// Returns true if every upstream stage completed successfully.
    #[must_use]
    pub fn upstream_succeeded(&self, stage: &StageExecution) -> bool {
        self.upstream_stages(stage)
            .iter()
            .all(|s| s.status.is_successful())
    }

    /// Returns true if a not-started stage is ready to start.
    #[must_use]
    pub fn is_startable(&self, stage: &StageExecution) -> bool {
        stage.status == ExecutionStatus::NotStarted && self.upstream_succeeded(stage)
    }

    /// Returns a lightweight summary of this execution.
    #[must_use]
    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            execution_type: self.execution_type,
            application: self.application.clone(),
            pipeline_config_id: self.pipeline_config_id.clone(),
            status: self.status,
            build_time: self.build_time,
            start_time: self.start_time,
        }
    }
}

/// A lightweight view of an execution, used by retention scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    /// Execution id.
    pub id: String,
    /// Pipeline or orchestration.
    pub execution_type: ExecutionType,
    /// Owning application.
    pub application: String,
    /// The pipeline configuration this run belongs to.
    pub pipeline_config_id: Option<String>,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the execution was created.
    pub build_time: Option<Timestamp>,
    /// When the execution started running.
    pub start_time: Option<Timestamp>,
}

impl ExecutionSummary {
    /// The time retention ordering uses: start time, falling back to build time.
    #[must_use]
    pub fn sort_time(&self) -> Option<Timestamp> {
        self.start_time.or(self.build_time)
    }
}
