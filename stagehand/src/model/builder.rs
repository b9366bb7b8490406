//! Builder for assembling executions from stage and task definitions.

use super::context::StageContext;
use super::execution::PipelineExecution;
use super::stage::StageExecution;
use super::task::TaskExecution;
use crate::core::ExecutionType;
use crate::errors::EngineError;
use crate::utils::{new_execution_id, new_stage_id, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// A task to place in a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Display name.
    pub name: String,
    /// Identifier used to resolve the implementation.
    pub implementing_task: String,
}

impl TaskDefinition {
    /// Creates a task definition.
    #[must_use]
    pub fn new(name: impl Into<String>, implementing_task: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            implementing_task: implementing_task.into(),
        }
    }
}

/// Builds task executions with ids "1", "2", ... in definition order.
pub(crate) fn tasks_from_definitions(definitions: &[TaskDefinition]) -> Vec<TaskExecution> {
    definitions
        .iter()
        .enumerate()
        .map(|(i, d)| TaskExecution::new((i + 1).to_string(), &d.name, &d.implementing_task))
        .collect()
}

/// A stage to place in an execution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageDefinition {
    /// Stable reference id.
    pub ref_id: String,
    /// Stage type.
    pub stage_type: String,
    /// Display name.
    pub name: String,
    /// Reference ids of upstream stages.
    pub requisite_stage_ref_ids: Vec<String>,
    /// Initial context.
    pub context: StageContext,
    /// Tasks in execution order.
    pub tasks: Vec<TaskDefinition>,
}

impl StageDefinition {
    /// Creates a stage definition whose name is its type.
    #[must_use]
    pub fn new(ref_id: impl Into<String>, stage_type: impl Into<String>) -> Self {
        let stage_type = stage_type.into();
        Self {
            ref_id: ref_id.into(),
            name: stage_type.clone(),
            stage_type,
            ..Self::default()
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds upstream dependencies.
    #[must_use]
    pub fn after(mut self, ref_ids: &[&str]) -> Self {
        self.requisite_stage_ref_ids
            .extend(ref_ids.iter().map(|r| (*r).to_string()));
        self
    }

    /// Sets the initial context.
    #[must_use]
    pub fn with_context(mut self, context: StageContext) -> Self {
        self.context = context;
        self
    }

    /// Appends a task.
    #[must_use]
    pub fn task(mut self, name: impl Into<String>, implementing_task: impl Into<String>) -> Self {
        self.tasks.push(TaskDefinition::new(name, implementing_task));
        self
    }
}

/// Builder for [`PipelineExecution`] values.
#[derive(Debug, Clone)]
pub struct ExecutionBuilder {
    execution_type: ExecutionType,
    application: String,
    id: Option<String>,
    name: Option<String>,
    pipeline_config_id: Option<String>,
    client_request_id: Option<String>,
    build_time: Option<Timestamp>,
    stages: Vec<StageDefinition>,
}

impl ExecutionBuilder {
    /// Starts building an execution for `application`.
    #[must_use]
    pub fn new(execution_type: ExecutionType, application: impl Into<String>) -> Self {
        Self {
            execution_type,
            application: application.into(),
            id: None,
            name: None,
            pipeline_config_id: None,
            client_request_id: None,
            build_time: None,
            stages: Vec::new(),
        }
    }

    /// Shorthand for a pipeline execution.
    #[must_use]
    pub fn pipeline(application: impl Into<String>) -> Self {
        Self::new(ExecutionType::Pipeline, application)
    }

    /// Shorthand for an orchestration.
    #[must_use]
    pub fn orchestration(application: impl Into<String>) -> Self {
        Self::new(ExecutionType::Orchestration, application)
    }

    /// Uses a fixed execution id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the pipeline configuration id.
    #[must_use]
    pub fn with_pipeline_config_id(mut self, id: impl Into<String>) -> Self {
        self.pipeline_config_id = Some(id.into());
        self
    }

    /// Sets the client request id.
    #[must_use]
    pub fn with_client_request_id(mut self, id: impl Into<String>) -> Self {
        self.client_request_id = Some(id.into());
        self
    }

    /// Sets the build time.
    #[must_use]
    pub fn with_build_time(mut self, at: Timestamp) -> Self {
        self.build_time = Some(at);
        self
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, definition: StageDefinition) -> Self {
        self.stages.push(definition);
        self
    }

    /// Builds the execution.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate or unknown reference ids, or a cycle.
    pub fn build(self) -> Result<PipelineExecution, EngineError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.ref_id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "Duplicate stage reference id '{}'",
                    stage.ref_id
                )));
            }
        }
        for stage in &self.stages {
            if let Some(unknown) = stage
                .requisite_stage_ref_ids
                .iter()
                .find(|r| !seen.contains(r.as_str()))
            {
                return Err(EngineError::Validation(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    stage.ref_id, unknown
                )));
            }
        }
        detect_cycles(&self.stages)?;

        let mut execution = PipelineExecution::new(
            self.id.unwrap_or_else(new_execution_id),
            self.execution_type,
            self.application,
        );
        execution.name = self.name;
        execution.pipeline_config_id = self.pipeline_config_id;
        execution.client_request_id = self.client_request_id;
        execution.build_time = self.build_time;
        execution.stages = self
            .stages
            .into_iter()
            .map(|d| {
                let mut stage = StageExecution::new(new_stage_id(), d.ref_id, d.stage_type, d.name);
                stage.requisite_stage_ref_ids = d.requisite_stage_ref_ids;
                stage.context = d.context;
                stage.tasks = tasks_from_definitions(&d.tasks);
                stage
            })
            .collect();
        Ok(execution)
    }
}

fn detect_cycles(stages: &[StageDefinition]) -> Result<(), EngineError> {
    let mut in_degree: HashMap<&str, usize> = stages
        .iter()
        .map(|s| (s.ref_id.as_str(), s.requisite_stage_ref_ids.len()))
        .collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(r, _)| *r)
        .collect();
    let mut visited = 0;

    while let Some(current) = queue.pop_front() {
        visited += 1;
        for stage in stages {
            if stage.requisite_stage_ref_ids.iter().any(|r| r == current) {
                if let Some(degree) = in_degree.get_mut(stage.ref_id.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(stage.ref_id.as_str());
                    }
                }
            }
        }
    }

    if visited == stages.len() {
        Ok(())
    } else {
        Err(EngineError::Validation("Stage graph contains a cycle".to_string()))
    }
}
