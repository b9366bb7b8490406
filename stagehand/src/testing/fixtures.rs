//! Execution fixtures for tests.

use crate::core::{ExecutionStatus, ExecutionType};
use crate::model::{PipelineExecution, StageExecution, TaskExecution};
use crate::utils::{new_execution_id, new_stage_id, Timestamp};

/// Application used by every fixture unless stated otherwise.
pub const APPLICATION: &str = "orca-test";

/// Pipeline config id used by every fixture unless stated otherwise.
pub const PIPELINE_CONFIG_ID: &str = "deploy-config";

/// Builds a not-started stage with one task per implementing-task id.
#[must_use]
pub fn stage(ref_id: &str, tasks: &[&str], after: &[&str]) -> StageExecution {
    let mut stage = StageExecution::new(new_stage_id(), ref_id, "test", format!("Stage {ref_id}"));
    stage.requisite_stage_ref_ids = after.iter().map(|r| (*r).to_string()).collect();
    stage.tasks = tasks
        .iter()
        .enumerate()
        .map(|(i, implementing)| {
            TaskExecution::new((i + 1).to_string(), format!("{implementing}{}", i + 1), *implementing)
        })
        .collect();
    stage
}

/// A not-started pipeline holding the given stages.
#[must_use]
pub fn pipeline(stages: Vec<StageExecution>) -> PipelineExecution {
    let mut execution = PipelineExecution::new(new_execution_id(), ExecutionType::Pipeline, APPLICATION);
    execution.pipeline_config_id = Some(PIPELINE_CONFIG_ID.to_string());
    execution.stages = stages;
    execution
}

/// One stage with one task.
#[must_use]
pub fn single_task(implementing_task: &str) -> PipelineExecution {
    pipeline(vec![stage("1", &[implementing_task], &[])])
}

/// One stage running the given tasks in order.
#[must_use]
pub fn sequential_tasks(implementing_tasks: &[&str]) -> PipelineExecution {
    pipeline(vec![stage("1", implementing_tasks, &[])])
}

/// Stages `1 -> 2 -> ...`, one task each.
#[must_use]
pub fn stage_chain(implementing_tasks: &[&str]) -> PipelineExecution {
    let refs: Vec<String> = (1..=implementing_tasks.len()).map(|i| i.to_string()).collect();
    let stages = implementing_tasks
        .iter()
        .enumerate()
        .map(|(i, implementing)| {
            let after: Vec<&str> = if i == 0 { Vec::new() } else { vec![refs[i - 1].as_str()] };
            stage(&refs[i], &[*implementing], &after)
        })
        .collect();
    pipeline(stages)
}

/// Diamond `1 -> (2, 3) -> 4`, one task each.
#[must_use]
pub fn diamond(implementing_task: &str) -> PipelineExecution {
    pipeline(vec![
        stage("1", &[implementing_task], &[]),
        stage("2", &[implementing_task], &["1"]),
        stage("3", &[implementing_task], &["1"]),
        stage("4", &[implementing_task], &["2", "3"]),
    ])
}

/// A settled execution started at `started`, for retention tests.
#[must_use]
pub fn completed(
    execution_type: ExecutionType,
    application: &str,
    pipeline_config_id: Option<&str>,
    started: Timestamp,
) -> PipelineExecution {
    let mut execution = PipelineExecution::new(new_execution_id(), execution_type, application);
    execution.pipeline_config_id = pipeline_config_id.map(str::to_string);
    execution.status = ExecutionStatus::Succeeded;
    execution.build_time = Some(started);
    execution.start_time = Some(started);
    execution.end_time = Some(started);
    execution
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diamond_shape() {
        let execution = diamond("noop");
        assert_eq!(execution.initial_stages().len(), 1);

        let first = execution.stage_by_ref("1").unwrap();
        assert_eq!(execution.downstream_stages(first).len(), 2);
        assert_eq!(execution.all_downstream_stage_ids(&first.id).len(), 3);
    }

    #[test]
    fn test_stage_chain_links() {
        let execution = stage_chain(&["a", "b", "c"]);
        let last = execution.stage_by_ref("3").unwrap();
        assert_eq!(last.requisite_stage_ref_ids, vec!["2"]);
        assert_eq!(last.tasks[0].implementing_task, "c");
    }
}
