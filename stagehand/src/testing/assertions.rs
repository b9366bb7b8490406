//! Test assertions for executions.

use crate::core::ExecutionStatus;
use crate::model::{PipelineExecution, StageExecution};

/// Asserts the execution status.
pub fn assert_execution_status(execution: &PipelineExecution, expected: ExecutionStatus) {
    assert_eq!(
        execution.status, expected,
        "Expected execution {} to be {}, got {}",
        execution.id, expected, execution.status
    );
}

/// Looks up a stage by reference id, failing the test if it is missing.
#[must_use]
pub fn stage_by_ref<'a>(execution: &'a PipelineExecution, ref_id: &str) -> &'a StageExecution {
    execution.stage_by_ref(ref_id).unwrap_or_else(|| {
        panic!(
            "Expected stage {ref_id} in execution {}, stages: {:?}",
            execution.id,
            execution.stages.iter().map(|s| &s.ref_id).collect::<Vec<_>>()
        )
    })
}

/// Asserts the status of the stage with the given reference id.
pub fn assert_stage_status(execution: &PipelineExecution, ref_id: &str, expected: ExecutionStatus) {
    let stage = stage_by_ref(execution, ref_id);
    assert_eq!(
        stage.status, expected,
        "Expected stage {ref_id} to be {expected}, got {}",
        stage.status
    );
}

/// Asserts the status of every task in a stage, in order.
pub fn assert_task_statuses(
    execution: &PipelineExecution,
    ref_id: &str,
    expected: &[ExecutionStatus],
) {
    let actual: Vec<ExecutionStatus> = stage_by_ref(execution, ref_id)
        .tasks
        .iter()
        .map(|t| t.status)
        .collect();
    assert_eq!(
        actual, expected,
        "Unexpected task statuses in stage {ref_id}"
    );
}
