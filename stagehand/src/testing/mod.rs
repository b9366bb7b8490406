//! Testing utilities for stagehand executions.
//!
//! This module provides:
//! - Execution fixtures
//! - Mock tasks, external operations and a fault-injecting repository
//! - Assertions on execution, stage and task status
//! - An engine harness wired to in-memory collaborators

mod assertions;
pub mod fixtures;
mod harness;
mod mocks;

pub use assertions::{
    assert_execution_status, assert_stage_status, assert_task_statuses, stage_by_ref,
};
pub use harness::TestHarness;
pub use mocks::{FailingTask, FaultyRepository, PanickingTask, ScriptedOperation, ScriptedTask};
