//! Domain model: executions, stages, tasks and the stage context.
//!
//! A [`PipelineExecution`] owns its [`StageExecution`]s by value, and each
//! stage owns its [`TaskExecution`]s. Graph queries resolve stages through
//! their reference ids rather than through back-pointers.

mod builder;
mod context;
mod execution;
mod stage;
mod task;

pub use builder::{ExecutionBuilder, StageDefinition, TaskDefinition};
pub(crate) use builder::tasks_from_definitions;
pub use context::{keys, ChildExecutionLink, CloudProvider, RestartDetails, StageContext};
pub use execution::{ExecutionSummary, PipelineExecution};
pub use stage::StageExecution;
pub use task::TaskExecution;
