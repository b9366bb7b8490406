//! # Stagehand
//!
//! A queue-driven execution engine for continuous-delivery pipelines.
//!
//! Executions are graphs of stages; each stage runs an ordered list of
//! tasks. Progress is made one queue message at a time:
//!
//! - **Dispatch**: idempotent handlers advance executions from messages
//! - **Task runner**: runs tasks, polls long-running ones, retries failures
//! - **Exception classification**: decides retryable versus terminal errors
//! - **Repository**: execution storage with an optional dual read path
//! - **Operator**: restart and cancel running executions
//! - **Cleanup**: scheduled retention agents under cluster leases
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagehand::prelude::*;
//!
//! let execution = ExecutionBuilder::pipeline("deploy-app")
//!     .stage(StageDefinition::new("1", "bake").task("bake", "bakeImage"))
//!     .build()?;
//!
//! repository.create(execution.clone()).await?;
//! queue.push(Message::start_execution(&execution), Duration::ZERO).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cleanup;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod errors;
pub mod exceptions;
pub mod lock;
pub mod model;
pub mod observability;
pub mod operator;
pub mod queue;
pub mod repository;
pub mod tasks;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cleanup::{
        AgentScheduler, CleanupAgent, CleanupReport, OldPipelineCleanupAgent,
        TopApplicationExecutionCleanupAgent,
    };
    pub use crate::config::{CleanupConfig, DynamicConfig, EngineConfig, RunnerConfig};
    pub use crate::core::{ExecutionStatus, ExecutionType};
    pub use crate::dispatch::{Dispatcher, QueueProcessor};
    pub use crate::errors::{
        EngineError, LockError, OperatorError, QueueError, RepositoryError,
    };
    pub use crate::exceptions::{
        ExceptionChain, ExceptionHandler, ExceptionResponse, RemoteCallError, RetryConfig,
        TaskFailure,
    };
    pub use crate::lock::{InMemoryLockManager, LockManager};
    pub use crate::model::{
        ExecutionBuilder, PipelineExecution, StageContext, StageDefinition, StageExecution,
        TaskDefinition, TaskExecution,
    };
    pub use crate::observability::{init_tracing, MetricsSink};
    pub use crate::operator::{CompoundExecutionOperator, RestartRequest};
    pub use crate::queue::{InMemoryQueue, Message, Queue};
    pub use crate::repository::{
        DualExecutionRepository, ExecutionCriteria, ExecutionRepository,
        InMemoryExecutionRepository,
    };
    pub use crate::tasks::{PollingPolicy, PollingTask, Task, TaskRegistry, TaskResult};
    pub use crate::utils::{Clock, SystemClock, Timestamp};
}
