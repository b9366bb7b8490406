//! Task contract, poll state machine and task registry.
//!
//! A task is the smallest unit of retryable work. Synchronous tasks finish
//! in one invocation; polling tasks return `RUNNING` until an external
//! operation settles and are re-invoked after their backoff period.

mod poll;
mod registry;
mod result;
mod task;

pub use poll::{
    check_timeout, ExternalOperation, ExternalStatus, PollOutcome, PollingTask, StateMapping,
};
pub use registry::TaskRegistry;
pub use result::TaskResult;
pub use task::{PollingPolicy, Task};
