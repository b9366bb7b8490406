//! Retry/exception classification.
//!
//! Every task failure is turned into an [`ExceptionResponse`] by an
//! [`ExceptionChain`]. The response decides whether the runner retries the
//! task and is recorded on the stage context for operators to inspect.

mod backoff;
mod chain;
mod failure;
mod handlers;
mod response;

pub use backoff::{BackoffStrategy, JitterStrategy, RetryConfig};
pub use chain::{ExceptionChain, ExceptionHandler};
pub use failure::{RemoteCallError, RemoteErrorKind, TaskFailure};
pub use handlers::{DefaultExceptionHandler, RemoteCallExceptionHandler};
pub use response::ExceptionResponse;
