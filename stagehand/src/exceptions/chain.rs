//! Priority-ordered exception handler chain.

use super::failure::TaskFailure;
use super::handlers::{DefaultExceptionHandler, RemoteCallExceptionHandler};
use super::response::ExceptionResponse;
use serde_json::json;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

/// Trait for failure classifiers.
pub trait ExceptionHandler: Send + Sync + Debug {
    /// A short name for logs.
    fn name(&self) -> &str;

    /// Returns the handler's priority (lower = consulted earlier).
    fn priority(&self) -> i32 {
        0
    }

    /// Returns true if this handler classifies the failure.
    fn handles(&self, failure: &TaskFailure) -> bool;

    /// Classifies the failure.
    fn handle(&self, operation: &str, failure: &TaskFailure) -> ExceptionResponse;
}

/// Ordered set of exception handlers; the first that handles a failure wins.
#[derive(Debug, Clone)]
pub struct ExceptionChain {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl Default for ExceptionChain {
    fn default() -> Self {
        Self::empty()
            .with_handler(Arc::new(RemoteCallExceptionHandler::new()))
            .with_handler(Arc::new(DefaultExceptionHandler::new()))
    }
}

impl ExceptionChain {
    /// Creates a chain with the built-in handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a chain with no handlers.
    ///
    /// Failures nobody handles are still classified as terminal.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Adds a handler to the chain.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.handlers.push(handler);
        self.handlers.sort_by_key(|h| h.priority());
        self
    }

    /// Returns the number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if the chain has no handlers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Classifies a failure. Never panics.
    ///
    /// A handler that panics is skipped in favor of a terminal response
    /// carrying the raw failure message.
    pub fn classify(&self, operation: &str, failure: &TaskFailure) -> ExceptionResponse {
        for handler in &self.handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if handler.handles(failure) {
                    Some(handler.handle(operation, failure))
                } else {
                    None
                }
            }));

            match outcome {
                Ok(Some(response)) => {
                    if response.should_retry {
                        warn!(
                            operation = %operation,
                            handler = handler.name(),
                            error = %failure,
                            "Classified failure as retryable"
                        );
                    }
                    return response;
                }
                Ok(None) => {}
                Err(_) => {
                    error!(
                        operation = %operation,
                        handler = handler.name(),
                        error = %failure,
                        "Exception handler panicked, treating failure as terminal"
                    );
                    return Self::raw_terminal(operation, failure);
                }
            }
        }
        Self::raw_terminal(operation, failure)
    }

    fn raw_terminal(operation: &str, failure: &TaskFailure) -> ExceptionResponse {
        let message = failure.to_string();
        ExceptionResponse::new(failure.kind(), operation, false)
            .with_detail("error", message.clone())
            .with_detail("errors", json!([message]))
    }
}
