//! Task failure taxonomy.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// How a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The remote answered with an HTTP error status.
    Http {
        /// The status code.
        status: u16,
    },
    /// The connection failed before a response arrived.
    Network,
    /// The client failed in an unexpected way (e.g. decoding the response).
    Unexpected,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { .. } => write!(f, "HTTP"),
            Self::Network => write!(f, "NETWORK"),
            Self::Unexpected => write!(f, "UNEXPECTED"),
        }
    }
}

/// A failed call to a remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCallError {
    /// How the call failed.
    pub kind: RemoteErrorKind,
    /// The requested URL, if known.
    pub url: Option<String>,
    /// Whether repeating the request is safe.
    pub idempotent: bool,
    /// Reason phrase or client error message.
    pub message: String,
    /// Decoded response body, if any.
    pub body: Option<Value>,
}

impl fmt::Display for RemoteCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.url) {
            (RemoteErrorKind::Http { status }, Some(url)) => {
                write!(f, "Status: {status}, URL: {url}, Message: {}", self.message)
            }
            (RemoteErrorKind::Http { status }, None) => {
                write!(f, "Status: {status}, Message: {}", self.message)
            }
            (kind, Some(url)) => write!(f, "{kind} error calling {url}: {}", self.message),
            (kind, None) => write!(f, "{kind} error: {}", self.message),
        }
    }
}

impl std::error::Error for RemoteCallError {}

impl RemoteCallError {
    /// An HTTP error response.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Http { status },
            url: None,
            idempotent: true,
            message: message.into(),
            body: None,
        }
    }

    /// A connection-level failure.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Network,
            url: None,
            idempotent: true,
            message: message.into(),
            body: None,
        }
    }

    /// An unexpected client-side failure.
    #[must_use]
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Unexpected,
            url: None,
            idempotent: true,
            message: message.into(),
            body: None,
        }
    }

    /// Sets the request URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the decoded response body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Marks the request as unsafe to repeat (e.g. a POST).
    #[must_use]
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// The HTTP status, if the remote answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self.kind {
            RemoteErrorKind::Http { status } => Some(status),
            _ => None,
        }
    }
}

/// Everything a task attempt can fail with.
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// A remote service call failed.
    #[error("{0}")]
    Remote(#[from] RemoteCallError),

    /// A polling task ran past its declared timeout.
    #[error("{operation} timed out after {elapsed_ms}ms (timeout {timeout_ms}ms)")]
    Timeout {
        /// The task that timed out.
        operation: String,
        /// Time since the task started.
        elapsed_ms: u64,
        /// The declared timeout.
        timeout_ms: u64,
    },

    /// An external system reported a state the task does not know.
    #[error("{operation} reported unrecognized state '{state}'")]
    UnrecognizedState {
        /// The operation being polled.
        operation: String,
        /// The unknown state.
        state: String,
    },

    /// The task itself reported a terminal result.
    #[error("{reason}")]
    Reported {
        /// Human-readable reason.
        reason: String,
    },

    /// Invalid user input; never retried.
    #[error("{0}")]
    User(String),

    /// No implementation is registered for the task type.
    #[error("No task implementation registered for '{0}'")]
    UnknownTaskType(String),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskFailure {
    /// A terminal result reported by the task.
    #[must_use]
    pub fn reported(reason: impl Into<String>) -> Self {
        Self::Reported {
            reason: reason.into(),
        }
    }

    /// The failure kind recorded as `exceptionType`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Remote(_) => "RemoteCallError",
            Self::Timeout { .. } => "TimeoutError",
            Self::UnrecognizedState { .. } => "UnrecognizedStateError",
            Self::Reported { .. } => "TaskFailure",
            Self::User(_) => "UserError",
            Self::UnknownTaskType(_) => "InvalidTaskType",
            Self::Other(_) => "UnexpectedError",
        }
    }

    /// Returns true if this failure is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = RemoteCallError::http(503, "Service Unavailable").with_url("http://clouddriver/ops");
        assert_eq!(
            err.to_string(),
            "Status: 503, URL: http://clouddriver/ops, Message: Service Unavailable"
        );
        assert_eq!(err.status(), Some(503));

        let err = RemoteCallError::network("connection reset");
        assert_eq!(err.to_string(), "NETWORK error: connection reset");
        assert_eq!(err.status(), None);
    }

    #[test]
    fn test_failure_kinds() {
        let failure: TaskFailure = anyhow::anyhow!("boom").into();
        assert_eq!(failure.kind(), "UnexpectedError");
        assert_eq!(failure.to_string(), "boom");

        let failure: TaskFailure = RemoteCallError::http(404, "Not Found").into();
        assert_eq!(failure.kind(), "RemoteCallError");
    }
}
