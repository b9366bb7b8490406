//! Built-in exception handlers.

use super::chain::ExceptionHandler;
use super::failure::{RemoteCallError, RemoteErrorKind, TaskFailure};
use super::response::ExceptionResponse;
use serde_json::{json, Value};

/// Classifies failed remote calls by status code.
///
/// 5xx and connection failures are retryable when the request was
/// idempotent. A non-idempotent request is only retried on 503, where the
/// remote signals that it did not process the request. Everything else is
/// terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteCallExceptionHandler;

impl RemoteCallExceptionHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decides whether a remote failure may be retried.
    #[must_use]
    pub fn is_retryable(error: &RemoteCallError) -> bool {
        match error.kind {
            RemoteErrorKind::Http { status: 503 } => true,
            RemoteErrorKind::Http { status } if (500..600).contains(&status) => error.idempotent,
            RemoteErrorKind::Network => error.idempotent,
            RemoteErrorKind::Http { .. } | RemoteErrorKind::Unexpected => false,
        }
    }

    fn body_field<'a>(body: Option<&'a Value>, field: &str) -> Option<&'a Value> {
        body.and_then(|b| b.get(field)).filter(|v| !v.is_null())
    }
}

impl ExceptionHandler for RemoteCallExceptionHandler {
    fn name(&self) -> &str {
        "remote-call"
    }

    fn handles(&self, failure: &TaskFailure) -> bool {
        matches!(failure, TaskFailure::Remote(_))
    }

    fn handle(&self, operation: &str, failure: &TaskFailure) -> ExceptionResponse {
        let TaskFailure::Remote(error) = failure else {
            return DefaultExceptionHandler.handle(operation, failure);
        };
        let body = error.body.as_ref();

        let message = Self::body_field(body, "error")
            .and_then(Value::as_str)
            .unwrap_or(&error.message)
            .to_string();
        let errors = Self::body_field(body, "errors")
            .or_else(|| Self::body_field(body, "messages"))
            .cloned()
            .unwrap_or_else(|| json!([error.message]));

        let mut response = ExceptionResponse::new(failure.kind(), operation, Self::is_retryable(error))
            .with_detail("kind", error.kind.to_string())
            .with_detail("error", message)
            .with_detail("errors", errors);

        if let Some(status) = error.status() {
            response = response.with_detail("status", status);
        }
        if let Some(url) = &error.url {
            response = response.with_detail("url", url.clone());
        }
        if let Some(root) = Self::body_field(body, "exception") {
            response = response.with_detail("rootException", root.clone());
        }
        if let Some(body) = body {
            response = response.with_detail("responseBody", body.to_string());
        }
        response
    }
}

/// Catch-all handler: every failure it sees is terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionHandler;

impl DefaultExceptionHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ExceptionHandler for DefaultExceptionHandler {
    fn name(&self) -> &str {
        "default"
    }

    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn handles(&self, _failure: &TaskFailure) -> bool {
        true
    }

    fn handle(&self, operation: &str, failure: &TaskFailure) -> ExceptionResponse {
        let message = failure.to_string();
        let response = ExceptionResponse::new(failure.kind(), operation, false);

        match failure {
            TaskFailure::Other(err) => response
                .with_detail("error", "Unexpected Task Failure")
                .with_detail("errors", json!([message]))
                .with_detail("stackTrace", format!("{err:?}")),
            _ => response
                .with_detail("error", message.clone())
                .with_detail("errors", json!([message])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn classify(error: RemoteCallError) -> ExceptionResponse {
        RemoteCallExceptionHandler.handle("createServerGroup", &TaskFailure::Remote(error))
    }

    #[test]
    fn test_server_errors_are_retryable() {
        for status in [500, 502, 503, 504] {
            let response = classify(RemoteCallError::http(status, "server error"));
            assert!(response.should_retry, "{status} should be retryable");
            assert_eq!(response.details["status"], json!(status));
        }
    }

    #[test]
    fn test_client_errors_are_terminal() {
        for status in [400, 401, 404, 422, 429] {
            let response = classify(RemoteCallError::http(status, "client error"));
            assert!(!response.should_retry, "{status} should be terminal");
        }
    }

    #[test]
    fn test_non_idempotent_requests_only_retry_on_unavailable() {
        assert!(!classify(RemoteCallError::http(500, "boom").non_idempotent()).should_retry);
        assert!(!classify(RemoteCallError::network("reset").non_idempotent()).should_retry);
        assert!(classify(RemoteCallError::http(503, "busy").non_idempotent()).should_retry);
    }

    #[test]
    fn test_network_errors_are_retryable() {
        let response = classify(RemoteCallError::network("connection refused").with_url("http://oort"));
        assert!(response.should_retry);
        assert_eq!(response.details["kind"], json!("NETWORK"));
        assert_eq!(response.details["url"], json!("http://oort"));
    }

    #[test]
    fn test_details_mirror_response_body() {
        let body = json!({
            "error": "Bad Request",
            "messages": ["name is required"],
            "exception": "ValidationException"
        });
        let response = classify(RemoteCallError::http(400, "Bad Request").with_body(body));

        assert_eq!(response.error(), Some("Bad Request"));
        assert_eq!(response.errors(), vec!["name is required"]);
        assert_eq!(response.details["rootException"], json!("ValidationException"));
        assert!(response.details.contains_key("responseBody"));
    }

    #[test]
    fn test_default_handler_preserves_raw_message() {
        let failure = TaskFailure::Other(anyhow::anyhow!("disk on fire"));
        let response = DefaultExceptionHandler.handle("bake", &failure);

        assert!(!response.should_retry);
        assert_eq!(response.exception_type, "UnexpectedError");
        assert_eq!(response.error(), Some("Unexpected Task Failure"));
        assert_eq!(response.errors(), vec!["disk on fire"]);
        assert!(response.details.contains_key("stackTrace"));
    }
}
