//! Classified failure records.

use crate::utils::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The outcome of classifying a task failure.
///
/// Serialized onto the stage context under `exception`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionResponse {
    /// The failure kind.
    pub exception_type: String,
    /// The task (operation) that failed.
    pub operation: String,
    /// Structured detail map.
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
    /// Whether the runner may retry.
    pub should_retry: bool,
    /// When the failure was classified.
    pub timestamp: Timestamp,
}

impl ExceptionResponse {
    /// Creates a response with an empty detail map.
    #[must_use]
    pub fn new(
        exception_type: impl Into<String>,
        operation: impl Into<String>,
        should_retry: bool,
    ) -> Self {
        Self {
            exception_type: exception_type.into(),
            operation: operation.into(),
            details: BTreeMap::new(),
            should_retry,
            timestamp: Utc::now(),
        }
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Overrides the retry decision.
    #[must_use]
    pub fn with_should_retry(mut self, should_retry: bool) -> Self {
        self.should_retry = should_retry;
        self
    }

    /// The primary error message, if recorded.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.details.get("error").and_then(Value::as_str)
    }

    /// The list of error messages, if recorded.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.details
            .get("errors")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert(
            "exceptionType".to_string(),
            Value::String(self.exception_type.clone()),
        );
        map.insert("operation".to_string(), Value::String(self.operation.clone()));
        map.insert(
            "details".to_string(),
            Value::Object(self.details.clone().into_iter().collect()),
        );
        map.insert("shouldRetry".to_string(), Value::Bool(self.should_retry));
        map.insert(
            "timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serializes_camel_case() {
        let response = ExceptionResponse::new("RemoteCallError", "createServerGroup", true)
            .with_detail("error", "Service Unavailable");
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["exceptionType"], json!("RemoteCallError"));
        assert_eq!(value["shouldRetry"], json!(true));
        assert_eq!(value["details"]["error"], json!("Service Unavailable"));
    }

    #[test]
    fn test_errors_accessor() {
        let response = ExceptionResponse::new("UnexpectedError", "wait", false)
            .with_detail("errors", json!(["one", "two"]));
        assert_eq!(response.errors(), vec!["one", "two"]);
        assert!(response.error().is_none());
    }

    #[test]
    fn test_to_dict() {
        let dict = ExceptionResponse::new("TimeoutError", "wait", false).to_dict();
        assert_eq!(dict.get("operation"), Some(&json!("wait")));
        assert_eq!(dict.get("shouldRetry"), Some(&json!(false)));
    }
}
