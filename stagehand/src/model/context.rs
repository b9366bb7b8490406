//! The stage context: the only place cross-task state crosses a boundary.
//!
//! Values are kept in an ordered map so serialized contexts are stable.
//! Tasks read well-known entries through the typed accessors below, or
//! decode the whole map into their own struct with [`StageContext::decode`].

use crate::core::ExecutionType;
use crate::exceptions::ExceptionResponse;
use crate::utils::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Well-known context keys.
pub mod keys {
    /// The most recent classified failure.
    pub const EXCEPTION: &str = "exception";
    /// Details of the last restart.
    pub const RESTART_DETAILS: &str = "restartDetails";
    /// Link to a nested child execution started by this stage.
    pub const CHILD_EXECUTION: &str = "childExecution";
    /// The cloud provider the stage operates against.
    pub const CLOUD_PROVIDER: &str = "cloudProvider";
    /// Fail with `FAILED_CONTINUE` instead of halting.
    pub const CONTINUE_PIPELINE: &str = "continuePipeline";
    /// When false, a failure stops the branch without failing the execution.
    pub const FAIL_PIPELINE: &str = "failPipeline";
    /// Treat a poll timeout as success.
    pub const MARK_SUCCESSFUL_ON_TIMEOUT: &str = "markSuccessfulOnTimeout";
    /// Set by tasks to request a custom stage timeout; never merged.
    pub const STAGE_TIMEOUT_MS: &str = "stageTimeoutMs";
}

/// Known cloud providers.
///
/// Used to look up provider-scoped dynamic settings such as backoff
/// overrides. Unknown provider names decode to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Amazon Web Services.
    Aws,
    /// Google Cloud Platform.
    Gcp,
    /// Microsoft Azure.
    Azure,
    /// Kubernetes.
    Kubernetes,
    /// Cloud Foundry.
    Cloudfoundry,
    /// Titus.
    Titus,
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
            Self::Kubernetes => "kubernetes",
            Self::Cloudfoundry => "cloudfoundry",
            Self::Titus => "titus",
        };
        write!(f, "{name}")
    }
}

/// Link from a stage to the child execution it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildExecutionLink {
    /// The child execution id.
    pub execution_id: String,
    /// The child execution type.
    pub execution_type: ExecutionType,
    /// The child's application.
    pub application: String,
}

/// Recorded on a stage each time it is restarted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartDetails {
    /// Who restarted the stage.
    pub restarted_by: String,
    /// When the restart happened.
    pub restart_time: Timestamp,
    /// The failure that was cleared by the restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_exception: Option<Value>,
}

/// An ordered key/value map scoped to one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageContext {
    values: BTreeMap<String, Value>,
}

impl From<BTreeMap<String, Value>> for StageContext {
    fn from(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }
}

impl StageContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw value for a key.
    #[must_use]
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns a typed value for a key, or `None` if absent or mistyped.
    #[must_use]
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Stores a raw value.
    pub fn insert_value(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Stores a typed value.
    pub fn insert<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.into(), value);
        Ok(())
    }

    /// Removes a key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Merges entries into the context, overwriting existing keys.
    pub fn merge(&mut self, entries: &BTreeMap<String, Value>) {
        for (key, value) in entries {
            if key == keys::STAGE_TIMEOUT_MS {
                continue;
            }
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Decodes the whole context into a task-specific struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let map: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::from_value(Value::Object(map))
    }

    /// Returns the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the context is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    // Typed accessors for well-known keys.

    /// The most recent classified failure.
    #[must_use]
    pub fn exception(&self) -> Option<ExceptionResponse> {
        self.get(keys::EXCEPTION)
    }

    /// Records a classified failure.
    pub fn set_exception(&mut self, response: &ExceptionResponse) -> Result<(), serde_json::Error> {
        self.insert(keys::EXCEPTION, response)
    }

    /// Details of the last restart.
    #[must_use]
    pub fn restart_details(&self) -> Option<RestartDetails> {
        self.get(keys::RESTART_DETAILS)
    }

    /// The child execution started by this stage.
    #[must_use]
    pub fn child_execution(&self) -> Option<ChildExecutionLink> {
        self.get(keys::CHILD_EXECUTION)
    }

    /// The provider the stage targets.
    #[must_use]
    pub fn cloud_provider(&self) -> Option<CloudProvider> {
        self.get(keys::CLOUD_PROVIDER)
    }

    /// Whether a failure should let the pipeline continue.
    #[must_use]
    pub fn continue_pipeline(&self) -> bool {
        self.get(keys::CONTINUE_PIPELINE).unwrap_or(false)
    }

    /// Whether a failure should fail the whole execution. Defaults to true.
    #[must_use]
    pub fn fail_pipeline(&self) -> bool {
        self.get(keys::FAIL_PIPELINE).unwrap_or(true)
    }

    /// Whether a poll timeout counts as success.
    #[must_use]
    pub fn mark_successful_on_timeout(&self) -> bool {
        self.get(keys::MARK_SUCCESSFUL_ON_TIMEOUT).unwrap_or(false)
    }
}
