//! Registry resolving implementing-task identifiers to task instances.

use super::task::Task;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Registry of task implementations.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<dyn Task>>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.tasks.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("TaskRegistry").field("tasks", &names).finish()
    }
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task under its own name, replacing any previous one.
    pub fn register(&self, task: Arc<dyn Task>) {
        let name = task.name().to_string();
        self.tasks.write().insert(name, task);
    }

    /// Registers a task under an additional alias.
    pub fn register_alias(&self, alias: impl Into<String>, task: Arc<dyn Task>) {
        self.tasks.write().insert(alias.into(), task);
    }

    /// Registers a task, builder style.
    #[must_use]
    pub fn with_task(self, task: Arc<dyn Task>) -> Self {
        self.register(task);
        self
    }

    /// Resolves an implementing-task identifier.
    #[must_use]
    pub fn resolve(&self, implementing_task: &str) -> Option<Arc<dyn Task>> {
        self.tasks.read().get(implementing_task).cloned()
    }

    /// Returns true if the identifier is registered.
    #[must_use]
    pub fn contains(&self, implementing_task: &str) -> bool {
        self.tasks.read().contains_key(implementing_task)
    }

    /// Returns the number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::TaskFailure;
    use crate::model::StageExecution;
    use crate::tasks::TaskResult;
    use async_trait::async_trait;

    struct NamedTask(&'static str);

    #[async_trait]
    impl Task for NamedTask {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _stage: &StageExecution) -> Result<TaskResult, TaskFailure> {
            Ok(TaskResult::succeeded())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = TaskRegistry::new().with_task(Arc::new(NamedTask("wait")));
        registry.register_alias("legacyWait", Arc::new(NamedTask("wait")));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("wait").map(|t| t.name().to_string()).as_deref(), Some("wait"));
        assert!(registry.contains("legacyWait"));
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn test_debug_lists_names() {
        let registry = TaskRegistry::new()
            .with_task(Arc::new(NamedTask("b")))
            .with_task(Arc::new(NamedTask("a")));
        assert_eq!(format!("{registry:?}"), r#"TaskRegistry { tasks: ["a", "b"] }"#);
    }
}
