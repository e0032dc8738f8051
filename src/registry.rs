//! Task registration: name to handler mapping with stable dispatch slots.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::handler::WorkerHandler;

/// A registered task: its handler chain plus the dispatch slot it owns
#[derive(Debug)]
pub struct TaskDefinition {
    pub name: String,
    pub handler: WorkerHandler,
    /// Index of this task's timer slot in the dispatch loop
    pub slot: usize,
    /// Internal tasks are hidden from dashboards and summaries
    pub internal: bool,
}

/// Name to task map, built once by the engine builder and immutable afterwards.
///
/// Slots are assigned in registration order; the dispatch loop indexes its
/// timer vector by them.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    by_name: HashMap<String, Arc<TaskDefinition>>,
    ordered: Vec<Arc<TaskDefinition>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &mut self,
        name: impl Into<String>,
        handler: WorkerHandler,
        internal: bool,
    ) -> EngineResult<()> {
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(EngineError::DuplicateTask(name));
        }
        let def = Arc::new(TaskDefinition {
            name: name.clone(),
            handler,
            slot: self.ordered.len(),
            internal,
        });
        self.by_name.insert(name, Arc::clone(&def));
        self.ordered.push(def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskDefinition>> {
        self.by_name.get(name)
    }

    pub fn by_slot(&self, slot: usize) -> Option<&Arc<TaskDefinition>> {
        self.ordered.get(slot)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Tasks in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TaskDefinition>> {
        self.ordered.iter()
    }

    /// Names of dashboard-visible tasks, in registration order
    pub fn visible_task_names(&self) -> Vec<String> {
        self.ordered
            .iter()
            .filter(|def| !def.internal)
            .map(|def| def.name.clone())
            .collect()
    }

    /// Names of internal tasks, used to exclude them from dashboard queries
    pub fn internal_task_names(&self) -> Vec<String> {
        self.ordered
            .iter()
            .filter(|def| def.internal)
            .map(|def| def.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;

    fn noop_handler() -> WorkerHandler {
        WorkerHandler::new(|_ctx| async { Ok::<(), JobError>(()) })
    }

    #[test]
    fn slots_follow_registration_order() {
        let mut registry = TaskRegistry::new();
        registry.register("alpha", noop_handler(), false).unwrap();
        registry.register("beta", noop_handler(), false).unwrap();
        registry.register("sweeper", noop_handler(), true).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("alpha").unwrap().slot, 0);
        assert_eq!(registry.get("beta").unwrap().slot, 1);
        assert_eq!(registry.get("sweeper").unwrap().slot, 2);
        assert_eq!(registry.by_slot(1).unwrap().name, "beta");
        assert!(registry.by_slot(3).is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register("alpha", noop_handler(), false).unwrap();
        let err = registry.register("alpha", noop_handler(), false).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTask(name) if name == "alpha"));
    }

    #[test]
    fn internal_tasks_are_hidden() {
        let mut registry = TaskRegistry::new();
        registry.register("alpha", noop_handler(), false).unwrap();
        registry.register("sweeper", noop_handler(), true).unwrap();

        assert_eq!(registry.visible_task_names(), vec!["alpha".to_string()]);
        assert_eq!(registry.internal_task_names(), vec!["sweeper".to_string()]);
    }
}
