use std::collections::HashMap;
use std::sync::Arc;

use taskpool_api::errors::{ConfigError, WorkerError};
use taskpool_api::task::{
    DEFAULT_TASK_NAME, TaskFunctionEntry, TaskFunctionProperties, check_task_function_name,
};

/// Task functions of a worker, by name.
///
/// The reserved [`DEFAULT_TASK_NAME`] is never an independent entry: it
/// aliases one of the registered entries, initially the first one supplied,
/// and only [`set_default_task_function`](Self::set_default_task_function)
/// changes its target. Entries are shared behind `Arc`, so the alias and its
/// target are the very same entry.
#[derive(Debug, Clone)]
pub struct TaskFunctionRegistry {
    functions: HashMap<String, Arc<TaskFunctionEntry>>,
    /// Registration order of the named entries
    names: Vec<String>,
    default_name: String,
}

impl TaskFunctionRegistry {
    /// Builds a registry whose default task function is the first entry.
    pub fn new<I, N, E>(entries: I) -> Result<Self, WorkerError>
    where
        I: IntoIterator<Item = (N, E)>,
        N: Into<String>,
        E: Into<TaskFunctionEntry>,
    {
        let mut registry = Self {
            functions: HashMap::new(),
            names: Vec::new(),
            default_name: String::new(),
        };
        for (name, entry) in entries {
            registry.insert(name.into(), entry.into())?;
        }
        let first = registry
            .names
            .first()
            .cloned()
            .ok_or(ConfigError::EmptyTaskFunctions)?;
        registry.alias_default(&first);
        Ok(registry)
    }

    /// Number of table entries, the default alias included.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskFunctionEntry>> {
        self.functions.get(name)
    }

    pub fn has_task_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Name of the entry the default alias resolves to.
    pub fn default_task_function_name(&self) -> &str {
        &self.default_name
    }

    /// Registers or replaces `name`.
    pub fn add_task_function(
        &mut self,
        name: impl Into<String>,
        entry: impl Into<TaskFunctionEntry>,
    ) -> Result<(), WorkerError> {
        let name = name.into();
        self.insert(name.clone(), entry.into())?;
        if self.default_name == name {
            self.alias_default(&name);
        }
        Ok(())
    }

    pub fn remove_task_function(&mut self, name: &str) -> Result<(), WorkerError> {
        check_task_function_name(name)?;
        if name == DEFAULT_TASK_NAME {
            return Err(WorkerError::ReservedNameRemove);
        }
        if !self.functions.contains_key(name) {
            return Err(WorkerError::TaskFunctionNotFound(name.to_string()));
        }
        if self.default_name == name {
            return Err(WorkerError::RemoveDefault);
        }
        self.functions.remove(name);
        self.names.retain(|registered| registered != name);
        Ok(())
    }

    /// Points the default alias at the registered entry `name`.
    pub fn set_default_task_function(&mut self, name: &str) -> Result<(), WorkerError> {
        check_task_function_name(name)?;
        if name == DEFAULT_TASK_NAME {
            return Err(WorkerError::ReservedNameDefault);
        }
        if !self.functions.contains_key(name) {
            return Err(WorkerError::TaskFunctionNotFound(name.to_string()));
        }
        self.alias_default(name);
        Ok(())
    }

    /// Properties of every entry, the default alias first.
    pub fn list_task_functions_properties(&self) -> Vec<TaskFunctionProperties> {
        let mut properties = Vec::with_capacity(self.functions.len());
        if let Some(entry) = self.functions.get(DEFAULT_TASK_NAME) {
            properties.push(entry.properties(DEFAULT_TASK_NAME));
        }
        for name in &self.names {
            if let Some(entry) = self.functions.get(name) {
                properties.push(entry.properties(name));
            }
        }
        properties
    }

    fn insert(&mut self, name: String, entry: TaskFunctionEntry) -> Result<(), WorkerError> {
        check_task_function_name(&name)?;
        if name == DEFAULT_TASK_NAME {
            return Err(WorkerError::ReservedNameAdd);
        }
        entry.validate()?;
        if !self.functions.contains_key(&name) {
            self.names.push(name.clone());
        }
        self.functions.insert(name, Arc::new(entry));
        Ok(())
    }

    fn alias_default(&mut self, name: &str) {
        if let Some(entry) = self.functions.get(name).cloned() {
            self.functions.insert(DEFAULT_TASK_NAME.to_string(), entry);
            self.default_name = name.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskpool_api::task::TaskFunction;

    fn echo() -> TaskFunction {
        TaskFunction::from_sync(Ok)
    }

    fn constant(value: i64) -> TaskFunction {
        TaskFunction::from_sync(move |_| Ok(json!(value)))
    }

    #[test]
    fn test_default_aliases_first_entry() {
        let registry = TaskFunctionRegistry::new([("fn1", echo()), ("fn2", constant(2))]).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.default_task_function_name(), "fn1");

        let default = registry.get(DEFAULT_TASK_NAME).unwrap();
        let fn1 = registry.get("fn1").unwrap();
        assert!(Arc::ptr_eq(default, fn1));
        assert!(!Arc::ptr_eq(default, registry.get("fn2").unwrap()));
    }

    #[test]
    fn test_construction_errors() {
        let empty: Vec<(&str, TaskFunction)> = Vec::new();
        assert_eq!(
            TaskFunctionRegistry::new(empty).unwrap_err(),
            WorkerError::Config(ConfigError::EmptyTaskFunctions)
        );
        assert_eq!(
            TaskFunctionRegistry::new([(DEFAULT_TASK_NAME, echo())]).unwrap_err(),
            WorkerError::ReservedNameAdd
        );
        assert!(matches!(
            TaskFunctionRegistry::new([("", echo())]),
            Err(WorkerError::Config(ConfigError::InvalidTaskFunctionName(_)))
        ));
        let too_low = TaskFunctionEntry::new(echo()).with_priority(-21);
        assert!(matches!(
            TaskFunctionRegistry::new([("fn1", too_low)]),
            Err(WorkerError::Config(ConfigError::InvalidPriority { priority: -21, .. }))
        ));
    }

    #[test]
    fn test_add_remove_and_set_default() {
        let mut registry = TaskFunctionRegistry::new([("fn1", echo())]).unwrap();
        registry.add_task_function("fn2", constant(2)).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.add_task_function(DEFAULT_TASK_NAME, echo()),
            Err(WorkerError::ReservedNameAdd)
        );

        assert_eq!(
            registry.remove_task_function(DEFAULT_TASK_NAME),
            Err(WorkerError::ReservedNameRemove)
        );
        assert_eq!(registry.remove_task_function("fn1"), Err(WorkerError::RemoveDefault));
        assert_eq!(
            registry.remove_task_function("missing"),
            Err(WorkerError::TaskFunctionNotFound("missing".to_string()))
        );

        assert_eq!(
            registry.set_default_task_function(DEFAULT_TASK_NAME),
            Err(WorkerError::ReservedNameDefault)
        );
        registry.set_default_task_function("fn2").unwrap();
        assert!(Arc::ptr_eq(
            registry.get(DEFAULT_TASK_NAME).unwrap(),
            registry.get("fn2").unwrap()
        ));
        registry.remove_task_function("fn1").unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.has_task_function("fn1"));
    }

    #[test]
    fn test_replacing_default_target_updates_alias() {
        let mut registry = TaskFunctionRegistry::new([("fn1", echo())]).unwrap();
        let replacement = TaskFunctionEntry::new(constant(7)).with_priority(3);
        registry.add_task_function("fn1", replacement).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(DEFAULT_TASK_NAME).unwrap().priority, Some(3));
    }

    #[test]
    fn test_properties_list_default_first() {
        let registry = TaskFunctionRegistry::new([
            ("fn1", TaskFunctionEntry::new(echo())),
            ("fn2", TaskFunctionEntry::new(constant(2)).with_priority(-1)),
        ])
        .unwrap();
        let names: Vec<String> = registry
            .list_task_functions_properties()
            .into_iter()
            .map(|properties| properties.name)
            .collect();
        assert_eq!(names, vec![DEFAULT_TASK_NAME, "fn1", "fn2"]);
        assert_eq!(registry.list_task_functions_properties()[2].priority, Some(-1));
    }
}
