//! Tasks and task functions.
//!
//! A [`Task`] is one unit of work submitted to a pool. It names the
//! [`TaskFunction`] that will run it inside a worker and carries an opaque
//! JSON payload. Task functions are registered per name in a worker through
//! [`TaskFunctionEntry`] values, which may also declare a queue priority, a
//! worker choice strategy and the worker nodes allowed to run them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ConfigError;
use crate::types::WorkerChoiceStrategyKind;

/// Opaque task payload exchanged between the pool and its workers.
pub type TaskData = serde_json::Value;

/// Pool-unique identifier of a worker.
pub type WorkerId = u64;

/// Reserved name aliasing the worker's default task function.
pub const DEFAULT_TASK_NAME: &str = "default";

/// Most urgent task priority.
pub const MIN_PRIORITY: i32 = -20;

/// Least urgent task priority.
pub const MAX_PRIORITY: i32 = 19;

/// Priority of tasks whose function declares none.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Checks that `priority` lies within [`MIN_PRIORITY`, `MAX_PRIORITY`].
pub fn check_priority(priority: i32) -> Result<(), ConfigError> {
    if (MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(ConfigError::InvalidPriority {
            priority,
            min: MIN_PRIORITY,
            max: MAX_PRIORITY,
        })
    }
}

/// Checks that `name` is usable as a task function name.
///
/// The reserved [`DEFAULT_TASK_NAME`] passes this check; callers that must
/// refuse it do so with their own, more specific error.
pub fn check_task_function_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidTaskFunctionName(
            "name must not be an empty string".to_string(),
        ));
    }
    Ok(())
}

/// A unit of work routed to a worker.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique task identifier, used to match the worker response
    pub task_id: Uuid,
    /// Name of the task function to run
    pub name: String,
    /// Task input
    pub data: TaskData,
    /// Queue priority, lower is more urgent
    pub priority: i32,
    /// Worker choice strategy declared by the task function, if any
    pub strategy: Option<WorkerChoiceStrategyKind>,
    /// Submission time
    pub timestamp: Instant,
}

impl Task {
    pub fn new(name: impl Into<String>, data: TaskData, priority: i32) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            name: name.into(),
            data,
            priority,
            strategy: None,
            timestamp: Instant::now(),
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}

/// Boxed future returned by a task function.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<TaskData>>;

/// A callable run by a worker for each task of its name.
///
/// Cloning is cheap: clones share the same underlying closure.
#[derive(Clone)]
pub struct TaskFunction(Arc<dyn Fn(TaskData) -> TaskFuture + Send + Sync>);

impl TaskFunction {
    /// Wraps an asynchronous function.
    pub fn new<F, Fut>(function: F) -> Self
    where
        F: Fn(TaskData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<TaskData>> + Send + 'static,
    {
        Self(Arc::new(move |data: TaskData| -> TaskFuture {
            Box::pin(function(data))
        }))
    }

    /// Wraps a synchronous function. It runs on the worker thread when the task starts.
    pub fn from_sync<F>(function: F) -> Self
    where
        F: Fn(TaskData) -> anyhow::Result<TaskData> + Send + Sync + 'static,
    {
        Self(Arc::new(move |data: TaskData| -> TaskFuture {
            Box::pin(futures::future::ready(function(data)))
        }))
    }

    pub fn call(&self, data: TaskData) -> TaskFuture {
        (self.0)(data)
    }

    /// Returns true when both values wrap the same closure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskFunction(..)")
    }
}

/// A task function together with its routing properties.
#[derive(Debug, Clone)]
pub struct TaskFunctionEntry {
    pub task_function: TaskFunction,
    /// Queue priority of the tasks run by this function
    pub priority: Option<i32>,
    /// Worker choice strategy used to route tasks of this function
    pub strategy: Option<WorkerChoiceStrategyKind>,
    /// Worker node keys allowed to run tasks of this function
    pub worker_node_keys: Option<Vec<usize>>,
}

impl TaskFunctionEntry {
    pub fn new(task_function: TaskFunction) -> Self {
        Self {
            task_function,
            priority: None,
            strategy: None,
            worker_node_keys: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_strategy(mut self, strategy: WorkerChoiceStrategyKind) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_worker_node_keys(mut self, keys: impl IntoIterator<Item = usize>) -> Self {
        let mut keys: Vec<usize> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        self.worker_node_keys = Some(keys);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(priority) = self.priority {
            check_priority(priority)?;
        }
        Ok(())
    }

    /// Describes this entry under `name`.
    pub fn properties(&self, name: &str) -> TaskFunctionProperties {
        TaskFunctionProperties {
            name: name.to_string(),
            priority: self.priority,
            strategy: self.strategy,
            worker_node_keys: self.worker_node_keys.clone(),
        }
    }
}

impl From<TaskFunction> for TaskFunctionEntry {
    fn from(task_function: TaskFunction) -> Self {
        Self::new(task_function)
    }
}

/// Serializable description of a registered task function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFunctionProperties {
    pub name: String,
    pub priority: Option<i32>,
    pub strategy: Option<WorkerChoiceStrategyKind>,
    pub worker_node_keys: Option<Vec<usize>>,
}
