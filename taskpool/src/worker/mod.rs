//! Worker side of the pool.
//!
//! A [`ThreadWorker`] is the template a pool clones into every worker node:
//! its task-function registry and its [`WorkerOptions`]. Each node runs the
//! template on a dedicated, named OS thread driving a current-thread tokio
//! runtime, and talks to the pool only through the message protocol.

mod registry;
mod runner;

use std::thread::JoinHandle;

use taskpool_api::errors::{PoolError, WorkerError};
use taskpool_api::task::{TaskFunction, TaskFunctionEntry, TaskFunctionProperties, WorkerId};

use crate::config::WorkerOptions;
use crate::logging;
use crate::message::PoolMessage;

pub use registry::TaskFunctionRegistry;

/// Name under which [`ThreadWorker::from_fn`] registers its only task function.
pub const SINGLE_TASK_FUNCTION_NAME: &str = "fn1";

#[derive(Debug, Clone)]
pub struct ThreadWorker {
    registry: TaskFunctionRegistry,
    options: WorkerOptions,
}

impl ThreadWorker {
    /// Creates a worker running several named task functions.
    /// The first one becomes the default task function.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use serde_json::json;
    /// use taskpool::{ThreadWorker, WorkerOptions};
    /// use taskpool_api::TaskFunction;
    ///
    /// let worker = ThreadWorker::new(
    ///     [
    ///         ("add", TaskFunction::from_sync(|data| Ok(json!(data["a"].as_i64().unwrap_or(0) + 1)))),
    ///         ("echo", TaskFunction::new(|data| async move { Ok(data) })),
    ///     ],
    ///     WorkerOptions::default(),
    /// )
    /// .unwrap();
    /// assert_eq!(worker.task_functions().len(), 3);
    /// ```
    pub fn new<I, N, E>(entries: I, options: WorkerOptions) -> Result<Self, WorkerError>
    where
        I: IntoIterator<Item = (N, E)>,
        N: Into<String>,
        E: Into<TaskFunctionEntry>,
    {
        options.validate()?;
        Ok(Self {
            registry: TaskFunctionRegistry::new(entries)?,
            options,
        })
    }

    /// Creates a worker running a single task function.
    pub fn from_fn(task_function: TaskFunction, options: WorkerOptions) -> Result<Self, WorkerError> {
        Self::new([(SINGLE_TASK_FUNCTION_NAME, task_function)], options)
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn task_functions(&self) -> &TaskFunctionRegistry {
        &self.registry
    }

    pub fn has_task_function(&self, name: &str) -> bool {
        self.registry.has_task_function(name)
    }

    pub fn add_task_function(
        &mut self,
        name: impl Into<String>,
        entry: impl Into<TaskFunctionEntry>,
    ) -> Result<(), WorkerError> {
        self.registry.add_task_function(name, entry)
    }

    pub fn remove_task_function(&mut self, name: &str) -> Result<(), WorkerError> {
        self.registry.remove_task_function(name)
    }

    pub fn set_default_task_function(&mut self, name: &str) -> Result<(), WorkerError> {
        self.registry.set_default_task_function(name)
    }

    pub fn list_task_functions_properties(&self) -> Vec<TaskFunctionProperties> {
        self.registry.list_task_functions_properties()
    }

    /// Starts the worker thread. It serves `inbox` until told to exit or until the
    /// pool drops its side of the channel.
    pub(crate) fn spawn(
        self,
        worker_id: WorkerId,
        inbox: flume::Receiver<PoolMessage>,
    ) -> Result<JoinHandle<()>, PoolError> {
        let dispatch = logging::current_subscriber();
        std::thread::Builder::new()
            .name(format!("taskpool-worker-{}", worker_id))
            .spawn(move || {
                let _guard = tracing::dispatcher::set_default(&dispatch);
                runner::run_worker_thread(self, worker_id, inbox);
            })
            .map_err(|e| PoolError::ThreadSetup(e.to_string()))
    }
}
