//! # Pool Error Types
//!
//! This module defines the error types used throughout the taskpool worker pool.
//! Errors are grouped by the moment they surface:
//!
//! - `ConfigError`: invalid construction or registration parameters. Always fatal
//!   and returned synchronously.
//! - `QueueError`: misuse of the fixed-capacity queues.
//! - `WorkerError`: misuse of a worker's task-function registry.
//! - `TaskFunctionError`: the payload of a task that failed inside a worker.
//! - `PoolError`: everything a pool caller can observe, wrapping the above.
//!
//! ## Usage Example
//!
//! ```rust
//! use taskpool_api::errors::PoolError;
//!
//! fn report(error: PoolError) {
//!     match error {
//!         PoolError::TaskExecution(failure) => {
//!             println!("task '{}' failed: {}", failure.name, failure.message);
//!         }
//!         PoolError::BackPressure => println!("pool is saturated, retry later"),
//!         other => println!("unexpected error: {}", other),
//!     }
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{TaskData, WorkerId};

/// Errors raised while validating pool, queue and worker configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Cannot instantiate a fixed pool with zero workers")]
    ZeroWorkers,
    #[error("Cannot instantiate a dynamic pool with a maximum pool size equal to zero")]
    ZeroMaximumWorkers,
    #[error(
        "Cannot instantiate a dynamic pool with a minimum pool size ({min}) not strictly inferior to the maximum pool size ({max})"
    )]
    InvalidDynamicRange { min: usize, max: usize },
    #[error("Invalid tasks queue size: {0} is not a positive integer")]
    InvalidQueueSize(usize),
    #[error("Invalid tasks queue concurrency: {0} is not a positive integer")]
    InvalidConcurrency(usize),
    #[error("Invalid statistics buffer size: {0} is not a positive integer")]
    InvalidBufferSize(usize),
    #[error("Invalid aging parameters: factor {factor} and load exponent {load_exponent}")]
    InvalidAging { factor: f64, load_exponent: f64 },
    #[error("Property 'priority' must be between {min} and {max}, got {priority}")]
    InvalidPriority { priority: i32, min: i32, max: i32 },
    #[error("Invalid task function name: {0}")]
    InvalidTaskFunctionName(String),
    #[error("No task functions provided")]
    EmptyTaskFunctions,
    #[error("Invalid worker option 'max_inactive_time': {actual:?} is below the {minimum:?} minimum")]
    InvalidMaxInactiveTime { actual: Duration, minimum: Duration },
}

/// Errors related to the fixed-capacity ring queues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Invalid queue capacity: {0} is not a positive integer")]
    InvalidCapacity(usize),
    #[error("Invalid bucket size: {0} is not a positive integer")]
    InvalidBucketSize(usize),
    #[error("Priority queue is full (capacity: {capacity})")]
    Full { capacity: usize },
}

/// Errors related to a worker's task-function registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Cannot add a task function with the default reserved name")]
    ReservedNameAdd,
    #[error("Cannot remove a task function with the default reserved name")]
    ReservedNameRemove,
    #[error("Cannot set the default task function reserved name as the default task function")]
    ReservedNameDefault,
    #[error("Cannot remove the task function used as the default task function")]
    RemoveDefault,
    #[error("Task function '{0}' not found")]
    TaskFunctionNotFound(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure payload of a task rejected or panicking inside a worker.
///
/// Carried by the `taskError` pool event and by [`PoolError::TaskExecution`].
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Task function '{name}' failed: {message}")]
pub struct TaskFunctionError {
    /// Name of the task function that failed
    pub name: String,
    /// Rendered error or panic message
    pub message: String,
    /// Input data of the failed task
    pub data: Option<TaskData>,
}

impl TaskFunctionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>, data: Option<TaskData>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            data,
        }
    }
}

/// Errors observable by pool callers.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("Cannot execute a task on not started pool")]
    NotStarted,
    #[error("Cannot use a destroying pool")]
    Destroying,
    #[error("Cannot start an already started pool")]
    AlreadyStarted,
    #[error("Cannot start or destroy a starting pool")]
    Starting,
    #[error("Cannot destroy an already destroyed pool")]
    AlreadyDestroyed,
    #[error("Cannot destroy an already destroying pool")]
    AlreadyDestroying,
    #[error("Invalid task name: {0}")]
    InvalidTaskName(String),
    #[error("Cannot add a task to a back pressured pool")]
    BackPressure,
    #[error("No worker node available to execute task function '{0}'")]
    NoWorkerNode(String),
    #[error("Worker node key {0} does not exist")]
    UnknownWorkerNode(usize),
    #[error("Cannot remove a worker node below the pool minimum size ({min})")]
    BelowMinimum { min: usize },
    #[error(transparent)]
    TaskExecution(TaskFunctionError),
    #[error("Worker {worker_id} terminated before completing the request")]
    WorkerTerminated { worker_id: WorkerId },
    #[error("Failed to send message to worker {worker_id}")]
    Transport { worker_id: WorkerId },
    #[error("Task response channel closed")]
    ResponseChannelClosed,
    #[error("Task function operation failed on worker {worker_id}: {message}")]
    TaskFunctionOperation { worker_id: WorkerId, message: String },
    #[error("Thread setup error: {0}")]
    ThreadSetup(String),
    #[error("A tokio runtime is required to create a pool")]
    NoRuntime,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
