//! # Taskpool API
//!
//! Shared vocabulary of the taskpool worker pool: the tasks a caller submits,
//! the task functions a worker runs, the events a pool emits and the errors
//! any of them can raise. The engine itself lives in the `taskpool` crate.
//!
//! ## Usage Example
//!
//! ```rust
//! use serde_json::json;
//! use taskpool_api::{TaskFunction, TaskFunctionEntry};
//!
//! let resize = TaskFunctionEntry::new(TaskFunction::new(|data| async move {
//!     Ok(json!({ "resized": data }))
//! }))
//! .with_priority(-5);
//! assert!(resize.validate().is_ok());
//! ```
//!
//! ## Module Organization
//!
//! - [`task`]: tasks, task functions and priority bounds
//! - [`types`]: pool, worker and strategy enums and the `PoolInfo` snapshot
//! - [`event`]: pool events
//! - [`errors`]: error types

pub mod errors;
pub mod event;
pub mod task;
pub mod types;

pub use errors::{ConfigError, PoolError, QueueError, TaskFunctionError, WorkerError};
pub use event::{PoolEvent, PoolEventKind};
pub use task::{
    check_priority, check_task_function_name, Task, TaskData, TaskFunction, TaskFunctionEntry,
    TaskFunctionProperties, TaskFuture, WorkerId, DEFAULT_PRIORITY, DEFAULT_TASK_NAME,
    MAX_PRIORITY, MIN_PRIORITY,
};
pub use types::{
    KillBehavior, Measurement, PoolInfo, PoolType, WorkerChoiceStrategyKind, WorkerType,
};
