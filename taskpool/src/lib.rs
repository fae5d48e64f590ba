// Taskpool worker pool implementation
//
// This crate runs task functions on pools of worker threads, using tokio on
// the pool side and a current-thread tokio runtime inside every worker.

pub mod config;
pub mod logging;
mod message;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod worker;

// Re-export commonly used types
pub use config::{
    KillHandler, PoolOptions, TasksQueueOptions, WorkerChoiceStrategyOptions, WorkerOptions,
};
pub use pool::{TaskHandle, TaskStatistics, ThreadPool, WorkerInfo};
pub use taskpool_api as api;
pub use worker::ThreadWorker;
