use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use taskpool_api::errors::ConfigError;
use taskpool_api::task::WorkerId;
use taskpool_api::types::{KillBehavior, Measurement, WorkerChoiceStrategyKind};

use crate::stats::DEFAULT_MEASUREMENT_HISTORY_SIZE;

pub const DEFAULT_TASKS_QUEUE_CONCURRENCY: usize = 1;
pub const DEFAULT_TASKS_FINISHED_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_INACTIVE_TIME: Duration = Duration::from_secs(60);
pub const MIN_MAX_INACTIVE_TIME: Duration = Duration::from_millis(5);

// --- Callbacks ---

/// Called with the id of a worker that came online or exited.
pub type WorkerHandler = Arc<dyn Fn(WorkerId) + Send + Sync>;

/// Called with the id of a worker that terminated unexpectedly and a description of the failure.
pub type WorkerErrorHandler = Arc<dyn Fn(WorkerId, &str) + Send + Sync>;

/// Runs inside a worker before it acknowledges a kill request.
///
/// Implemented for any closure returning a future, a synchronous handler
/// returns `std::future::ready(..)`.
#[async_trait]
pub trait KillHandler: Send + Sync {
    async fn handle_kill(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> KillHandler for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle_kill(&self) -> anyhow::Result<()> {
        (self)().await
    }
}

// --- Pool Configuration ---

/// Per worker node task queue settings.
#[derive(Clone, Debug)]
pub struct TasksQueueOptions {
    /// Queue length at which a worker node is back pressured.
    /// When set, submissions are rejected while every node is back pressured.
    /// Defaults to the square of the pool maximum size.
    pub size: Option<usize>,
    /// Maximum number of tasks executing at once on a worker node.
    pub concurrency: usize,
    /// Whether a worker node that becomes idle steals a task from the longest queue.
    pub task_stealing: bool,
    /// Whether tasks of a back pressured node are spread to less loaded nodes.
    pub tasks_stealing_on_back_pressure: bool,
    /// How long a soft node removal waits for executing tasks to finish.
    pub tasks_finished_timeout: Duration,
}

impl Default for TasksQueueOptions {
    fn default() -> Self {
        Self {
            size: None,
            concurrency: DEFAULT_TASKS_QUEUE_CONCURRENCY,
            task_stealing: true,
            tasks_stealing_on_back_pressure: false,
            tasks_finished_timeout: DEFAULT_TASKS_FINISHED_TIMEOUT,
        }
    }
}

/// Settings shared by the worker choice strategies.
#[derive(Clone, Debug)]
pub struct WorkerChoiceStrategyOptions {
    /// Measurement used by measurement driven strategies, run time by default.
    pub measurement: Option<Measurement>,
    /// Number of samples kept per measurement window.
    pub history_size: usize,
}

impl Default for WorkerChoiceStrategyOptions {
    fn default() -> Self {
        Self {
            measurement: None,
            history_size: DEFAULT_MEASUREMENT_HISTORY_SIZE,
        }
    }
}

/// Configuration for a `ThreadPool`.
#[derive(Clone)]
pub struct PoolOptions {
    /// Create the initial worker nodes during construction.
    pub start_workers: bool,
    /// Default worker node selection policy.
    pub worker_choice_strategy: WorkerChoiceStrategyKind,
    pub worker_choice_strategy_options: WorkerChoiceStrategyOptions,
    /// Replace a static worker node whose thread terminated unexpectedly.
    pub restart_worker_on_error: bool,
    /// Queue tasks on worker nodes instead of dispatching them unconditionally.
    pub enable_tasks_queue: bool,
    pub tasks_queue_options: TasksQueueOptions,
    /// How long the pool waits for a worker kill acknowledgement and thread exit.
    pub kill_timeout: Duration,
    pub error_handler: Option<WorkerErrorHandler>,
    pub online_handler: Option<WorkerHandler>,
    pub exit_handler: Option<WorkerHandler>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            start_workers: true,
            worker_choice_strategy: WorkerChoiceStrategyKind::default(),
            worker_choice_strategy_options: WorkerChoiceStrategyOptions::default(),
            restart_worker_on_error: true,
            enable_tasks_queue: false,
            tasks_queue_options: TasksQueueOptions::default(),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            error_handler: None,
            online_handler: None,
            exit_handler: None,
        }
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("start_workers", &self.start_workers)
            .field("worker_choice_strategy", &self.worker_choice_strategy)
            .field("worker_choice_strategy_options", &self.worker_choice_strategy_options)
            .field("restart_worker_on_error", &self.restart_worker_on_error)
            .field("enable_tasks_queue", &self.enable_tasks_queue)
            .field("tasks_queue_options", &self.tasks_queue_options)
            .field("kill_timeout", &self.kill_timeout)
            .field("error_handler", &self.error_handler.is_some())
            .field("online_handler", &self.online_handler.is_some())
            .field("exit_handler", &self.exit_handler.is_some())
            .finish()
    }
}

impl PoolOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let queue = &self.tasks_queue_options;
        if queue.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(queue.concurrency));
        }
        if let Some(0) = queue.size {
            return Err(ConfigError::InvalidQueueSize(0));
        }
        if self.worker_choice_strategy_options.history_size == 0 {
            return Err(ConfigError::InvalidBufferSize(0));
        }
        Ok(())
    }

    /// Queue length at which a worker node of a pool of at most `max_size` nodes is back pressured.
    pub(crate) fn back_pressure_size(&self, max_size: usize) -> usize {
        self.tasks_queue_options
            .size
            .unwrap_or_else(|| max_size.saturating_mul(max_size))
    }

    /// Whether submissions are refused while the whole pool is back pressured.
    pub(crate) fn hard_queue_cap(&self) -> bool {
        self.enable_tasks_queue && self.tasks_queue_options.size.is_some()
    }
}

// --- Worker Configuration ---

/// Configuration for a `ThreadWorker`.
#[derive(Clone)]
pub struct WorkerOptions {
    /// How the worker terminates once asked to.
    pub kill_behavior: KillBehavior,
    /// Idle time after which a dynamic worker asks to be removed.
    pub max_inactive_time: Duration,
    pub kill_handler: Option<Arc<dyn KillHandler>>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            kill_behavior: KillBehavior::Soft,
            max_inactive_time: DEFAULT_MAX_INACTIVE_TIME,
            kill_handler: None,
        }
    }
}

impl fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("kill_behavior", &self.kill_behavior)
            .field("max_inactive_time", &self.max_inactive_time)
            .field("kill_handler", &self.kill_handler.is_some())
            .finish()
    }
}

impl WorkerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_inactive_time < MIN_MAX_INACTIVE_TIME {
            return Err(ConfigError::InvalidMaxInactiveTime {
                actual: self.max_inactive_time,
                minimum: MIN_MAX_INACTIVE_TIME,
            });
        }
        Ok(())
    }
}
