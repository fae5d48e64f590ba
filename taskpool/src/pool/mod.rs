//! Worker thread pools.
//!
//! A [`ThreadPool`] is either fixed, holding exactly `n` worker nodes, or
//! dynamic, growing from `min` to `max` nodes under load and shrinking back
//! as dynamic nodes stay idle. Both shapes share one [`core::PoolCore`] and
//! differ only by the [`policy::PoolPolicy`] injected into it.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use taskpool::{PoolOptions, ThreadPool, ThreadWorker, WorkerOptions};
//! use taskpool_api::TaskFunction;
//!
//! # async fn run() -> Result<(), taskpool_api::PoolError> {
//! let worker = ThreadWorker::from_fn(
//!     TaskFunction::from_sync(|data| Ok(json!(data.as_i64().unwrap_or(0) * 2))),
//!     WorkerOptions::default(),
//! )?;
//! let pool = ThreadPool::dynamic(1, 4, worker, PoolOptions::default())?;
//! let doubled = pool.execute(json!(21), None)?.await?;
//! assert_eq!(doubled, json!(42));
//! pool.destroy().await?;
//! # Ok(())
//! # }
//! ```

mod core;
mod events;
mod handle;
mod node;
mod policy;
mod selection;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use taskpool_api::errors::PoolError;
use taskpool_api::event::{PoolEvent, PoolEventKind};
use taskpool_api::task::{TaskData, TaskFunctionEntry, TaskFunctionProperties, WorkerId};
use taskpool_api::types::PoolInfo;
use tokio::runtime::Handle;
use tracing::{Instrument, warn};

use crate::config::{PoolOptions, WorkerErrorHandler, WorkerHandler};
use crate::message::{KillStatus, TaskFunctionOperation, WorkerMessage};
use crate::worker::ThreadWorker;
use crate::{log_worker, pool_span};

use self::core::{Notice, OperationReceiver, Outbox, PoolCore};
use self::events::EventEmitter;
use self::policy::{DynamicPolicy, FixedPolicy, PoolPolicy};

pub use self::events::EventListener;
pub use self::handle::TaskHandle;
pub use self::node::{MeasurementSummary, TaskStatistics, WorkerInfo};
pub use self::selection::{LeastBusy, LeastUsed, RoundRobin, WorkerChoiceStrategy, WorkerNodeView};

const THREAD_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Handle to a pool of worker threads. Clones share the same pool.
///
/// A pool must be created from within a tokio runtime: it runs one listener
/// task per worker node on that runtime.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    core: Mutex<PoolCore>,
    emitter: EventEmitter,
    runtime: Handle,
    kill_timeout: Duration,
    tasks_finished_timeout: Duration,
    error_handler: Option<WorkerErrorHandler>,
    online_handler: Option<WorkerHandler>,
    exit_handler: Option<WorkerHandler>,
}

impl ThreadPool {
    /// Creates a pool of exactly `number_of_threads` worker threads.
    pub fn fixed(
        number_of_threads: usize,
        worker: ThreadWorker,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        Self::create(Box::new(FixedPolicy::new(number_of_threads)?), worker, options)
    }

    /// Creates a pool of `min` to `max` worker threads.
    pub fn dynamic(
        min: usize,
        max: usize,
        worker: ThreadWorker,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        Self::create(Box::new(DynamicPolicy::new(min, max)?), worker, options)
    }

    /// Creates a fixed pool with one worker thread per available CPU.
    pub fn with_available_parallelism(
        worker: ThreadWorker,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        Self::fixed(num_cpus::get().max(1), worker, options)
    }

    fn create(
        policy: Box<dyn PoolPolicy>,
        worker: ThreadWorker,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        options.validate()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;
        let start_workers = options.start_workers;
        let kill_timeout = options.kill_timeout;
        let tasks_finished_timeout = options.tasks_queue_options.tasks_finished_timeout;
        let error_handler = options.error_handler.clone();
        let online_handler = options.online_handler.clone();
        let exit_handler = options.exit_handler.clone();

        let inner = Arc::new_cyclic(|pool: &Weak<PoolInner>| PoolInner {
            core: Mutex::new(PoolCore::new(policy, worker, options, pool.clone(), runtime.clone())),
            emitter: EventEmitter::default(),
            runtime,
            kill_timeout,
            tasks_finished_timeout,
            error_handler,
            online_handler,
            exit_handler,
        });
        let pool = Self { inner };
        if start_workers {
            pool.start()?;
        }
        Ok(pool)
    }

    /// Creates the initial worker nodes.
    pub fn start(&self) -> Result<(), PoolError> {
        let _span = pool_span!("start").entered();
        self.inner.with_core(|core, out| core.start(out))
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().is_started()
    }

    /// Submits a task to the task function `name`, or to the default one.
    ///
    /// Submission errors are returned right away. The handle resolves with
    /// the task output, or with the error the task failed with.
    pub fn execute(&self, data: TaskData, name: Option<&str>) -> Result<TaskHandle, PoolError> {
        self.inner.with_core(|core, out| core.execute(data, name, out))
    }

    /// Submits one task per item of `data` and waits for all of them.
    /// Fails with the first error, in submission order.
    pub async fn map_execute<I>(&self, data: I, name: Option<&str>) -> Result<Vec<TaskData>, PoolError>
    where
        I: IntoIterator<Item = TaskData>,
    {
        let handles = data
            .into_iter()
            .map(|data| self.execute(data, name))
            .collect::<Result<Vec<_>, _>>()?;
        try_join_all(handles).await
    }

    /// Destroys every worker node and emits `destroy`. The pool may be started again.
    pub async fn destroy(&self) -> Result<(), PoolError> {
        let worker_ids = self.inner.lock().prepare_destroy()?;
        let inner = Arc::clone(&self.inner);
        async move {
            join_all(
                worker_ids
                    .into_iter()
                    .map(|worker_id| Arc::clone(&inner).destroy_worker_node(worker_id, true)),
            )
            .await;
            inner.wait_for_exiting_nodes().await;
            inner.with_core(|core, out| core.finish_destroy(out));
        }
        .instrument(pool_span!("destroy"))
        .await;
        Ok(())
    }

    /// Destroys the worker node `key` without draining its queue.
    ///
    /// Its queued tasks are rejected with [`PoolError::WorkerTerminated`];
    /// tasks already running end according to the worker kill behavior.
    pub async fn remove_worker_node(&self, key: usize) -> Result<(), PoolError> {
        let worker_id = self.inner.lock().accept_removal(key)?;
        Arc::clone(&self.inner)
            .destroy_worker_node(worker_id, false)
            .await;
        Ok(())
    }

    pub fn info(&self) -> PoolInfo {
        self.inner.lock().info()
    }

    pub fn worker_nodes(&self) -> Vec<WorkerInfo> {
        self.inner.lock().worker_nodes()
    }

    /// Subscribes `listener` to the events of `kind`.
    pub fn on<F>(&self, kind: PoolEventKind, listener: F)
    where
        F: Fn(&PoolEvent) + Send + Sync + 'static,
    {
        self.inner.emitter.on(kind, Arc::new(listener));
    }

    pub fn has_task_function(&self, name: &str) -> bool {
        self.inner.lock().worker().has_task_function(name)
    }

    pub fn list_task_functions_properties(&self) -> Vec<TaskFunctionProperties> {
        self.inner.lock().worker().list_task_functions_properties()
    }

    /// Registers or replaces the task function `name` on every worker.
    pub async fn add_task_function(
        &self,
        name: impl Into<String>,
        entry: impl Into<TaskFunctionEntry>,
    ) -> Result<(), PoolError> {
        self.task_function_operation(TaskFunctionOperation::Add {
            name: name.into(),
            entry: entry.into(),
        })
        .await
    }

    pub async fn remove_task_function(&self, name: &str) -> Result<(), PoolError> {
        self.task_function_operation(TaskFunctionOperation::Remove {
            name: name.to_string(),
        })
        .await
    }

    pub async fn set_default_task_function(&self, name: &str) -> Result<(), PoolError> {
        self.task_function_operation(TaskFunctionOperation::SetDefault {
            name: name.to_string(),
        })
        .await
    }

    async fn task_function_operation(&self, operation: TaskFunctionOperation) -> Result<(), PoolError> {
        let receivers: Vec<OperationReceiver> =
            self.inner.lock().task_function_operation(operation)?;
        for result in join_all(receivers).await {
            result.map_err(|_| PoolError::ResponseChannelClosed)??;
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("info", &self.info())
            .field("emitter", &self.inner.emitter)
            .finish()
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `operation` under the pool lock, then publishes its outbox.
    fn with_core<R>(self: &Arc<Self>, operation: impl FnOnce(&mut PoolCore, &mut Outbox) -> R) -> R {
        let mut out = Outbox::default();
        let result = {
            let mut core = self.lock();
            operation(&mut core, &mut out)
        };
        self.flush(out);
        result
    }

    fn flush(self: &Arc<Self>, out: Outbox) {
        for event in &out.events {
            self.emitter.emit(event);
        }
        for notice in out.notices {
            match notice {
                Notice::Online(worker_id) => {
                    if let Some(handler) = &self.online_handler {
                        handler(worker_id);
                    }
                }
                Notice::Exit(worker_id) => {
                    if let Some(handler) = &self.exit_handler {
                        handler(worker_id);
                    }
                }
                Notice::Error(worker_id, message) => {
                    if let Some(handler) = &self.error_handler {
                        handler(worker_id, &message);
                    }
                }
            }
        }
        for worker_id in out.removals {
            let pool = Arc::clone(self);
            self.runtime
                .spawn(pool.destroy_worker_node(worker_id, true).instrument(pool_span!("scale_down")));
        }
    }

    /// Removes one worker node: drains or rejects its queue, waits for its
    /// running tasks when draining, runs the kill handshake, then joins its thread.
    async fn destroy_worker_node(self: Arc<Self>, worker_id: WorkerId, drain: bool) {
        let Some(task_finished) = self.lock().begin_removal(worker_id, drain) else {
            return;
        };

        if drain {
            let deadline = tokio::time::Instant::now() + self.tasks_finished_timeout;
            loop {
                let executing = self.lock().executing_tasks(worker_id);
                if executing == 0 {
                    break;
                }
                if tokio::time::timeout_at(deadline, task_finished.notified())
                    .await
                    .is_err()
                {
                    warn!(worker_id, executing, "tasks still running after the tasks finished timeout");
                    break;
                }
            }
        }

        let acknowledgement = self.lock().send_kill(worker_id);
        if let Some(acknowledgement) = acknowledgement {
            match tokio::time::timeout(self.kill_timeout, acknowledgement).await {
                Ok(Ok(KillStatus::Success)) => log_worker!(worker_id, "kill_acknowledged"),
                Ok(Ok(KillStatus::Failure)) => {
                    warn!(worker_id, "worker kill handler failed")
                }
                Ok(Err(_)) => warn!(worker_id, "worker exited without acknowledging the kill request"),
                Err(_) => warn!(worker_id, timeout = ?self.kill_timeout, "kill acknowledgement timed out"),
            }
        }

        let thread = self.with_core(|core, out| core.remove_worker_node(worker_id, out));
        if let Some(thread) = thread {
            self.join_worker_thread(worker_id, thread).await;
        }
    }

    async fn join_worker_thread(&self, worker_id: WorkerId, thread: JoinHandle<()>) {
        let deadline = tokio::time::Instant::now() + self.kill_timeout;
        while !thread.is_finished() {
            if tokio::time::Instant::now() >= deadline {
                warn!(worker_id, "worker thread did not exit in time, detaching it");
                return;
            }
            tokio::time::sleep(THREAD_EXIT_POLL_INTERVAL).await;
        }
        if thread.join().is_err() {
            warn!(worker_id, "worker thread panicked");
        }
    }

    /// Waits for removals started before the pool began destroying.
    async fn wait_for_exiting_nodes(&self) {
        let deadline = tokio::time::Instant::now() + self.tasks_finished_timeout + self.kill_timeout;
        loop {
            let remaining = self.lock().node_count();
            if remaining == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "worker nodes still registered after destroy");
                return;
            }
            tokio::time::sleep(THREAD_EXIT_POLL_INTERVAL).await;
        }
    }
}

/// Forwards the messages of one worker to the pool until the worker thread exits.
pub(crate) async fn listen(
    pool: Weak<PoolInner>,
    worker_id: WorkerId,
    responses: flume::Receiver<WorkerMessage>,
) {
    while let Ok(message) = responses.recv_async().await {
        let Some(pool) = pool.upgrade() else {
            return;
        };
        debug_assert_eq!(message.worker_id(), worker_id);
        pool.with_core(|core, out| core.handle_message(message, out));
    }
    if let Some(pool) = pool.upgrade() {
        pool.with_core(|core, out| core.handle_worker_exit(worker_id, out));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TasksQueueOptions, WorkerOptions};
    use serde_json::json;
    use taskpool_api::task::TaskFunction;

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_crashed_worker_is_reported_and_replaced() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let handler_reported = Arc::clone(&reported);
        let options = PoolOptions {
            enable_tasks_queue: true,
            tasks_queue_options: TasksQueueOptions {
                concurrency: 1,
                ..TasksQueueOptions::default()
            },
            error_handler: Some(Arc::new(move |worker_id: WorkerId, message: &str| {
                handler_reported
                    .lock()
                    .unwrap()
                    .push((worker_id, message.to_string()));
            })),
            ..PoolOptions::default()
        };
        let worker = ThreadWorker::from_fn(
            TaskFunction::new(|data| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(data)
            }),
            WorkerOptions::default(),
        )
        .unwrap();
        let pool = ThreadPool::fixed(1, worker, options).unwrap();
        let error_events = Arc::new(Mutex::new(Vec::new()));
        let listener_events = Arc::clone(&error_events);
        pool.on(PoolEventKind::Error, move |event| {
            if let PoolEvent::Error { worker_id, .. } = event {
                listener_events.lock().unwrap().push(*worker_id);
            }
        });
        assert!(wait_until(|| pool.worker_nodes().iter().all(|node| node.ready)).await);

        let running = pool.execute(json!("running"), None).unwrap();
        let queued = pool.execute(json!("queued"), None).unwrap();
        let crashed = pool.worker_nodes()[0].id;
        pool.inner
            .with_core(|core, out| core.handle_worker_exit(crashed, out));

        assert_eq!(*error_events.lock().unwrap(), vec![crashed]);
        let reported = reported.lock().unwrap().clone();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, crashed);
        assert!(reported[0].1.contains("terminated unexpectedly"));

        let nodes = pool.worker_nodes();
        assert_eq!(nodes.len(), 1);
        assert_ne!(nodes[0].id, crashed);
        assert!(matches!(
            running.await,
            Err(PoolError::WorkerTerminated { worker_id }) if worker_id == crashed
        ));
        assert_eq!(queued.await.unwrap(), json!("queued"));
        pool.destroy().await.unwrap();
    }
}
