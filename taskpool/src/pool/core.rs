//! Pool bookkeeping shared by both pool shapes.
//!
//! [`PoolCore`] owns the worker nodes, the pending task table and the
//! latched pool states. Every method runs synchronously under the pool lock
//! and never blocks: observable side effects (events, user callbacks, node
//! removals that need to await a handshake) are collected into an
//! [`Outbox`] and published by the caller once the lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use taskpool_api::errors::{PoolError, TaskFunctionError};
use taskpool_api::event::PoolEvent;
use taskpool_api::task::{
    DEFAULT_PRIORITY, DEFAULT_TASK_NAME, Task, TaskData, TaskFunctionProperties, WorkerId,
};
use taskpool_api::types::{KillBehavior, PoolInfo, WorkerChoiceStrategyKind, WorkerType};
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PoolOptions;
use crate::message::{KillStatus, PoolMessage, TaskFunctionOperation, TaskPerformance, WorkerMessage};
use crate::stats::StatisticsRingBuffer;
use crate::worker::ThreadWorker;
use crate::{log_error, log_pool, log_task, log_worker};

use super::handle::TaskHandle;
use super::node::{WorkerInfo, WorkerNode};
use super::policy::PoolPolicy;
use super::selection::{StrategyContext, WorkerNodeView};
use super::{PoolInner, listen};

/// Worker callbacks to run once the pool lock is released.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Notice {
    Online(WorkerId),
    Exit(WorkerId),
    Error(WorkerId, String),
}

#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub events: Vec<PoolEvent>,
    pub notices: Vec<Notice>,
    /// Idle worker nodes accepted for removal, already marked exiting
    pub removals: Vec<WorkerId>,
}

struct PendingTask {
    worker_id: WorkerId,
    sender: oneshot::Sender<Result<TaskData, PoolError>>,
}

struct PendingOperation {
    worker_id: WorkerId,
    sender: oneshot::Sender<Result<(), PoolError>>,
}

pub(crate) type OperationReceiver = oneshot::Receiver<Result<(), PoolError>>;

pub(crate) struct PoolCore {
    policy: Box<dyn PoolPolicy>,
    options: PoolOptions,
    /// Template cloned into every new worker node
    worker: ThreadWorker,
    nodes: Vec<WorkerNode>,
    strategies: StrategyContext,
    /// Whether nodes record run and wait time windows
    measurements: bool,
    /// Whether node queues order tasks by priority
    queue_priority: bool,
    pending: HashMap<Uuid, PendingTask>,
    operations: HashMap<Uuid, PendingOperation>,
    next_worker_id: WorkerId,
    started: bool,
    starting: bool,
    destroying: bool,
    ready_emitted: bool,
    full: bool,
    pool: Weak<PoolInner>,
    runtime: Handle,
}

impl PoolCore {
    pub fn new(
        policy: Box<dyn PoolPolicy>,
        worker: ThreadWorker,
        options: PoolOptions,
        pool: Weak<PoolInner>,
        runtime: Handle,
    ) -> Self {
        let strategies = StrategyContext::new(
            options.worker_choice_strategy,
            options.worker_choice_strategy_options.clone(),
        );
        let mut core = Self {
            policy,
            options,
            worker,
            nodes: Vec::new(),
            strategies,
            measurements: false,
            queue_priority: false,
            pending: HashMap::new(),
            operations: HashMap::new(),
            next_worker_id: 1,
            started: false,
            starting: false,
            destroying: false,
            ready_emitted: false,
            full: false,
            pool,
            runtime,
        };
        core.refresh_task_function_settings();
        core
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn worker(&self) -> &ThreadWorker {
        &self.worker
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // --- Lifecycle ---

    pub fn start(&mut self, out: &mut Outbox) -> Result<(), PoolError> {
        if self.started {
            return Err(PoolError::AlreadyStarted);
        }
        if self.starting {
            return Err(PoolError::Starting);
        }
        if self.destroying {
            return Err(PoolError::Destroying);
        }
        self.starting = true;
        for _ in 0..self.policy.min_size() {
            if let Err(error) = self.create_worker_node(false, out) {
                self.starting = false;
                log_error!(error, operation = "start");
                return Err(error);
            }
        }
        self.starting = false;
        self.started = true;
        log_pool!("start", "started", pool_type = ?self.policy.pool_type(), workers = self.nodes.len());
        self.check_ready(out);
        Ok(())
    }

    /// Flags the pool as destroying and returns the worker nodes to destroy.
    pub fn prepare_destroy(&mut self) -> Result<Vec<WorkerId>, PoolError> {
        if self.destroying {
            return Err(PoolError::AlreadyDestroying);
        }
        if self.starting {
            return Err(PoolError::Starting);
        }
        if !self.started {
            return Err(PoolError::AlreadyDestroyed);
        }
        self.destroying = true;
        log_pool!("destroy", "destroying", workers = self.nodes.len());
        Ok(self
            .nodes
            .iter()
            .filter(|node| !node.exiting)
            .map(|node| node.id)
            .collect())
    }

    pub fn finish_destroy(&mut self, out: &mut Outbox) {
        out.events.push(PoolEvent::Destroy(self.info()));
        self.started = false;
        self.destroying = false;
        self.ready_emitted = false;
        self.full = false;
        log_pool!("destroy", "destroyed");
    }

    fn create_worker_node(&mut self, dynamic: bool, out: &mut Outbox) -> Result<usize, PoolError> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let (inbox, receiver) = flume::unbounded();
        let (port, responses) = flume::unbounded();
        inbox
            .send(PoolMessage::Handshake { worker_id, port })
            .map_err(|_| PoolError::Transport { worker_id })?;
        if dynamic {
            inbox
                .send(PoolMessage::CheckActive(true))
                .map_err(|_| PoolError::Transport { worker_id })?;
        }
        let thread = self.worker.clone().spawn(worker_id, receiver)?;
        self.runtime.spawn(listen(self.pool.clone(), worker_id, responses));

        let history = self.measurements.then(|| self.strategies.history_size());
        self.nodes.push(WorkerNode::new(
            worker_id,
            dynamic,
            inbox,
            thread,
            self.queue_priority,
            history,
        ));
        log_worker!(worker_id, "created", dynamic = dynamic, nodes = self.nodes.len());

        if !self.full && self.policy.full(self.nodes.len()) {
            self.full = true;
            out.events.push(PoolEvent::Full(self.info()));
        }
        Ok(self.nodes.len() - 1)
    }

    fn check_ready(&mut self, out: &mut Outbox) {
        if !self.ready_emitted && self.started && self.is_ready() {
            self.ready_emitted = true;
            log_pool!("start", "ready", workers = self.nodes.len());
            out.events.push(PoolEvent::Ready(self.info()));
        }
    }

    /// Ready once every static node answered its handshake, or, without
    /// static nodes, once any node did.
    fn is_ready(&self) -> bool {
        let min = self.policy.min_size();
        if min == 0 {
            return self.nodes.iter().any(|node| node.ready);
        }
        self.nodes
            .iter()
            .filter(|node| !node.dynamic && node.ready)
            .count()
            >= min
    }

    // --- Submission ---

    pub fn execute(
        &mut self,
        data: TaskData,
        name: Option<&str>,
        out: &mut Outbox,
    ) -> Result<TaskHandle, PoolError> {
        if self.destroying {
            return Err(PoolError::Destroying);
        }
        if !self.started {
            return Err(PoolError::NotStarted);
        }
        let name = match name {
            None => DEFAULT_TASK_NAME,
            Some(name) if name.trim().is_empty() => {
                return Err(PoolError::InvalidTaskName(
                    "name must not be an empty string".to_string(),
                ));
            }
            Some(DEFAULT_TASK_NAME) => {
                return Err(PoolError::InvalidTaskName(format!(
                    "'{}' is reserved, omit the name to run the default task function",
                    DEFAULT_TASK_NAME
                )));
            }
            Some(name) => name,
        };
        if self.options.hard_queue_cap() && self.back_pressure() {
            return Err(PoolError::BackPressure);
        }

        let entry = self.worker.task_functions().get(name).cloned();
        let priority = entry
            .as_ref()
            .and_then(|entry| entry.priority)
            .unwrap_or(DEFAULT_PRIORITY);
        let strategy = entry.as_ref().and_then(|entry| entry.strategy);
        let keys = entry.and_then(|entry| entry.worker_node_keys.clone());
        let key = self.select_worker_node(name, strategy, keys.as_deref(), out)?;

        let mut task = Task::new(name, data, priority);
        task.strategy = strategy;
        let task_id = task.task_id;
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(
            task_id,
            PendingTask {
                worker_id: self.nodes[key].id,
                sender,
            },
        );
        log_task!(name, "submitted", %task_id, worker_key = key);
        self.dispatch(key, task, out);

        if self.policy.busy(self.nodes.len(), self.internal_busy()) {
            out.events.push(PoolEvent::Busy(self.info()));
        }
        Ok(TaskHandle::new(task_id, receiver))
    }

    /// Picks the node running the next task of `name`, growing a dynamic pool first when warranted.
    fn select_worker_node(
        &mut self,
        name: &str,
        strategy: Option<WorkerChoiceStrategyKind>,
        keys: Option<&[usize]>,
        out: &mut Outbox,
    ) -> Result<usize, PoolError> {
        let eligible = |key: usize| keys.is_none_or(|keys| keys.contains(&key));
        if self
            .policy
            .shall_create_dynamic_worker(self.nodes.len(), self.live_nodes(), self.internal_busy())
        {
            let key = self.create_worker_node(true, out)?;
            if eligible(key) {
                return Ok(key);
            }
        }

        let views: Vec<WorkerNodeView> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(key, node)| !node.exiting && eligible(*key))
            .map(|(key, node)| node.view(key))
            .collect();
        let ready: Vec<WorkerNodeView> = views.iter().filter(|view| view.ready).copied().collect();
        let candidates = if ready.is_empty() { views } else { ready };
        self.strategies
            .choose(strategy, &candidates)
            .ok_or_else(|| PoolError::NoWorkerNode(name.to_string()))
    }

    fn dispatch(&mut self, key: usize, task: Task, out: &mut Outbox) {
        let concurrency = self.options.tasks_queue_options.concurrency;
        let node = &self.nodes[key];
        if self.options.enable_tasks_queue
            && (!node.queue.is_empty() || node.usage.executing >= concurrency)
        {
            self.enqueue_task(key, task, out);
        } else {
            self.execute_task(key, task);
        }
    }

    fn execute_task(&mut self, key: usize, task: Task) {
        let history_size = self.strategies.history_size();
        let measurements = self.measurements;
        let node = &mut self.nodes[key];
        node.usage.executing += 1;
        if measurements {
            record(&mut node.wait_time, history_size, task.timestamp.elapsed());
        }
        let (task_id, worker_id) = (task.task_id, node.id);
        if !node.send(PoolMessage::Execute(task)) {
            node.usage.executing -= 1;
            self.settle(task_id, Err(PoolError::Transport { worker_id }));
        }
    }

    fn enqueue_task(&mut self, key: usize, task: Task, out: &mut Outbox) {
        let threshold = self.back_pressure_size();
        let node = &mut self.nodes[key];
        let size = node.enqueue_task(task);
        if size < threshold || node.back_pressure {
            return;
        }
        node.back_pressure = true;
        let worker_id = node.id;
        debug!(worker_id, queued = size, "worker node back pressured");
        out.events.push(PoolEvent::BackPressure {
            worker_id,
            info: self.info(),
        });
        if self.options.tasks_queue_options.tasks_stealing_on_back_pressure {
            self.steal_on_back_pressure(key);
        }
    }

    fn back_pressure_size(&self) -> usize {
        self.options.back_pressure_size(self.policy.max_size())
    }

    fn refresh_back_pressure(&mut self, key: usize) {
        let threshold = self.back_pressure_size();
        let node = &mut self.nodes[key];
        if node.back_pressure && node.queue.len() < threshold {
            node.back_pressure = false;
        }
    }

    // --- Stealing ---

    /// Gives the idle node `key` a task from the longest queue.
    fn steal_task(&mut self, key: usize) {
        let source = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(source, node)| *source != key && !node.exiting && !node.queue.is_empty())
            .max_by_key(|(source, node)| (node.queue.len(), std::cmp::Reverse(*source)))
            .map(|(source, _)| source);
        if let Some(source) = source {
            self.move_task(source, key);
        }
    }

    /// Spreads the queue of the back pressured node `source` over lightly loaded nodes.
    fn steal_on_back_pressure(&mut self, source: usize) {
        let threshold = self.back_pressure_size();
        let mut destinations: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(key, node)| {
                *key != source
                    && node.ready
                    && !node.exiting
                    && !node.back_pressure
                    && node.queue.len() + 1 < threshold
            })
            .map(|(key, _)| key)
            .collect();
        destinations.sort_by_key(|key| {
            let node = &self.nodes[*key];
            (node.queue.len() + node.usage.executing, *key)
        });
        for destination in destinations {
            if self.nodes[source].queue.is_empty() {
                break;
            }
            self.move_task(source, destination);
        }
    }

    fn move_task(&mut self, source: usize, destination: usize) {
        let Some(task) = self.nodes[source].dequeue_last_prioritized_task() else {
            return;
        };
        if !self.eligible(&task.name, destination) {
            self.nodes[source].enqueue_task(task);
            return;
        }
        self.refresh_back_pressure(source);

        let from = self.nodes[source].id;
        let to = self.nodes[destination].id;
        if let Some(pending) = self.pending.get_mut(&task.task_id) {
            pending.worker_id = to;
        }
        log_task!(task.name.as_str(), "stolen", task_id = %task.task_id, from = from, to = to);

        let concurrency = self.options.tasks_queue_options.concurrency;
        let node = &mut self.nodes[destination];
        node.usage.stolen += 1;
        node.usage.sequentially_stolen += 1;
        if node.queue.is_empty() && node.usage.executing < concurrency {
            self.execute_task(destination, task);
        } else {
            node.enqueue_task(task);
        }
    }

    fn eligible(&self, name: &str, key: usize) -> bool {
        self.worker
            .task_functions()
            .get(name)
            .and_then(|entry| entry.worker_node_keys.as_ref())
            .is_none_or(|keys| keys.contains(&key))
    }

    // --- Worker messages ---

    pub fn handle_message(&mut self, message: WorkerMessage, out: &mut Outbox) {
        match message {
            WorkerMessage::Ready {
                worker_id,
                properties,
            } => self.handle_ready(worker_id, properties, out),
            WorkerMessage::TaskResponse {
                worker_id,
                task_id,
                outcome,
                performance,
            } => self.handle_task_response(worker_id, task_id, outcome, performance, out),
            WorkerMessage::TaskFunctionOperationResult {
                worker_id,
                operation_id,
                result,
                properties,
            } => {
                if let Some(node) = self.node_mut(worker_id) {
                    node.properties = properties;
                }
                if let Some(operation) = self.operations.remove(&operation_id) {
                    let result = result
                        .map_err(|message| PoolError::TaskFunctionOperation { worker_id, message });
                    let _ = operation.sender.send(result);
                }
            }
            WorkerMessage::Kill {
                worker_id,
                behavior,
            } => self.handle_kill_request(worker_id, behavior, out),
            WorkerMessage::KillAck { worker_id, status } => {
                if let Some(acknowledgement) =
                    self.node_mut(worker_id).and_then(|node| node.kill_ack.take())
                {
                    let _ = acknowledgement.send(status);
                }
            }
        }
    }

    fn handle_ready(
        &mut self,
        worker_id: WorkerId,
        properties: Vec<TaskFunctionProperties>,
        out: &mut Outbox,
    ) {
        let Some(node) = self.node_mut(worker_id) else {
            return;
        };
        node.ready = true;
        node.properties = properties;
        log_worker!(worker_id, "online");
        out.notices.push(Notice::Online(worker_id));
        self.check_ready(out);
    }

    fn handle_task_response(
        &mut self,
        worker_id: WorkerId,
        task_id: Uuid,
        outcome: Result<TaskData, TaskFunctionError>,
        performance: TaskPerformance,
        out: &mut Outbox,
    ) {
        let key = self.key_of(worker_id);
        if let Some(key) = key {
            let history_size = self.strategies.history_size();
            let measurements = self.measurements;
            let node = &mut self.nodes[key];
            node.usage.executing = node.usage.executing.saturating_sub(1);
            if outcome.is_ok() {
                node.usage.executed += 1;
            } else {
                node.usage.failed += 1;
            }
            if measurements {
                record(&mut node.run_time, history_size, performance.run_time);
            }
            node.task_finished.notify_one();
        }

        match outcome {
            Ok(data) => {
                log_task!(
                    performance.name.as_str(),
                    "completed",
                    %task_id,
                    run_time_ms = performance.run_time.as_secs_f64() * 1000.0
                );
                self.settle(task_id, Ok(data));
            }
            Err(error) => {
                warn!(worker_id, task = %error.name, %task_id, message = %error.message, "task failed");
                out.events.push(PoolEvent::TaskError(error.clone()));
                self.settle(task_id, Err(PoolError::TaskExecution(error)));
            }
        }

        if let Some(key) = key {
            self.after_task_finished(key);
        }
    }

    /// Feeds a node that just finished a task from its own queue, or lets it steal.
    fn after_task_finished(&mut self, key: usize) {
        if !self.options.enable_tasks_queue || self.nodes[key].exiting {
            return;
        }
        let concurrency = self.options.tasks_queue_options.concurrency;
        let stealing = self.options.tasks_queue_options.task_stealing;
        let node = &mut self.nodes[key];
        if !node.queue.is_empty() {
            if node.usage.executing >= concurrency {
                return;
            }
            if let Some(task) = node.dequeue_task(None) {
                node.usage.sequentially_stolen = 0;
                self.refresh_back_pressure(key);
                self.execute_task(key, task);
            }
        } else if stealing && node.usage.executing == 0 {
            self.steal_task(key);
        }
    }

    /// Accepts the removal request of an idle dynamic node while the pool is above its minimum.
    fn handle_kill_request(&mut self, worker_id: WorkerId, behavior: KillBehavior, out: &mut Outbox) {
        let accepting = self.started && !self.destroying;
        let above_minimum = self.live_nodes() > self.policy.min_size();
        let Some(node) = self.node_mut(worker_id) else {
            return;
        };
        if !node.dynamic || node.exiting {
            return;
        }
        if !accepting || !above_minimum || !node.is_idle() {
            node.send(PoolMessage::CheckActive(true));
            return;
        }
        node.exiting = true;
        log_worker!(worker_id, "idle_removal_accepted", behavior = ?behavior);
        out.removals.push(worker_id);
    }

    /// Handles a worker thread that went away. Unexpected exits are crashes.
    pub fn handle_worker_exit(&mut self, worker_id: WorkerId, out: &mut Outbox) {
        let Some(key) = self.key_of(worker_id) else {
            return;
        };
        let node = &mut self.nodes[key];
        if node.exiting {
            node.kill_ack = None;
            return;
        }
        node.exiting = true;
        let dynamic = node.dynamic;
        let orphans: Vec<Task> = node.drain_queue();

        let message = format!("Worker {} terminated unexpectedly", worker_id);
        log_error!(message, worker_id = worker_id);
        out.events.push(PoolEvent::Error {
            worker_id,
            message: message.clone(),
        });
        out.notices.push(Notice::Error(worker_id, message));

        let parked: Vec<(Task, Option<PendingTask>)> = orphans
            .into_iter()
            .map(|task| {
                let pending = self.pending.remove(&task.task_id);
                (task, pending)
            })
            .collect();
        drop(self.remove_node(key, out));

        if self.options.restart_worker_on_error && self.started && !self.destroying && !dynamic {
            if let Err(error) = self.create_worker_node(false, out) {
                log_error!(error, operation = "restart_worker");
            }
        }

        let mut tasks = Vec::with_capacity(parked.len());
        for (task, pending) in parked {
            if let Some(pending) = pending {
                self.pending.insert(task.task_id, pending);
            }
            tasks.push(task);
        }
        self.redistribute(worker_id, tasks, out);
    }

    fn redistribute(&mut self, from: WorkerId, tasks: Vec<Task>, out: &mut Outbox) {
        for task in tasks {
            if !self.started || self.destroying {
                self.settle(task.task_id, Err(PoolError::WorkerTerminated { worker_id: from }));
                continue;
            }
            let keys = self
                .worker
                .task_functions()
                .get(&task.name)
                .and_then(|entry| entry.worker_node_keys.clone());
            match self.select_worker_node(&task.name, task.strategy, keys.as_deref(), out) {
                Ok(key) => {
                    let worker_id = self.nodes[key].id;
                    if let Some(pending) = self.pending.get_mut(&task.task_id) {
                        pending.worker_id = worker_id;
                    }
                    self.dispatch(key, task, out);
                }
                Err(error) => self.settle(task.task_id, Err(error)),
            }
        }
    }

    // --- Node removal ---

    /// Validates an explicit removal of node `key` and marks it exiting.
    pub fn accept_removal(&mut self, key: usize) -> Result<WorkerId, PoolError> {
        if self.destroying {
            return Err(PoolError::Destroying);
        }
        if !self.started {
            return Err(PoolError::NotStarted);
        }
        let min = self.policy.min_size();
        if self.nodes.get(key).is_none_or(|node| node.exiting) {
            return Err(PoolError::UnknownWorkerNode(key));
        }
        if self.live_nodes() <= min {
            return Err(PoolError::BelowMinimum { min });
        }
        let node = &mut self.nodes[key];
        node.exiting = true;
        Ok(node.id)
    }

    /// Marks `worker_id` exiting. Its queued tasks are handed to the worker
    /// when `drain` is set and rejected otherwise.
    pub fn begin_removal(&mut self, worker_id: WorkerId, drain: bool) -> Option<Arc<Notify>> {
        let key = self.key_of(worker_id)?;
        let node = &mut self.nodes[key];
        node.exiting = true;
        node.back_pressure = false;
        let task_finished = node.task_finished.clone();
        for task in node.drain_queue() {
            if drain {
                self.execute_task(key, task);
            } else {
                self.settle(task.task_id, Err(PoolError::WorkerTerminated { worker_id }));
            }
        }
        Some(task_finished)
    }

    pub fn executing_tasks(&self, worker_id: WorkerId) -> usize {
        self.key_of(worker_id)
            .map_or(0, |key| self.nodes[key].usage.executing)
    }

    /// Asks the worker to exit; the receiver resolves with its acknowledgement.
    pub fn send_kill(&mut self, worker_id: WorkerId) -> Option<oneshot::Receiver<KillStatus>> {
        let node = self.node_mut(worker_id)?;
        let (sender, receiver) = oneshot::channel();
        node.kill_ack = Some(sender);
        if !node.send(PoolMessage::Kill) {
            node.kill_ack = None;
            return None;
        }
        log_worker!(worker_id, "kill_requested");
        Some(receiver)
    }

    /// Drops the node from the pool and hands back its thread.
    pub fn remove_worker_node(&mut self, worker_id: WorkerId, out: &mut Outbox) -> Option<JoinHandle<()>> {
        let key = self.key_of(worker_id)?;
        self.remove_node(key, out).take_thread()
    }

    fn remove_node(&mut self, key: usize, out: &mut Outbox) -> WorkerNode {
        out.events.push(PoolEvent::Exit {
            worker_id: self.nodes[key].id,
            info: self.info(),
        });
        let node = self.nodes.remove(key);
        self.strategies.remove(key);
        let worker_id = node.id;

        let abandoned: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.worker_id == worker_id)
            .map(|(task_id, _)| *task_id)
            .collect();
        for task_id in abandoned {
            self.settle(task_id, Err(PoolError::WorkerTerminated { worker_id }));
        }
        let operations: Vec<Uuid> = self
            .operations
            .iter()
            .filter(|(_, operation)| operation.worker_id == worker_id)
            .map(|(operation_id, _)| *operation_id)
            .collect();
        for operation_id in operations {
            if let Some(operation) = self.operations.remove(&operation_id) {
                let _ = operation.sender.send(Err(PoolError::WorkerTerminated { worker_id }));
            }
        }

        log_worker!(worker_id, "removed", nodes = self.nodes.len());
        out.notices.push(Notice::Exit(worker_id));
        if self.full && !self.policy.full(self.nodes.len()) {
            self.full = false;
            out.events.push(PoolEvent::FullEnd(self.info()));
        }
        if self.started && self.policy.empty(self.nodes.len()) {
            out.events.push(PoolEvent::Empty(self.info()));
        }
        node
    }

    // --- Task functions ---

    /// Applies `operation` to the worker template, then broadcasts it to every live worker.
    pub fn task_function_operation(
        &mut self,
        operation: TaskFunctionOperation,
    ) -> Result<Vec<OperationReceiver>, PoolError> {
        if self.destroying {
            return Err(PoolError::Destroying);
        }
        match &operation {
            TaskFunctionOperation::Add { name, entry } => {
                self.worker.add_task_function(name.clone(), entry.clone())?
            }
            TaskFunctionOperation::Remove { name } => self.worker.remove_task_function(name)?,
            TaskFunctionOperation::SetDefault { name } => self.worker.set_default_task_function(name)?,
        }
        self.refresh_task_function_settings();

        let mut receivers = Vec::new();
        for node in self.nodes.iter().filter(|node| !node.exiting) {
            let operation_id = Uuid::new_v4();
            let (sender, receiver) = oneshot::channel();
            let message = PoolMessage::TaskFunctionOperation {
                operation_id,
                operation: operation.clone(),
            };
            if node.send(message) {
                self.operations.insert(
                    operation_id,
                    PendingOperation {
                        worker_id: node.id,
                        sender,
                    },
                );
                receivers.push(receiver);
            }
        }
        Ok(receivers)
    }

    fn refresh_task_function_settings(&mut self) {
        let properties = self.worker.list_task_functions_properties();
        self.measurements = self
            .strategies
            .needs_measurements(properties.iter().filter_map(|properties| properties.strategy));
        self.queue_priority = properties
            .iter()
            .any(|properties| properties.priority.is_some());
        for node in &mut self.nodes {
            node.set_queue_priority(self.queue_priority);
        }
    }

    // --- Observability ---

    pub fn info(&self) -> PoolInfo {
        let concurrency = self.options.tasks_queue_options.concurrency;
        let enable_tasks_queue = self.options.enable_tasks_queue;
        let sum = |field: fn(&WorkerNode) -> usize| self.nodes.iter().map(field).sum::<usize>();
        PoolInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pool_type: self.policy.pool_type(),
            worker_type: WorkerType::Thread,
            started: self.started,
            ready: self.is_ready(),
            strategy: self.strategies.default_kind(),
            min_size: self.policy.min_size(),
            max_size: self.policy.max_size(),
            worker_nodes: self.nodes.len(),
            idle_worker_nodes: self
                .nodes
                .iter()
                .filter(|node| node.usage.executing == 0)
                .count(),
            busy_worker_nodes: self
                .nodes
                .iter()
                .filter(|node| {
                    if enable_tasks_queue {
                        node.usage.executing >= concurrency
                    } else {
                        node.usage.executing > 0
                    }
                })
                .count(),
            executed_tasks: sum(|node| node.usage.executed),
            executing_tasks: sum(|node| node.usage.executing),
            queued_tasks: sum(|node| node.queue.len()),
            max_queued_tasks: sum(|node| node.usage.max_queued),
            stolen_tasks: sum(|node| node.usage.stolen),
            failed_tasks: sum(|node| node.usage.failed),
            back_pressure: self.back_pressure(),
        }
    }

    pub fn worker_nodes(&self) -> Vec<WorkerInfo> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(key, node)| node.info(key))
            .collect()
    }

    /// True when no live node can take a task right away.
    fn internal_busy(&self) -> bool {
        let concurrency = self.options.tasks_queue_options.concurrency;
        let enable_tasks_queue = self.options.enable_tasks_queue;
        !self.nodes.iter().any(|node| {
            !node.exiting
                && if enable_tasks_queue {
                    node.usage.executing < concurrency
                } else {
                    node.usage.executing == 0
                }
        })
    }

    fn back_pressure(&self) -> bool {
        let mut live = self.nodes.iter().filter(|node| !node.exiting).peekable();
        let every_node = live.peek().is_some() && live.all(|node| node.back_pressure);
        self.policy.back_pressure(self.nodes.len(), every_node)
    }

    fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|node| !node.exiting).count()
    }

    fn key_of(&self, worker_id: WorkerId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == worker_id)
    }

    fn node_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerNode> {
        self.nodes.iter_mut().find(|node| node.id == worker_id)
    }

    fn settle(&mut self, task_id: Uuid, result: Result<TaskData, PoolError>) {
        if let Some(pending) = self.pending.remove(&task_id) {
            let _ = pending.sender.send(result);
        }
    }
}

impl std::fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCore")
            .field("policy", &self.policy)
            .field("nodes", &self.nodes.len())
            .field("pending", &self.pending.len())
            .field("started", &self.started)
            .field("destroying", &self.destroying)
            .finish()
    }
}

fn record(window: &mut Option<StatisticsRingBuffer>, history_size: usize, sample: Duration) {
    if window.is_none() {
        *window = StatisticsRingBuffer::new(history_size).ok();
    }
    if let Some(window) = window {
        window.put(sample.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    //! The core is exercised without a live pool: listeners cannot reach a
    //! pool and exit on the first message, so no response is ever processed
    //! and the usage counters reflect dispatch decisions only.

    use super::*;
    use crate::config::{TasksQueueOptions, WorkerOptions};
    use crate::pool::policy::{DynamicPolicy, FixedPolicy};
    use serde_json::json;
    use taskpool_api::task::{TaskFunction, TaskFunctionEntry};
    use taskpool_api::types::PoolType;

    fn worker() -> ThreadWorker {
        ThreadWorker::new(
            [
                ("fn1", TaskFunctionEntry::new(TaskFunction::from_sync(Ok))),
                (
                    "pinned",
                    TaskFunctionEntry::new(TaskFunction::from_sync(Ok)).with_worker_node_keys([1]),
                ),
            ],
            WorkerOptions::default(),
        )
        .unwrap()
    }

    fn core(policy: Box<dyn PoolPolicy>, options: PoolOptions) -> PoolCore {
        let mut core = PoolCore::new(policy, worker(), options, Weak::new(), Handle::current());
        core.start(&mut Outbox::default()).unwrap();
        core
    }

    fn queued_options(size: Option<usize>, concurrency: usize) -> PoolOptions {
        PoolOptions {
            enable_tasks_queue: true,
            tasks_queue_options: TasksQueueOptions {
                size,
                concurrency,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn count(out: &Outbox, kind: taskpool_api::event::PoolEventKind) -> usize {
        out.events.iter().filter(|event| event.kind() == kind).count()
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let mut core = PoolCore::new(
            Box::new(FixedPolicy::new(1).unwrap()),
            worker(),
            PoolOptions::default(),
            Weak::new(),
            Handle::current(),
        );
        let mut out = Outbox::default();
        assert!(matches!(core.execute(json!(1), None, &mut out), Err(PoolError::NotStarted)));
        assert!(matches!(core.prepare_destroy(), Err(PoolError::AlreadyDestroyed)));

        core.start(&mut out).unwrap();
        assert!(matches!(core.start(&mut out), Err(PoolError::AlreadyStarted)));
        assert_eq!(core.prepare_destroy().unwrap().len(), 1);
        assert!(matches!(core.prepare_destroy(), Err(PoolError::AlreadyDestroying)));
        assert!(matches!(core.execute(json!(1), None, &mut out), Err(PoolError::Destroying)));
    }

    #[tokio::test]
    async fn test_fixed_pool_busy_events() {
        let mut core = core(Box::new(FixedPolicy::new(3).unwrap()), PoolOptions::default());
        let mut out = Outbox::default();
        for i in 0..6 {
            core.execute(json!(i), None, &mut out).unwrap();
        }
        assert_eq!(count(&out, taskpool_api::event::PoolEventKind::Busy), 4);
        let info = core.info();
        assert_eq!(info.pool_type, PoolType::Fixed);
        assert_eq!(info.executing_tasks, 6);
        assert_eq!(info.busy_worker_nodes, 3);
        assert!(core.worker_nodes().iter().all(|node| node.tasks.executing == 2));
    }

    #[tokio::test]
    async fn test_task_name_validation() {
        let mut core = core(Box::new(FixedPolicy::new(1).unwrap()), PoolOptions::default());
        let mut out = Outbox::default();
        assert!(matches!(
            core.execute(json!(1), Some("  "), &mut out),
            Err(PoolError::InvalidTaskName(_))
        ));
        assert!(matches!(
            core.execute(json!(1), Some(DEFAULT_TASK_NAME), &mut out),
            Err(PoolError::InvalidTaskName(_))
        ));
        assert!(matches!(
            core.execute(json!(1), Some("pinned"), &mut out),
            Err(PoolError::NoWorkerNode(name)) if name == "pinned"
        ));
        assert!(core.execute(json!(1), Some("fn1"), &mut out).is_ok());
    }

    #[tokio::test]
    async fn test_queueing_respects_concurrency() {
        let mut core = core(Box::new(FixedPolicy::new(2).unwrap()), queued_options(None, 2));
        let mut out = Outbox::default();
        for i in 0..6 {
            core.execute(json!(i), None, &mut out).unwrap();
        }
        for node in core.worker_nodes() {
            assert_eq!(node.tasks.executing, 2);
            assert_eq!(node.tasks.queued, 1);
            assert_eq!(node.tasks.executed, 0);
        }
        assert_eq!(core.info().queued_tasks, 2);
        assert!(!core.info().back_pressure);
    }

    #[tokio::test]
    async fn test_hard_queue_cap_rejects_when_back_pressured() {
        let mut core = core(Box::new(FixedPolicy::new(2).unwrap()), queued_options(Some(1), 1));
        let mut out = Outbox::default();
        for i in 0..4 {
            core.execute(json!(i), None, &mut out).unwrap();
        }
        assert_eq!(count(&out, taskpool_api::event::PoolEventKind::BackPressure), 2);
        assert!(core.info().back_pressure);
        assert!(matches!(
            core.execute(json!(4), None, &mut out),
            Err(PoolError::BackPressure)
        ));
    }

    #[tokio::test]
    async fn test_dynamic_growth_and_full_latch() {
        let mut core = core(Box::new(DynamicPolicy::new(1, 3).unwrap()), PoolOptions::default());
        let mut out = Outbox::default();
        for i in 0..6 {
            core.execute(json!(i), None, &mut out).unwrap();
        }
        assert_eq!(core.node_count(), 3);
        assert_eq!(count(&out, taskpool_api::event::PoolEventKind::Full), 1);
        assert_eq!(count(&out, taskpool_api::event::PoolEventKind::Busy), 4);
        let dynamic = core.worker_nodes().iter().filter(|node| node.dynamic).count();
        assert_eq!(dynamic, 2);
    }

    #[tokio::test]
    async fn test_removal_rules() {
        let mut core = core(Box::new(DynamicPolicy::new(1, 3).unwrap()), PoolOptions::default());
        let mut out = Outbox::default();
        assert!(matches!(core.accept_removal(0), Err(PoolError::BelowMinimum { min: 1 })));
        assert!(matches!(core.accept_removal(5), Err(PoolError::UnknownWorkerNode(5))));

        let handle = core.execute(json!(1), None, &mut out).unwrap();
        core.execute(json!(2), None, &mut out).unwrap();
        assert_eq!(core.node_count(), 2);

        let worker_id = core.accept_removal(0).unwrap();
        assert!(core.begin_removal(worker_id, false).is_some());
        assert!(core.remove_worker_node(worker_id, &mut out).is_some());
        assert_eq!(core.node_count(), 1);
        assert!(out.notices.contains(&Notice::Exit(worker_id)));
        let exit = out
            .events
            .iter()
            .find_map(|event| match event {
                PoolEvent::Exit { worker_id: id, info } => Some((*id, info.worker_nodes)),
                _ => None,
            })
            .unwrap();
        assert_eq!(exit, (worker_id, 2));
        assert!(matches!(
            handle.await,
            Err(PoolError::WorkerTerminated { worker_id: id }) if id == worker_id
        ));
    }

    #[tokio::test]
    async fn test_task_function_operations_update_template() {
        let mut core = core(Box::new(FixedPolicy::new(2).unwrap()), PoolOptions::default());
        let receivers = core
            .task_function_operation(TaskFunctionOperation::Add {
                name: "urgent".to_string(),
                entry: TaskFunctionEntry::new(TaskFunction::from_sync(Ok)).with_priority(-10),
            })
            .unwrap();
        assert_eq!(receivers.len(), 2);
        assert!(core.worker().has_task_function("urgent"));
        assert!(core.queue_priority);

        let error = core
            .task_function_operation(TaskFunctionOperation::Remove {
                name: "fn1".to_string(),
            })
            .unwrap_err();
        assert!(matches!(
            error,
            PoolError::Worker(taskpool_api::errors::WorkerError::RemoveDefault)
        ));
    }

    fn complete(core: &mut PoolCore, worker_id: WorkerId, task_id: Uuid, out: &mut Outbox) {
        core.handle_message(
            WorkerMessage::TaskResponse {
                worker_id,
                task_id,
                outcome: Ok(json!(null)),
                performance: TaskPerformance {
                    name: "fn1".to_string(),
                    started_at: std::time::Instant::now(),
                    run_time: std::time::Duration::ZERO,
                },
            },
            out,
        );
    }

    #[tokio::test]
    async fn test_pool_grows_while_every_node_is_exiting() {
        let mut core = core(Box::new(DynamicPolicy::new(0, 1).unwrap()), PoolOptions::default());
        let mut out = Outbox::default();
        let handle = core.execute(json!(1), None, &mut out).unwrap();
        let worker_id = core.nodes[0].id;
        complete(&mut core, worker_id, handle.task_id(), &mut out);
        assert_eq!(handle.await.unwrap(), json!(null));

        core.handle_message(
            WorkerMessage::Kill {
                worker_id,
                behavior: KillBehavior::Soft,
            },
            &mut out,
        );
        assert_eq!(out.removals, vec![worker_id]);
        assert!(core.nodes[0].exiting);

        core.execute(json!(2), None, &mut out).unwrap();
        assert_eq!(core.node_count(), 2);
        assert!(!core.nodes[1].exiting);
        assert_eq!(core.nodes[1].usage.executing, 1);
    }

    #[tokio::test]
    async fn test_back_pressured_node_spreads_its_queue() {
        let mut options = queued_options(Some(2), 1);
        options.tasks_queue_options.tasks_stealing_on_back_pressure = true;
        options.tasks_queue_options.task_stealing = false;
        let mut core = core(Box::new(FixedPolicy::new(3).unwrap()), options);
        for node in &mut core.nodes {
            node.ready = true;
        }
        let mut out = Outbox::default();
        for i in 0..3 {
            core.dispatch(0, Task::new("fn1", json!(i), DEFAULT_PRIORITY), &mut out);
        }

        assert_eq!(count(&out, taskpool_api::event::PoolEventKind::BackPressure), 1);
        let nodes = core.worker_nodes();
        assert_eq!(nodes[0].tasks.executing, 1);
        assert_eq!(nodes[0].tasks.queued, 0);
        assert!(!nodes[0].back_pressure);
        for node in &nodes[1..] {
            assert_eq!(node.tasks.stolen, 1);
            assert_eq!(node.tasks.executing, 1);
        }
        assert_eq!(core.info().stolen_tasks, 2);
    }

    #[tokio::test]
    async fn test_crashed_node_is_replaced_and_its_queue_redistributed() {
        let mut core = core(Box::new(FixedPolicy::new(2).unwrap()), queued_options(None, 1));
        let mut out = Outbox::default();
        let handles: Vec<TaskHandle> = (0..4)
            .map(|i| core.execute(json!(i), None, &mut out).unwrap())
            .collect();
        let crashed = core.nodes[0].id;
        let survivor = core.nodes[1].id;

        let mut out = Outbox::default();
        core.handle_worker_exit(crashed, &mut out);

        assert_eq!(count(&out, taskpool_api::event::PoolEventKind::Error), 1);
        assert!(out.notices.iter().any(|notice| matches!(notice, Notice::Error(id, _) if *id == crashed)));
        assert_eq!(core.node_count(), 2);
        assert_eq!(core.nodes[0].id, survivor);
        assert!(!core.nodes[1].dynamic);
        assert_ne!(core.nodes[1].id, crashed);

        // The running task is lost, the queued one moved to a live node
        let info = core.info();
        assert_eq!(info.executing_tasks + info.queued_tasks, 3);
        assert_eq!(core.pending.len(), 3);
        assert!(core.pending.values().all(|pending| pending.worker_id != crashed));
        let mut handles = handles.into_iter();
        assert!(matches!(
            handles.next().unwrap().await,
            Err(PoolError::WorkerTerminated { worker_id }) if worker_id == crashed
        ));
    }

    #[tokio::test]
    async fn test_crashed_node_is_not_replaced_when_restart_disabled() {
        let options = PoolOptions {
            restart_worker_on_error: false,
            ..PoolOptions::default()
        };
        let mut core = core(Box::new(FixedPolicy::new(2).unwrap()), options);
        let crashed = core.nodes[0].id;
        let mut out = Outbox::default();
        core.handle_worker_exit(crashed, &mut out);
        assert_eq!(core.node_count(), 1);
        assert!(core.nodes.iter().all(|node| node.id != crashed));

        // A second exit notification for the same worker is ignored
        let mut out = Outbox::default();
        core.handle_worker_exit(crashed, &mut out);
        assert!(out.events.is_empty());
    }
}
