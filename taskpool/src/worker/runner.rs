use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures::FutureExt;
use taskpool_api::errors::TaskFunctionError;
use taskpool_api::task::{Task, TaskData, WorkerId};
use taskpool_api::types::KillBehavior;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::WorkerOptions;
use crate::message::{KillStatus, PoolMessage, TaskFunctionOperation, TaskPerformance, WorkerMessage};
use crate::{log_error, log_worker};

use super::ThreadWorker;
use super::registry::TaskFunctionRegistry;

/// Entry point of a worker thread.
pub(super) fn run_worker_thread(
    worker: ThreadWorker,
    worker_id: WorkerId,
    inbox: flume::Receiver<PoolMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            log_error!(error, worker_id = worker_id, operation = "runtime_setup");
            return;
        }
    };
    let runner = WorkerRunner::new(worker, worker_id);
    runtime.block_on(runner.run(inbox));
    log_worker!(worker_id, "thread_exit");
}

struct CompletedTask {
    task_id: Uuid,
    outcome: Result<TaskData, TaskFunctionError>,
    performance: TaskPerformance,
}

enum Flow {
    Continue,
    Exit,
}

struct WorkerRunner {
    worker_id: WorkerId,
    registry: TaskFunctionRegistry,
    options: WorkerOptions,
    port: Option<flume::Sender<WorkerMessage>>,
    last_task_at: Instant,
    check_active: bool,
    running: JoinSet<CompletedTask>,
}

impl WorkerRunner {
    fn new(worker: ThreadWorker, worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            registry: worker.registry,
            options: worker.options,
            port: None,
            last_task_at: Instant::now(),
            check_active: false,
            running: JoinSet::new(),
        }
    }

    async fn run(mut self, inbox: flume::Receiver<PoolMessage>) {
        let period = (self.options.max_inactive_time / 2).max(Duration::from_millis(1));
        let mut check_interval = tokio::time::interval(period);
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = inbox.recv_async() => {
                    let Ok(message) = message else {
                        debug!(worker_id = self.worker_id, "pool dropped the worker inbox");
                        break;
                    };
                    if let Flow::Exit = self.handle_message(message).await {
                        break;
                    }
                }
                Some(joined) = self.running.join_next() => self.handle_joined(joined),
                _ = check_interval.tick(), if self.check_active => self.check_alive(),
            }
        }
    }

    async fn handle_message(&mut self, message: PoolMessage) -> Flow {
        match message {
            PoolMessage::Handshake { worker_id, port } => {
                debug_assert_eq!(worker_id, self.worker_id);
                self.port = Some(port);
                let properties = self.registry.list_task_functions_properties();
                self.send(WorkerMessage::Ready {
                    worker_id: self.worker_id,
                    properties,
                });
                log_worker!(self.worker_id, "ready");
            }
            PoolMessage::Execute(task) => self.run_task(task),
            PoolMessage::CheckActive(active) => {
                self.check_active = active;
                self.last_task_at = Instant::now();
            }
            PoolMessage::TaskFunctionOperation {
                operation_id,
                operation,
            } => self.apply_task_function_operation(operation_id, operation),
            PoolMessage::Kill => {
                self.handle_kill().await;
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    fn run_task(&mut self, task: Task) {
        self.last_task_at = Instant::now();
        let Task {
            task_id, name, data, ..
        } = task;

        let Some(task_function) = self
            .registry
            .get(&name)
            .map(|entry| entry.task_function.clone())
        else {
            let error = TaskFunctionError::new(
                name.as_str(),
                format!("Task function '{}' not found", name),
                Some(data),
            );
            self.send(WorkerMessage::TaskResponse {
                worker_id: self.worker_id,
                task_id,
                outcome: Err(error),
                performance: TaskPerformance {
                    name,
                    started_at: Instant::now(),
                    run_time: Duration::ZERO,
                },
            });
            return;
        };

        trace!(worker_id = self.worker_id, task = %name, %task_id, "task started");
        self.running.spawn(async move {
            let started_at = Instant::now();
            let input = data.clone();
            let result = AssertUnwindSafe(async move { task_function.call(data).await })
                .catch_unwind()
                .await;
            let run_time = started_at.elapsed();
            let outcome = match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(error)) => Err(TaskFunctionError::new(
                    name.as_str(),
                    format!("{:#}", error),
                    Some(input),
                )),
                Err(panic) => Err(TaskFunctionError::new(
                    name.as_str(),
                    panic_message(panic.as_ref()),
                    Some(input),
                )),
            };
            CompletedTask {
                task_id,
                outcome,
                performance: TaskPerformance {
                    name,
                    started_at,
                    run_time,
                },
            }
        });
    }

    fn handle_joined(&mut self, joined: Result<CompletedTask, JoinError>) {
        self.last_task_at = Instant::now();
        match joined {
            Ok(completed) => self.send(WorkerMessage::TaskResponse {
                worker_id: self.worker_id,
                task_id: completed.task_id,
                outcome: completed.outcome,
                performance: completed.performance,
            }),
            Err(error) => warn!(worker_id = self.worker_id, %error, "task did not complete"),
        }
    }

    fn apply_task_function_operation(&mut self, operation_id: Uuid, operation: TaskFunctionOperation) {
        let result = match operation {
            TaskFunctionOperation::Add { name, entry } => self.registry.add_task_function(name, entry),
            TaskFunctionOperation::Remove { name } => self.registry.remove_task_function(&name),
            TaskFunctionOperation::SetDefault { name } => {
                self.registry.set_default_task_function(&name)
            }
        };
        let properties = self.registry.list_task_functions_properties();
        self.send(WorkerMessage::TaskFunctionOperationResult {
            worker_id: self.worker_id,
            operation_id,
            result: result.map_err(|error| error.to_string()),
            properties,
        });
    }

    /// Asks the pool for removal once idle for longer than `max_inactive_time`.
    fn check_alive(&mut self) {
        if self.running.is_empty() && self.last_task_at.elapsed() > self.options.max_inactive_time {
            log_worker!(self.worker_id, "inactive", behavior = ?self.options.kill_behavior);
            self.send(WorkerMessage::Kill {
                worker_id: self.worker_id,
                behavior: self.options.kill_behavior,
            });
        }
    }

    async fn handle_kill(&mut self) {
        match self.options.kill_behavior {
            KillBehavior::Soft => {
                while let Some(joined) = self.running.join_next().await {
                    self.handle_joined(joined);
                }
            }
            KillBehavior::Hard => {
                let abandoned = self.running.len();
                self.running.shutdown().await;
                if abandoned > 0 {
                    warn!(worker_id = self.worker_id, abandoned, "hard kill abandoned in-flight tasks");
                }
            }
        }

        let status = match &self.options.kill_handler {
            Some(handler) => match handler.handle_kill().await {
                Ok(()) => KillStatus::Success,
                Err(error) => {
                    warn!(worker_id = self.worker_id, error = %error, "kill handler failed");
                    KillStatus::Failure
                }
            },
            None => KillStatus::Success,
        };
        self.send(WorkerMessage::KillAck {
            worker_id: self.worker_id,
            status,
        });
        log_worker!(self.worker_id, "killed", status = ?status);
    }

    fn send(&self, message: WorkerMessage) {
        match &self.port {
            Some(port) => {
                if port.send(message).is_err() {
                    debug!(worker_id = self.worker_id, "pool port closed, dropping message");
                }
            }
            None => warn!(worker_id = self.worker_id, "message sent before handshake, dropping it"),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "task function panicked".to_string()
    }
}
