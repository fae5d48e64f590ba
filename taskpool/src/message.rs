//! Pool ⇄ worker protocol.
//!
//! Each worker node owns two unbounded flume channels: the pool writes
//! [`PoolMessage`]s into the worker inbox, the worker answers with
//! [`WorkerMessage`]s over the port handed to it by the startup handshake.

use std::time::{Duration, Instant};

use taskpool_api::errors::TaskFunctionError;
use taskpool_api::task::{Task, TaskData, TaskFunctionEntry, TaskFunctionProperties, WorkerId};
use taskpool_api::types::KillBehavior;
use uuid::Uuid;

/// Registry change broadcast by the pool to its workers.
#[derive(Debug, Clone)]
pub(crate) enum TaskFunctionOperation {
    Add { name: String, entry: TaskFunctionEntry },
    Remove { name: String },
    SetDefault { name: String },
}

pub(crate) enum PoolMessage {
    /// First message of every worker: hands over the response port
    Handshake {
        worker_id: WorkerId,
        port: flume::Sender<WorkerMessage>,
    },
    Execute(Task),
    /// Arms or disarms the idle check of a dynamic worker
    CheckActive(bool),
    TaskFunctionOperation {
        operation_id: Uuid,
        operation: TaskFunctionOperation,
    },
    Kill,
}

/// Timing of one task run.
#[derive(Debug, Clone)]
pub(crate) struct TaskPerformance {
    pub name: String,
    pub started_at: Instant,
    pub run_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KillStatus {
    Success,
    Failure,
}

pub(crate) enum WorkerMessage {
    Ready {
        worker_id: WorkerId,
        properties: Vec<TaskFunctionProperties>,
    },
    TaskResponse {
        worker_id: WorkerId,
        task_id: Uuid,
        outcome: Result<TaskData, TaskFunctionError>,
        performance: TaskPerformance,
    },
    TaskFunctionOperationResult {
        worker_id: WorkerId,
        operation_id: Uuid,
        result: Result<(), String>,
        properties: Vec<TaskFunctionProperties>,
    },
    /// The worker asks to be removed after its idle time expired
    Kill {
        worker_id: WorkerId,
        behavior: KillBehavior,
    },
    KillAck {
        worker_id: WorkerId,
        status: KillStatus,
    },
}

impl WorkerMessage {
    pub(crate) fn worker_id(&self) -> WorkerId {
        match self {
            WorkerMessage::Ready { worker_id, .. }
            | WorkerMessage::TaskResponse { worker_id, .. }
            | WorkerMessage::TaskFunctionOperationResult { worker_id, .. }
            | WorkerMessage::Kill { worker_id, .. }
            | WorkerMessage::KillAck { worker_id, .. } => *worker_id,
        }
    }
}
