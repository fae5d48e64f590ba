//! Pool events.
//!
//! Subscribers register per [`PoolEventKind`] and receive every matching
//! [`PoolEvent`] synchronously, in emission order. Latched events (`Ready`,
//! `Full`) fire once per state transition.

use crate::errors::TaskFunctionError;
use crate::task::WorkerId;
use crate::types::PoolInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEventKind {
    Ready,
    Busy,
    Full,
    FullEnd,
    Empty,
    BackPressure,
    TaskError,
    Error,
    Exit,
    Destroy,
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The pool can accept work
    Ready(PoolInfo),
    /// Every worker node is saturated
    Busy(PoolInfo),
    /// A dynamic pool reached its maximum size
    Full(PoolInfo),
    /// A dynamic pool dropped below its maximum size
    FullEnd(PoolInfo),
    /// A dynamic pool with a zero minimum has no worker node left
    Empty(PoolInfo),
    /// A worker node's queue reached the back pressure threshold
    BackPressure { worker_id: WorkerId, info: PoolInfo },
    /// A task failed inside a worker
    TaskError(TaskFunctionError),
    /// A worker terminated unexpectedly
    Error { worker_id: WorkerId, message: String },
    /// A worker node is leaving the pool. `info` still counts it.
    Exit { worker_id: WorkerId, info: PoolInfo },
    /// The pool was destroyed
    Destroy(PoolInfo),
}

impl PoolEvent {
    pub fn kind(&self) -> PoolEventKind {
        match self {
            PoolEvent::Ready(_) => PoolEventKind::Ready,
            PoolEvent::Busy(_) => PoolEventKind::Busy,
            PoolEvent::Full(_) => PoolEventKind::Full,
            PoolEvent::FullEnd(_) => PoolEventKind::FullEnd,
            PoolEvent::Empty(_) => PoolEventKind::Empty,
            PoolEvent::BackPressure { .. } => PoolEventKind::BackPressure,
            PoolEvent::TaskError(_) => PoolEventKind::TaskError,
            PoolEvent::Error { .. } => PoolEventKind::Error,
            PoolEvent::Exit { .. } => PoolEventKind::Exit,
            PoolEvent::Destroy(_) => PoolEventKind::Destroy,
        }
    }

    /// Pool snapshot taken when the event was emitted, if the event carries one.
    pub fn info(&self) -> Option<&PoolInfo> {
        match self {
            PoolEvent::Ready(info)
            | PoolEvent::Busy(info)
            | PoolEvent::Full(info)
            | PoolEvent::FullEnd(info)
            | PoolEvent::Empty(info)
            | PoolEvent::Destroy(info)
            | PoolEvent::BackPressure { info, .. }
            | PoolEvent::Exit { info, .. } => Some(info),
            PoolEvent::TaskError(_) | PoolEvent::Error { .. } => None,
        }
    }
}
