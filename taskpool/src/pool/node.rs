use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use taskpool_api::task::{Task, TaskFunctionProperties, WorkerId};
use tokio::sync::{Notify, oneshot};

use crate::message::{KillStatus, PoolMessage};
use crate::queue::{DEFAULT_BUCKET_SIZE, PriorityQueue};
use crate::stats::StatisticsRingBuffer;

use super::selection::WorkerNodeView;

/// Task counters of one worker node, or of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    pub executed: usize,
    pub executing: usize,
    pub queued: usize,
    pub max_queued: usize,
    /// Tasks stolen in a row since the node last ran one of its own
    pub sequentially_stolen: usize,
    pub stolen: usize,
    pub failed: usize,
}

/// Summary of a measurement window, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSummary {
    pub samples: usize,
    pub average: Option<f64>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
}

impl MeasurementSummary {
    fn from_window(window: Option<&StatisticsRingBuffer>) -> Self {
        let Some(window) = window else {
            return Self::default();
        };
        let samples = window.to_vec();
        if samples.is_empty() {
            return Self::default();
        }
        let sum: f64 = samples.iter().sum();
        Self {
            samples: samples.len(),
            average: Some(sum / samples.len() as f64),
            minimum: samples.iter().copied().reduce(f64::min),
            maximum: samples.iter().copied().reduce(f64::max),
        }
    }
}

/// Read-only snapshot of a worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub key: usize,
    pub id: WorkerId,
    pub dynamic: bool,
    pub ready: bool,
    pub back_pressure: bool,
    pub exiting: bool,
    pub task_functions_properties: Vec<TaskFunctionProperties>,
    pub tasks: TaskStatistics,
    pub run_time: MeasurementSummary,
    pub wait_time: MeasurementSummary,
}

/// The pool's handle on one worker thread: its inbox, its task queue and its usage.
pub(crate) struct WorkerNode {
    pub id: WorkerId,
    pub dynamic: bool,
    pub ready: bool,
    pub back_pressure: bool,
    pub exiting: bool,
    pub properties: Vec<TaskFunctionProperties>,
    pub usage: TaskStatistics,
    pub queue: PriorityQueue<Task>,
    pub run_time: Option<StatisticsRingBuffer>,
    pub wait_time: Option<StatisticsRingBuffer>,
    /// Signalled after each task response
    pub task_finished: Arc<Notify>,
    /// Resolved by the worker kill acknowledgement
    pub kill_ack: Option<oneshot::Sender<KillStatus>>,
    inbox: flume::Sender<PoolMessage>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerNode {
    pub fn new(
        id: WorkerId,
        dynamic: bool,
        inbox: flume::Sender<PoolMessage>,
        thread: JoinHandle<()>,
        enable_priority: bool,
        history_size: Option<usize>,
    ) -> Self {
        let window = || history_size.and_then(|size| StatisticsRingBuffer::new(size).ok());
        Self {
            id,
            dynamic,
            ready: false,
            back_pressure: false,
            exiting: false,
            properties: Vec::new(),
            usage: TaskStatistics::default(),
            queue: PriorityQueue::with_bucket_size(DEFAULT_BUCKET_SIZE, enable_priority),
            run_time: window(),
            wait_time: window(),
            task_finished: Arc::new(Notify::new()),
            kill_ack: None,
            inbox,
            thread: Some(thread),
        }
    }

    /// Returns false when the worker thread is gone.
    pub fn send(&self, message: PoolMessage) -> bool {
        self.inbox.send(message).is_ok()
    }

    pub fn enqueue_task(&mut self, task: Task) -> usize {
        let priority = task.priority;
        let size = self.queue.enqueue(task, Some(priority));
        self.usage.queued = size;
        self.usage.max_queued = self.queue.max_size();
        size
    }

    pub fn dequeue_task(&mut self, bucket: Option<usize>) -> Option<Task> {
        let task = self.queue.dequeue(bucket)?;
        self.usage.queued = self.queue.len();
        Some(task)
    }

    /// Dequeues from the newest bucket, the tasks least likely to run soon.
    pub fn dequeue_last_prioritized_task(&mut self) -> Option<Task> {
        let last = self.queue.buckets() + 1;
        match self.dequeue_task(Some(last)) {
            Some(task) => Some(task),
            None => self.dequeue_task(None),
        }
    }

    pub fn drain_queue(&mut self) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(self.queue.len());
        while let Some(task) = self.dequeue_task(None) {
            tasks.push(task);
        }
        tasks
    }

    pub fn set_queue_priority(&mut self, enable_priority: bool) {
        self.queue.set_enable_priority(enable_priority);
    }

    pub fn is_idle(&self) -> bool {
        self.usage.executing == 0 && self.queue.is_empty()
    }

    pub fn view(&self, key: usize) -> WorkerNodeView {
        WorkerNodeView {
            key,
            ready: self.ready,
            executing: self.usage.executing,
            queued: self.queue.len(),
            run_time: MeasurementSummary::from_window(self.run_time.as_ref()).average,
            wait_time: MeasurementSummary::from_window(self.wait_time.as_ref()).average,
        }
    }

    pub fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }

    pub fn info(&self, key: usize) -> WorkerInfo {
        WorkerInfo {
            key,
            id: self.id,
            dynamic: self.dynamic,
            ready: self.ready,
            back_pressure: self.back_pressure,
            exiting: self.exiting,
            task_functions_properties: self.properties.clone(),
            tasks: self.usage.clone(),
            run_time: MeasurementSummary::from_window(self.run_time.as_ref()),
            wait_time: MeasurementSummary::from_window(self.wait_time.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> (WorkerNode, flume::Receiver<PoolMessage>) {
        let (inbox, receiver) = flume::unbounded();
        let thread = std::thread::spawn(|| {});
        (WorkerNode::new(1, false, inbox, thread, false, Some(4)), receiver)
    }

    #[test]
    fn test_queue_usage_tracking() {
        let (mut node, _receiver) = node();
        assert!(node.is_idle());
        node.enqueue_task(Task::new("fn1", json!(1), 0));
        node.enqueue_task(Task::new("fn1", json!(2), 0));
        assert_eq!(node.usage.queued, 2);
        assert_eq!(node.usage.max_queued, 2);
        assert!(!node.is_idle());

        assert_eq!(node.dequeue_task(None).unwrap().data, json!(1));
        assert_eq!(node.dequeue_last_prioritized_task().unwrap().data, json!(2));
        assert_eq!(node.usage.queued, 0);
        assert_eq!(node.usage.max_queued, 2);
        assert!(node.dequeue_last_prioritized_task().is_none());
    }

    #[test]
    fn test_info_summarizes_windows() {
        let (mut node, _receiver) = node();
        if let Some(window) = node.run_time.as_mut() {
            window.put(10.0);
            window.put(30.0);
        }
        let info = node.info(0);
        assert_eq!(info.run_time.samples, 2);
        assert_eq!(info.run_time.average, Some(20.0));
        assert_eq!(info.run_time.minimum, Some(10.0));
        assert_eq!(info.run_time.maximum, Some(30.0));
        assert_eq!(info.wait_time, MeasurementSummary::default());
    }

    #[test]
    fn test_send_fails_once_inbox_closed() {
        let (node, receiver) = node();
        assert!(node.send(PoolMessage::CheckActive(true)));
        drop(receiver);
        assert!(!node.send(PoolMessage::CheckActive(true)));
    }
}
