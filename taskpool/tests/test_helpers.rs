#![allow(dead_code)]

use std::time::Duration;

use serde_json::json;
use taskpool::{ThreadPool, ThreadWorker, WorkerOptions};
use taskpool_api::{TaskData, TaskFunction};

/// Default wait time for async operations during tests
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(5);

/// Worker returning its input
pub fn echo_worker() -> ThreadWorker {
    ThreadWorker::from_fn(TaskFunction::from_sync(Ok), WorkerOptions::default())
        .expect("echo worker")
}

/// Worker sleeping `millis` milliseconds per task, then returning its input
pub fn sleep_worker(millis: u64, options: WorkerOptions) -> ThreadWorker {
    ThreadWorker::from_fn(sleep_function(millis), options).expect("sleep worker")
}

pub fn sleep_function(millis: u64) -> TaskFunction {
    TaskFunction::new(move |data: TaskData| async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(data)
    })
}

/// Task function sleeping as many milliseconds as its input says
pub fn sleep_for_input() -> TaskFunction {
    TaskFunction::new(|data: TaskData| async move {
        let millis = data.as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(json!(millis))
    })
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Waits until every worker node of `pool` answered its handshake.
pub async fn wait_for_ready_nodes(pool: &ThreadPool) {
    let ready = wait_until(
        || {
            let nodes = pool.worker_nodes();
            !nodes.is_empty() && nodes.iter().all(|node| node.ready)
        },
        DEFAULT_WAIT_TIME,
    )
    .await;
    assert!(ready, "worker nodes did not become ready");
}
