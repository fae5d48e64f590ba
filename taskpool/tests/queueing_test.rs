// Integration tests for worker node task queues

mod test_helpers;

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use taskpool::{PoolOptions, TasksQueueOptions, ThreadPool, ThreadWorker, WorkerOptions};
use taskpool_api::{
    PoolError, PoolEvent, PoolEventKind, TaskData, TaskFunction, TaskFunctionEntry,
    WorkerChoiceStrategyKind,
};
use test_helpers::*;

fn queue_options(concurrency: usize, size: Option<usize>) -> PoolOptions {
    PoolOptions {
        enable_tasks_queue: true,
        tasks_queue_options: TasksQueueOptions {
            concurrency,
            size,
            ..TasksQueueOptions::default()
        },
        ..PoolOptions::default()
    }
}

#[tokio::test]
async fn test_queue_respects_concurrency() {
    let number_of_threads = 3;
    let concurrency = 2;
    let pool = ThreadPool::fixed(
        number_of_threads,
        sleep_worker(300, WorkerOptions::default()),
        queue_options(concurrency, None),
    )
    .unwrap();
    wait_for_ready_nodes(&pool).await;

    let handles: Vec<_> = (0..number_of_threads * (concurrency + 1))
        .map(|i| pool.execute(json!(i), None).unwrap())
        .collect();
    for node in pool.worker_nodes() {
        assert_eq!(node.tasks.executing, concurrency);
        assert_eq!(node.tasks.queued, 1);
        assert_eq!(node.tasks.executed, 0);
    }
    let info = pool.info();
    assert_eq!(info.executing_tasks, number_of_threads * concurrency);
    assert_eq!(info.queued_tasks, number_of_threads);

    for handle in handles {
        handle.await.unwrap();
    }
    let info = pool.info();
    assert_eq!(info.executed_tasks, number_of_threads * (concurrency + 1));
    assert_eq!(info.queued_tasks, 0);
    for node in pool.worker_nodes() {
        assert_eq!(node.tasks.max_queued, 1);
    }
    pool.destroy().await.unwrap();
}

#[tokio::test]
async fn test_back_pressure_rejects_submissions() {
    let number_of_threads = 2;
    let pool = ThreadPool::fixed(
        number_of_threads,
        sleep_worker(300, WorkerOptions::default()),
        queue_options(1, Some(1)),
    )
    .unwrap();
    wait_for_ready_nodes(&pool).await;
    let pressured = Arc::new(Mutex::new(Vec::new()));
    let listener_pressured = Arc::clone(&pressured);
    pool.on(PoolEventKind::BackPressure, move |event| {
        if let PoolEvent::BackPressure { worker_id, .. } = event {
            listener_pressured.lock().unwrap().push(*worker_id);
        }
    });

    let handles: Vec<_> = (0..number_of_threads * 2)
        .map(|i| pool.execute(json!(i), None).unwrap())
        .collect();
    assert_eq!(pressured.lock().unwrap().len(), number_of_threads);
    assert!(pool.info().back_pressure);
    assert!(pool.worker_nodes().iter().all(|node| node.back_pressure));
    assert!(matches!(
        pool.execute(json!("rejected"), None),
        Err(PoolError::BackPressure)
    ));

    for handle in handles {
        handle.await.unwrap();
    }
    assert!(!pool.info().back_pressure);
    pool.execute(json!("accepted"), None).unwrap().await.unwrap();
    pool.destroy().await.unwrap();
}

#[tokio::test]
async fn test_queued_tasks_run_by_priority() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let record = |label: &'static str| {
        let order = Arc::clone(&order);
        TaskFunction::from_sync(move |data: TaskData| {
            order.lock().unwrap().push(format!("{}-{}", label, data));
            Ok(data)
        })
    };
    let worker = ThreadWorker::new(
        [
            ("block", TaskFunctionEntry::from(sleep_function(200))),
            ("low", TaskFunctionEntry::new(record("low")).with_priority(10)),
            ("high", TaskFunctionEntry::new(record("high")).with_priority(-10)),
        ],
        WorkerOptions::default(),
    )
    .unwrap();
    let pool = ThreadPool::fixed(1, worker, queue_options(1, None)).unwrap();
    wait_for_ready_nodes(&pool).await;

    let handles = vec![
        pool.execute(json!(0), Some("block")).unwrap(),
        pool.execute(json!(1), Some("low")).unwrap(),
        pool.execute(json!(2), Some("low")).unwrap(),
        pool.execute(json!(3), Some("high")).unwrap(),
    ];
    assert_eq!(pool.info().queued_tasks, 3);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["high-3", "low-1", "low-2"]);
    pool.destroy().await.unwrap();
}

#[tokio::test]
async fn test_idle_worker_node_steals_queued_task() {
    let worker = ThreadWorker::from_fn(sleep_for_input(), WorkerOptions::default()).unwrap();
    let pool = ThreadPool::fixed(2, worker, queue_options(1, None)).unwrap();
    wait_for_ready_nodes(&pool).await;

    // Round robin: 400 and the third task land on node 0, the short ones on node 1
    let handles: Vec<_> = [400, 10, 10, 10]
        .into_iter()
        .map(|millis| pool.execute(json!(millis), None).unwrap())
        .collect();
    let nodes = pool.worker_nodes();
    assert_eq!(nodes[0].tasks.queued, 1);
    assert_eq!(nodes[1].tasks.queued, 1);

    for handle in handles {
        handle.await.unwrap();
    }
    let nodes = pool.worker_nodes();
    assert_eq!(nodes[1].tasks.stolen, 1);
    assert_eq!(nodes[1].tasks.executed, 3);
    assert_eq!(nodes[0].tasks.executed, 1);
    assert_eq!(pool.info().stolen_tasks, 1);
    pool.destroy().await.unwrap();
}

#[tokio::test]
async fn test_destroy_drains_queued_tasks() {
    let pool = ThreadPool::fixed(
        1,
        sleep_worker(50, WorkerOptions::default()),
        queue_options(1, None),
    )
    .unwrap();
    wait_for_ready_nodes(&pool).await;
    let completed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|i| pool.execute(json!(i), None).unwrap())
        .collect();
    assert_eq!(pool.info().queued_tasks, 2);
    pool.destroy().await.unwrap();

    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .is_ok_and(|result| result.is_ok())
        {
            completed.fetch_add(1, Ordering::SeqCst);
        }
    }
    assert_eq!(completed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_least_busy_routes_by_recorded_run_time() {
    let worker = ThreadWorker::from_fn(sleep_for_input(), WorkerOptions::default()).unwrap();
    let options = PoolOptions {
        worker_choice_strategy: WorkerChoiceStrategyKind::LeastBusy,
        ..PoolOptions::default()
    };
    let pool = ThreadPool::fixed(2, worker, options).unwrap();
    wait_for_ready_nodes(&pool).await;

    // Both nodes are unmeasured: the lowest key wins
    pool.execute(json!(200), None).unwrap().await.unwrap();
    let nodes = pool.worker_nodes();
    assert_eq!(nodes[0].tasks.executed, 1);
    assert_eq!(nodes[0].run_time.samples, 1);
    assert!(nodes[0].run_time.average.is_some_and(|average| average >= 150.0));
    assert_eq!(nodes[1].run_time.samples, 0);

    for _ in 0..3 {
        pool.execute(json!(5), None).unwrap().await.unwrap();
    }
    let nodes = pool.worker_nodes();
    assert_eq!(nodes[0].tasks.executed, 1);
    assert_eq!(nodes[1].tasks.executed, 3);
    assert_eq!(nodes[1].run_time.samples, 3);
    assert_eq!(pool.info().strategy, WorkerChoiceStrategyKind::LeastBusy);
    pool.destroy().await.unwrap();
}
