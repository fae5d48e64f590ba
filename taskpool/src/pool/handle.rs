use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use taskpool_api::errors::PoolError;
use taskpool_api::task::TaskData;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Pending result of a submitted task.
///
/// Resolves once the worker answers, or with an error when the task can no
/// longer complete. Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: Uuid,
    receiver: oneshot::Receiver<Result<TaskData, PoolError>>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: Uuid, receiver: oneshot::Receiver<Result<TaskData, PoolError>>) -> Self {
        Self { task_id, receiver }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

impl Future for TaskHandle {
    type Output = Result<TaskData, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::ResponseChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handle_resolves_with_response() {
        let (sender, receiver) = oneshot::channel();
        let handle = TaskHandle::new(Uuid::new_v4(), receiver);
        sender.send(Ok(json!("done"))).unwrap();
        assert_eq!(handle.await.unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn test_dropped_sender_closes_handle() {
        let (sender, receiver) = oneshot::channel();
        let handle = TaskHandle::new(Uuid::new_v4(), receiver);
        drop(sender);
        assert!(matches!(handle.await, Err(PoolError::ResponseChannelClosed)));
    }
}
