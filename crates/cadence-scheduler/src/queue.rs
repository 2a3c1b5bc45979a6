use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::JobMessage;

/// Errors returned by a [`JobQueue`] hand-off.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is reachable but refused the job (e.g. full).
    #[error("Job rejected: {0}")]
    Rejected(String),

    /// The queue could not be reached.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// The consuming side has gone away.
    #[error("Queue closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Hand-off point to the execution layer.
///
/// `enqueue` returns once the queue has acknowledged the job; it never waits
/// for the job itself to run.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Stable lowercase identifier (e.g. `"redis"`), used in logs.
    fn name(&self) -> &str;

    async fn enqueue(&self, job: &JobMessage) -> Result<(), QueueError>;

    /// Connectivity probe for readiness checks.
    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// In-process queue backed by a bounded Tokio channel.
///
/// `try_send` keeps the scheduler from ever blocking on a slow consumer: a
/// full channel is reported as a rejected hand-off and retried later.
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<JobMessage>,
}

impl ChannelQueue {
    /// Create a queue with room for `capacity` undelivered jobs.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    fn name(&self) -> &str {
        "channel"
    }

    async fn enqueue(&self, job: &JobMessage) -> Result<(), QueueError> {
        self.tx.try_send(job.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Rejected("channel full".to_string()),
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.tx.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn job(task: &str) -> JobMessage {
        JobMessage {
            id: Uuid::new_v4(),
            task: task.to_string(),
            args: json!([]),
            kwargs: json!({}),
            schedule: "test".to_string(),
            scheduled_for: Utc::now(),
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let (queue, mut rx) = ChannelQueue::new(4);
        queue.enqueue(&job("a")).await.unwrap();
        queue.enqueue(&job("b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().task, "a");
        assert_eq!(rx.recv().await.unwrap().task, "b");
    }

    #[tokio::test]
    async fn full_channel_rejects_instead_of_blocking() {
        let (queue, _rx) = ChannelQueue::new(1);
        queue.enqueue(&job("a")).await.unwrap();
        let err = queue.enqueue(&job("b")).await.unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));
    }

    #[tokio::test]
    async fn dropped_consumer_reports_closed() {
        let (queue, rx) = ChannelQueue::new(1);
        drop(rx);
        assert!(matches!(queue.enqueue(&job("a")).await, Err(QueueError::Closed)));
        assert!(queue.ping().await.is_err());
    }
}
