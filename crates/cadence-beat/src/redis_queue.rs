use async_trait::async_trait;
use cadence_scheduler::{JobMessage, JobQueue, QueueError};
use redis::AsyncCommands;

/// [`JobQueue`] that LPUSHes JSON-encoded jobs onto a Redis list.
///
/// `ConnectionManager` reconnects on its own; a failed push surfaces as
/// [`QueueError::Unavailable`] and the scheduler retries on a later wake.
pub struct RedisQueue {
    conn: redis::aio::ConnectionManager,
    key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, key: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn name(&self) -> &str {
        "redis"
    }

    async fn enqueue(&self, job: &JobMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .lpush(&self.key, payload)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
