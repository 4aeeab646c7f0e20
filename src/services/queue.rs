use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

const WAKE_KEY: &str = "photo_search:wake";

/// Reconnection attempts before an operation reports Redis as unavailable.
/// Callers then fall back to polling.
const CONNECT_RETRIES: usize = 1;

/// Upper bound on buffered wake-ups; idle workers only need to know that
/// something arrived.
const MAX_PENDING_WAKEUPS: isize = 1024;

/// Redis list used to wake idle dispatchers as soon as a job is submitted.
///
/// Purely a latency optimisation: the job row is the source of truth and
/// dispatchers still claim through the job store.
///
/// One managed connection is opened on first use and shared by every call;
/// it reconnects on its own after Redis restarts.
pub struct JobNotifier {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
}

impl JobNotifier {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, QueueError> {
        self.connection
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new().set_number_of_retries(CONNECT_RETRIES);
                ConnectionManager::new_with_config(self.client.clone(), config)
                    .await
                    .map_err(QueueError::Redis)
            })
            .await
            .cloned()
    }

    /// Announce a newly submitted job.
    pub async fn notify(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(WAKE_KEY, job_id.to_string())
            .await
            .map_err(QueueError::Redis)?;
        conn.ltrim::<_, ()>(WAKE_KEY, 0, MAX_PENDING_WAKEUPS - 1)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Block for up to `timeout` waiting for a wake-up.
    /// Returns `true` if one arrived.
    pub async fn wait(&self, timeout: Duration) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let popped: Option<(String, String)> = conn
            .brpop(WAKE_KEY, timeout.as_secs_f64())
            .await
            .map_err(QueueError::Redis)?;
        Ok(popped.is_some())
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    #[cfg(test)]
    fn is_connected(&self) -> bool {
        self.connection.initialized()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
