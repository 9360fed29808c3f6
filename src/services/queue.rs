use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

const QUEUE_KEY: &str = "bizcase:queue";
const PROCESSING_KEY: &str = "bizcase:processing";
/// Sorted set of in-flight entries scored by claim time (unix millis).
const CLAIMS_KEY: &str = "bizcase:claims";

/// KEYS: queue, processing, claims. ARGV: claim time.
const CLAIM_SCRIPT: &str = r#"
local payload = redis.call('RPOP', KEYS[1])
if not payload then
  return false
end
redis.call('LPUSH', KEYS[2], payload)
redis.call('ZADD', KEYS[3], ARGV[1], payload)
return payload
"#;

/// KEYS: queue, processing, claims. ARGV: cutoff. Returns the number requeued.
const RECLAIM_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
local moved = 0
for _, payload in ipairs(stale) do
  redis.call('ZREM', KEYS[3], payload)
  if redis.call('LREM', KEYS[2], 1, payload) > 0 then
    redis.call('RPUSH', KEYS[1], payload)
    moved = moved + 1
  end
end
return moved
"#;

/// Work item serialized into Redis; the job's state lives in the job store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedJob {
    pub job_id: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Redis-backed work queue handing each job id to exactly one worker.
///
/// A claimed entry sits in the processing list until `complete`; entries a
/// crashed worker never completed are put back by `reclaim`.
pub struct JobQueue {
    client: redis::Client,
    claim_script: redis::Script,
    reclaim_script: redis::Script,
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            claim_script: redis::Script::new(CLAIM_SCRIPT),
            reclaim_script: redis::Script::new(RECLAIM_SCRIPT),
        })
    }

    /// Push a job for the workers.
    pub async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Take the oldest job, moving it to the processing list so no other worker sees it.
    pub async fn dequeue(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let result: Option<String> = self
            .claim_script
            .key(QUEUE_KEY)
            .key(PROCESSING_KEY)
            .key(CLAIMS_KEY)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        match result {
            Some(payload) => {
                let job: QueuedJob = serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Requeue entries claimed more than `older_than` ago and never completed.
    ///
    /// Reclaimed jobs are picked up next and rerun from their first step.
    pub async fn reclaim(&self, older_than: Duration) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let moved: u64 = self
            .reclaim_script
            .key(QUEUE_KEY)
            .key(PROCESSING_KEY)
            .key(CLAIMS_KEY)
            .arg(reclaim_cutoff(Utc::now(), older_than))
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(moved)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    /// Get the current queue depth (pending jobs).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    /// Entries currently claimed by workers.
    pub async fn in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let count: u64 = conn.llen(PROCESSING_KEY).await.map_err(QueueError::Redis)?;
        Ok(count)
    }

    /// Drop a finished job from the processing list and its claim.
    pub async fn complete(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(QueueError::Redis)?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &payload)
            .ignore()
            .zrem(CLAIMS_KEY, &payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

/// Claim score at or below which an entry counts as stranded.
fn reclaim_cutoff(now: DateTime<Utc>, older_than: Duration) -> i64 {
    let age = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_sub(age)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaim_cutoff() {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let claimed = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis();

        // Claimed 15 minutes ago: stranded after 10, not after 20.
        assert!(claimed <= reclaim_cutoff(now, Duration::from_secs(600)));
        assert!(claimed > reclaim_cutoff(now, Duration::from_secs(1200)));
        assert_eq!(reclaim_cutoff(now, Duration::ZERO), now.timestamp_millis());
        assert!(reclaim_cutoff(now, Duration::MAX) < 0);
    }

    #[test]
    fn test_queued_job_payload_is_stable() {
        let job = QueuedJob::new("job-1");
        let payload = serde_json::to_string(&job).unwrap();
        let back: QueuedJob = serde_json::from_str(&payload).unwrap();
        // complete() and reclaim match entries by their exact serialized form.
        assert_eq!(serde_json::to_string(&back).unwrap(), payload);
    }
}
