use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde_json::{Map, Value};

use crate::models::job::{JobRecord, JobState, JobUpdate};
use crate::services::job_store::{new_job_id, JobStore, Retention, StoreError};

const JOB_KEY_PREFIX: &str = "bizcase:job:";
const INDEX_KEY: &str = "bizcase:jobs";
const PAYLOAD_PREFIX: &str = "p:";
const WARNING_PREFIX: &str = "w:";
const CLEANUP_BATCH: isize = 100;

/// Applies one update to a job hash: rejects writes to terminal jobs and
/// backwards transitions, sets fields, appends warnings, refreshes the TTL.
///
/// ARGV: new state, ttl seconds (0 keeps the current TTL), number of field
/// pairs, the pairs, then any warnings.
const UPDATE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'state')
if not current then
  return {0, ''}
end
if current == 'completed' or current == 'error' then
  return {-1, current}
end
local rank = {queued = 0, processing = 1, completed = 2, error = 2}
if rank[ARGV[1]] < rank[current] then
  return {-2, current}
end
local pair_count = tonumber(ARGV[3])
local last = 3 + pair_count * 2
if pair_count > 0 then
  redis.call('HSET', KEYS[1], unpack(ARGV, 4, last))
end
for i = last + 1, #ARGV do
  local n = redis.call('HINCRBY', KEYS[1], 'warning_count', 1)
  redis.call('HSET', KEYS[1], 'w:' .. n, ARGV[i])
end
local ttl = tonumber(ARGV[2])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return {1, current}
"#;

/// Redis-backed job store shared by the API and worker processes.
pub struct RedisJobStore {
    client: redis::Client,
    retention: Retention,
    update_script: redis::Script,
    last_sweep: Mutex<Option<Instant>>,
}

impl RedisJobStore {
    pub fn new(redis_url: &str, retention: Retention) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            retention,
            update_script: redis::Script::new(UPDATE_SCRIPT),
            last_sweep: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn fetch(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &str,
    ) -> Result<Option<JobRecord>, StoreError> {
        let fields: HashMap<String, String> = conn.hgetall(job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(job_id, fields).map(Some)
    }

    fn sweep_due(&self) -> bool {
        let Ok(mut last) = self.last_sweep.lock() else {
            return false;
        };
        if (*last).is_some_and(|at| at.elapsed() < self.retention.cleanup_interval) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }
}

fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

fn ttl_secs(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX).max(1)
}

/// Hash fields written for an update, excluding warnings.
pub fn update_fields(
    update: &JobUpdate,
    now: DateTime<Utc>,
) -> Result<Vec<(String, String)>, serde_json::Error> {
    let mut fields = vec![
        ("state".to_string(), update.state.to_string()),
        ("updated".to_string(), now.to_rfc3339()),
    ];
    if let Some(step) = &update.step {
        fields.push(("step".to_string(), step.clone()));
    }
    if let Some(message) = &update.message {
        fields.push(("message".to_string(), message.clone()));
    }
    if let Some(code) = &update.code {
        fields.push(("code".to_string(), code.clone()));
    }
    if let Some(progress) = update.progress {
        fields.push(("progress".to_string(), progress.min(100).to_string()));
    }
    for (key, value) in &update.payload {
        fields.push((format!("{PAYLOAD_PREFIX}{key}"), serde_json::to_string(value)?));
    }
    if let Some(result) = &update.result {
        fields.push(("result".to_string(), serde_json::to_string(result)?));
    }
    if let Some(url) = &update.download_url {
        fields.push(("download_url".to_string(), url.clone()));
    }
    if let Some(lead_id) = &update.lead_id {
        fields.push(("lead_id".to_string(), lead_id.clone()));
    }
    Ok(fields)
}

/// Rebuild a record from its hash fields.
pub fn record_from_fields(
    job_id: &str,
    mut fields: HashMap<String, String>,
) -> Result<JobRecord, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        job_id: job_id.to_string(),
        reason,
    };
    let timestamp = |raw: Option<String>, name: &str| -> Result<DateTime<Utc>, StoreError> {
        let raw = raw.ok_or_else(|| corrupt(format!("missing {name}")))?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("bad {name}: {e}")))
    };

    let state: JobState = fields
        .remove("state")
        .ok_or_else(|| corrupt("missing state".to_string()))?
        .parse::<JobState>()
        .map_err(|e| corrupt(format!("bad state: {e}")))?;
    let created = timestamp(fields.remove("created"), "created")?;
    let updated = timestamp(fields.remove("updated"), "updated")?;
    let progress = fields
        .remove("progress")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    let result = fields
        .remove("result")
        .map(|r| serde_json::from_str(&r))
        .transpose()?;

    let mut payload = Map::new();
    let mut warnings: Vec<(u64, String)> = Vec::new();
    let mut rest = HashMap::new();
    for (field, value) in fields {
        if let Some(key) = field.strip_prefix(PAYLOAD_PREFIX) {
            payload.insert(key.to_string(), serde_json::from_str::<Value>(&value)?);
        } else if let Some(n) = field.strip_prefix(WARNING_PREFIX) {
            warnings.push((n.parse().unwrap_or(u64::MAX), value));
        } else {
            rest.insert(field, value);
        }
    }
    warnings.sort_by_key(|(n, _)| *n);

    Ok(JobRecord {
        job_id: job_id.to_string(),
        state,
        step: rest.remove("step"),
        payload,
        message: rest.remove("message"),
        code: rest.remove("code"),
        progress,
        warnings: warnings.into_iter().map(|(_, w)| w).collect(),
        created,
        updated,
        result,
        download_url: rest.remove("download_url"),
        lead_id: rest.remove("lead_id"),
    })
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, initial: Map<String, Value>) -> Result<String, StoreError> {
        let job_id = new_job_id();
        let now = Utc::now();
        let record = JobRecord::new(job_id.clone(), initial, now);

        let mut fields = vec![
            ("state".to_string(), record.state.to_string()),
            ("created".to_string(), now.to_rfc3339()),
            ("updated".to_string(), now.to_rfc3339()),
            ("progress".to_string(), "0".to_string()),
        ];
        if let Some(message) = &record.message {
            fields.push(("message".to_string(), message.clone()));
        }
        for (key, value) in &record.payload {
            fields.push((format!("{PAYLOAD_PREFIX}{key}"), serde_json::to_string(value)?));
        }

        let key = job_key(&job_id);
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .hset_multiple(&key, fields.as_slice())
            .ignore()
            .expire(&key, ttl_secs(self.retention.max_age))
            .ignore()
            .zadd(INDEX_KEY, &job_id, now.timestamp())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::debug!(job_id = %job_id, "Job enqueued");
        Ok(job_id)
    }

    async fn update_status(&self, job_id: &str, update: JobUpdate) -> Result<JobRecord, StoreError> {
        let fields = update_fields(&update, Utc::now())?;
        let ttl = if update.state.is_terminal() {
            ttl_secs(self.retention.terminal)
        } else {
            0
        };

        let mut invocation = self.update_script.key(job_key(job_id));
        invocation
            .arg(update.state.to_string())
            .arg(ttl)
            .arg(fields.len());
        for (field, value) in &fields {
            invocation.arg(field).arg(value);
        }
        for warning in &update.warnings {
            invocation.arg(warning);
        }

        let mut conn = self.connection().await?;
        let (outcome, current): (i64, String) = invocation.invoke_async(&mut conn).await?;
        match outcome {
            1 => {}
            0 => return Err(StoreError::NotFound(job_id.to_string())),
            -1 => {
                return Err(StoreError::Terminal {
                    job_id: job_id.to_string(),
                    state: current.parse().unwrap_or(JobState::Error),
                })
            }
            _ => {
                return Err(StoreError::InvalidTransition {
                    job_id: job_id.to_string(),
                    from: current.parse().unwrap_or(JobState::Processing),
                    to: update.state,
                })
            }
        }

        self.fetch(&mut conn, job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn get_status(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        if self.sweep_due() {
            if let Err(e) = self.cleanup().await {
                tracing::warn!(error = %e, "Opportunistic job cleanup failed");
            }
        }
        let mut conn = self.connection().await?;
        self.fetch(&mut conn, job_id).await
    }

    async fn cleanup(&self) -> Result<usize, StoreError> {
        let mut conn = self.connection().await?;
        let cutoff = (Utc::now() - self.retention.max_age_chrono()).timestamp();

        // Past the absolute ceiling, whatever their state.
        let stale: Vec<String> = conn
            .zrangebyscore_limit(INDEX_KEY, "-inf", cutoff, 0, CLEANUP_BATCH)
            .await?;
        let mut removed = 0;
        for job_id in &stale {
            let deleted: usize = conn.del(job_key(job_id)).await?;
            removed += deleted;
            conn.zrem::<_, _, ()>(INDEX_KEY, job_id).await?;
        }

        // Index entries whose hash already expired through its TTL.
        let oldest: Vec<String> = conn.zrange(INDEX_KEY, 0, CLEANUP_BATCH - 1).await?;
        for job_id in &oldest {
            let exists: bool = conn.exists(job_key(job_id)).await?;
            if !exists {
                conn.zrem::<_, _, ()>(INDEX_KEY, job_id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Removed expired jobs");
        }
        Ok(removed)
    }
}
