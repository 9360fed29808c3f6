//! Job state persistence.
//!
//! `JobStore` is the only shared mutable state in the pipeline: every change to
//! a job record goes through `enqueue` or `update_status`, and each call is
//! applied atomically with respect to readers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::job::{JobRecord, JobState, JobUpdate, TransitionError};

/// Retention windows for job records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Retention {
    /// How long terminal jobs are kept.
    pub terminal: Duration,
    /// Absolute ceiling for any job, including stuck ones.
    pub max_age: Duration,
    /// Minimum gap between opportunistic sweeps triggered by reads.
    pub cleanup_interval: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            terminal: Duration::from_secs(4 * 60 * 60),
            max_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl Retention {
    pub fn terminal_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.terminal).unwrap_or(chrono::Duration::MAX)
    }

    pub fn max_age_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {job_id} is already {state} and can no longer change")]
    Terminal { job_id: String, state: JobState },

    #[error("Invalid state change for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: String, reason: String },

    #[error("Job store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn from_transition(job_id: &str, err: TransitionError) -> Self {
        match err {
            TransitionError::Terminal(state) => StoreError::Terminal {
                job_id: job_id.to_string(),
                state,
            },
            TransitionError::Backwards { from, to } => StoreError::InvalidTransition {
                job_id: job_id.to_string(),
                from,
                to,
            },
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `queued` job holding `initial` as its payload and return its id.
    async fn enqueue(&self, initial: Map<String, Value>) -> Result<String, StoreError>;

    /// Apply `update` atomically and return the resulting record.
    async fn update_status(&self, job_id: &str, update: JobUpdate) -> Result<JobRecord, StoreError>;

    /// Read a job. May sweep expired jobs first; never changes the job being read.
    async fn get_status(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Remove expired jobs and return how many were removed.
    async fn cleanup(&self) -> Result<usize, StoreError>;
}

pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// In-process job store for single-node deployments and tests.
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
    retention: Retention,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
    clock: Clock,
}

impl MemoryJobStore {
    pub fn new(retention: Retention) -> Self {
        Self::with_clock(retention, Arc::new(Utc::now))
    }

    /// Use `clock` instead of the wall clock for timestamps and expiry.
    pub fn with_clock(retention: Retention, clock: Clock) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
            last_sweep: Mutex::new(None),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let terminal = self.retention.terminal_chrono();
        let max_age = self.retention.max_age_chrono();

        let mut jobs = self.jobs.write().map_err(|_| StoreError::Poisoned)?;
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_expired(now, terminal, max_age));
        let removed = before - jobs.len();

        if removed > 0 {
            tracing::info!(removed, remaining = jobs.len(), "Removed expired jobs");
        }
        Ok(removed)
    }

    /// Sweep at most once per cleanup interval.
    fn maybe_sweep(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let interval = chrono::Duration::from_std(self.retention.cleanup_interval)
            .unwrap_or(chrono::Duration::MAX);
        {
            let mut last = self.last_sweep.lock().map_err(|_| StoreError::Poisoned)?;
            if (*last).is_some_and(|at| now - at < interval) {
                return Ok(());
            }
            *last = Some(now);
        }
        self.sweep(now).map(|_| ())
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new(Retention::default())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, initial: Map<String, Value>) -> Result<String, StoreError> {
        let job_id = new_job_id();
        let record = JobRecord::new(job_id.clone(), initial, (self.clock)());

        self.jobs
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(job_id.clone(), record);

        tracing::debug!(job_id = %job_id, "Job enqueued");
        Ok(job_id)
    }

    async fn update_status(&self, job_id: &str, update: JobUpdate) -> Result<JobRecord, StoreError> {
        let now = (self.clock)();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::Poisoned)?;
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        // Apply to a copy so a rejected update leaves nothing half-written.
        let mut next = record.clone();
        next.apply(update, now)
            .map_err(|e| StoreError::from_transition(job_id, e))?;
        *record = next.clone();
        Ok(next)
    }

    async fn get_status(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.maybe_sweep((self.clock)())?;
        let jobs = self.jobs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(jobs.get(job_id).cloned())
    }

    async fn cleanup(&self) -> Result<usize, StoreError> {
        self.sweep((self.clock)())
    }
}
