use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Status of a report job in the async pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Error)
    }

    /// Position in the forward-only lifecycle. Both terminal states share a rank.
    pub fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Processing => 1,
            JobState::Completed | JobState::Error => 2,
        }
    }

    /// Whether a record in `self` may be moved to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

/// A report job as persisted in the job state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    pub step: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub message: Option<String>,
    /// Machine-readable failure code, set alongside `state == error`.
    pub code: Option<String>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,

    // Only present once completed
    pub result: Option<Value>,
    pub download_url: Option<String>,
    pub lead_id: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: String, payload: Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            state: JobState::Queued,
            step: None,
            payload,
            message: Some("Queued".to_string()),
            code: None,
            progress: 0,
            warnings: Vec::new(),
            created: now,
            updated: now,
            result: None,
            download_url: None,
            lead_id: None,
        }
    }

    /// Apply one update as a single unit. On error the record is left untouched.
    pub fn apply(&mut self, update: JobUpdate, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::Terminal(self.state));
        }
        if !self.state.can_transition_to(update.state) {
            return Err(TransitionError::Backwards {
                from: self.state,
                to: update.state,
            });
        }

        self.state = update.state;
        if let Some(step) = update.step {
            self.step = Some(step);
        }
        if let Some(message) = update.message {
            self.message = Some(message);
        }
        if let Some(code) = update.code {
            self.code = Some(code);
        }
        if let Some(progress) = update.progress {
            self.progress = progress.min(100);
        }
        for (key, value) in update.payload {
            self.payload.insert(key, value);
        }
        self.warnings.extend(update.warnings);
        if update.result.is_some() {
            self.result = update.result;
        }
        if update.download_url.is_some() {
            self.download_url = update.download_url;
        }
        if update.lead_id.is_some() {
            self.lead_id = update.lead_id;
        }
        self.updated = now;
        Ok(())
    }

    /// Whether cleanup should drop this record at `now`.
    pub fn is_expired(
        &self,
        now: DateTime<Utc>,
        retention: chrono::Duration,
        max_age: chrono::Duration,
    ) -> bool {
        let age = now - self.created;
        age > max_age || (self.state.is_terminal() && age > retention)
    }
}

/// A single atomic change to a job record.
///
/// `payload` is merged shallowly into the record's payload (last write wins per key);
/// every other `Some` field overwrites the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub state: JobState,
    pub step: Option<String>,
    pub message: Option<String>,
    pub code: Option<String>,
    pub progress: Option<u8>,
    pub payload: Map<String, Value>,
    pub warnings: Vec<String>,
    pub result: Option<Value>,
    pub download_url: Option<String>,
    pub lead_id: Option<String>,
}

impl JobUpdate {
    pub fn new(state: JobState) -> Self {
        Self {
            state,
            step: None,
            message: None,
            code: None,
            progress: None,
            payload: Map::new(),
            warnings: Vec::new(),
            result: None,
            download_url: None,
            lead_id: None,
        }
    }

    pub fn processing() -> Self {
        Self::new(JobState::Processing)
    }

    pub fn failed(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(JobState::Error).message(message).code(code)
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn merge(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("job is already {0}")]
    Terminal(JobState),

    #[error("cannot move job from {from} back to {to}")]
    Backwards { from: JobState, to: JobState },
}
