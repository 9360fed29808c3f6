use std::time::Duration;

use serde::Deserialize;

use crate::services::job_store::Retention;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the job store and queue
    pub redis_url: String,

    /// Bearer token for the LLM API. Calls fail with `no_api_key` when unset.
    #[serde(default)]
    pub llm_api_key: Option<String>,

    #[serde(default = "default_llm_endpoint")]
    pub llm_endpoint: String,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    #[serde(default)]
    pub llm_reasoning_effort: Option<String>,

    #[serde(default)]
    pub llm_max_output_tokens: Option<u32>,

    #[serde(default = "default_llm_max_retries")]
    pub llm_max_retries: u32,

    /// Total time budget for one LLM call including retries
    #[serde(default = "default_llm_max_retry_time_secs")]
    pub llm_max_retry_time_secs: u64,

    #[serde(default = "default_llm_request_timeout_secs")]
    pub llm_request_timeout_secs: u64,

    #[serde(default = "default_llm_initial_backoff_ms")]
    pub llm_initial_backoff_ms: u64,

    #[serde(default = "default_llm_max_backoff_ms")]
    pub llm_max_backoff_ms: u64,

    /// How long finished jobs stay readable
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// Hard ceiling for any job record
    #[serde(default = "default_job_max_age_secs")]
    pub job_max_age_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Claimed queue entries older than this are treated as abandoned by a crashed worker
    #[serde(default = "default_queue_reclaim_after_secs")]
    pub queue_reclaim_after_secs: u64,

    /// Prefix for report download links
    #[serde(default = "default_download_base_url")]
    pub download_base_url: String,

    /// Keep raw LLM bodies on parsed responses (debugging only)
    #[serde(default)]
    pub keep_raw_responses: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1/responses".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_retries() -> u32 {
    3
}

fn default_llm_max_retry_time_secs() -> u64 {
    90
}

fn default_llm_request_timeout_secs() -> u64 {
    60
}

fn default_llm_initial_backoff_ms() -> u64 {
    500
}

fn default_llm_max_backoff_ms() -> u64 {
    8000
}

fn default_job_retention_secs() -> u64 {
    4 * 60 * 60
}

fn default_job_max_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_queue_reclaim_after_secs() -> u64 {
    15 * 60
}

fn default_download_base_url() -> String {
    "/api/v1/reports".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn retention(&self) -> Retention {
        Retention {
            terminal: Duration::from_secs(self.job_retention_secs),
            max_age: Duration::from_secs(self.job_max_age_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
        }
    }
}
