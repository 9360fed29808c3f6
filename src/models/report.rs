use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::job::{JobRecord, JobState};

/// Input bundle for a business-case report (already sanitized by the form layer).
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReportRequest {
    #[garde(length(min = 1, max = 200))]
    pub company_name: String,

    #[garde(length(min = 1, max = 200))]
    pub industry: Option<String>,

    #[garde(length(max = 255))]
    pub website: Option<String>,

    #[garde(range(min = 1, max = 10_000_000))]
    pub employee_count: Option<u32>,

    #[garde(range(min = 0.0))]
    pub annual_revenue: Option<f64>,

    #[garde(length(min = 1, max = 2000))]
    pub pain_points: Option<String>,

    /// CRM lead this report belongs to, echoed back on completion.
    #[garde(length(min = 1, max = 100))]
    pub lead_id: Option<String>,

    /// Free-form answers collected by the form, passed through untouched.
    #[serde(default)]
    #[garde(skip)]
    pub answers: serde_json::Map<String, Value>,
}

/// Response after enqueueing a report job.
#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub job_id: String,
    pub status: String,
    pub message: String,
}

/// Status object returned to a polling client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusResponse {
    Queued {
        step: Option<String>,
        message: Option<String>,
        percent: u8,
    },
    Processing {
        step: Option<String>,
        message: Option<String>,
        percent: u8,
    },
    Completed {
        report_data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        lead_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        download_url: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl StatusResponse {
    pub fn not_found() -> Self {
        StatusResponse::Error {
            message: "Job not found.".to_string(),
            code: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusResponse::Completed { .. } | StatusResponse::Error { .. }
        )
    }
}

impl From<&JobRecord> for StatusResponse {
    fn from(record: &JobRecord) -> Self {
        match record.state {
            JobState::Queued => StatusResponse::Queued {
                step: record.step.clone(),
                message: record.message.clone(),
                percent: record.progress,
            },
            JobState::Processing => StatusResponse::Processing {
                step: record.step.clone(),
                message: record.message.clone(),
                percent: record.progress,
            },
            JobState::Completed => StatusResponse::Completed {
                report_data: record
                    .result
                    .clone()
                    .or_else(|| record.payload.get("report_data").cloned()),
                lead_id: record.lead_id.clone(),
                download_url: record.download_url.clone(),
                warnings: record.warnings.clone(),
            },
            JobState::Error => StatusResponse::Error {
                message: record
                    .message
                    .clone()
                    .unwrap_or_else(|| "Report generation failed.".to_string()),
                code: record.code.clone(),
            },
        }
    }
}
