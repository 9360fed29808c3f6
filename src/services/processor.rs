//! Drives one job through the report pipeline.
//!
//! The processor is the only writer for a job after it has been dequeued. Each
//! step's result is written to the store before the next step starts, and every
//! failure (explicit error, panic, storage fault) ends with the job in a
//! terminal state or a logged fallback.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::models::job::{JobRecord, JobState, JobUpdate};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::pipeline::{PipelineContext, PipelineStep, StepError};

/// Step name recorded when finalization fails.
const FINALIZE_STEP: &str = "finalize";

const EVENT_CAPACITY: usize = 64;

/// Notification sent after a step's output has been stored.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Completed {
        job_id: String,
        step: String,
        output_key: String,
        partial: bool,
        elapsed: Duration,
    },
}

/// Fields written by the completing update.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Artifacts {
    pub result: Value,
    pub download_url: Option<String>,
    pub lead_id: Option<String>,
}

/// Turns the finished pipeline context into the job's final artifacts.
#[async_trait]
pub trait ReportFinalizer: Send + Sync {
    async fn finalize(&self, ctx: &PipelineContext) -> Result<Artifacts, StepError>;
}

/// Uses `report_data` as the result and points the download link at the renderer.
pub struct LinkFinalizer {
    download_base_url: String,
}

impl LinkFinalizer {
    pub fn new(download_base_url: impl Into<String>) -> Self {
        Self {
            download_base_url: download_base_url.into(),
        }
    }
}

#[async_trait]
impl ReportFinalizer for LinkFinalizer {
    async fn finalize(&self, ctx: &PipelineContext) -> Result<Artifacts, StepError> {
        let result = ctx
            .output("report_data")
            .cloned()
            .ok_or_else(|| StepError::failed("Report data is missing."))?;

        let lead_id = ctx
            .input
            .get("lead_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Artifacts {
            result,
            download_url: Some(format!(
                "{}/{}/download",
                self.download_base_url.trim_end_matches('/'),
                ctx.job_id
            )),
            lead_id,
        })
    }
}

/// How a processed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed {
        step: String,
        message: String,
        code: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    steps: Vec<Arc<dyn PipelineStep>>,
    finalizer: Arc<dyn ReportFinalizer>,
    events: broadcast::Sender<StepEvent>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        steps: Vec<Arc<dyn PipelineStep>>,
        finalizer: Arc<dyn ReportFinalizer>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            steps,
            finalizer,
            events,
        }
    }

    /// Listen for step completions. Slow receivers miss events; the store stays authoritative.
    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.events.subscribe()
    }

    pub fn steps(&self) -> &[Arc<dyn PipelineStep>] {
        &self.steps
    }

    pub async fn process_job(&self, job_id: &str) -> Result<JobOutcome, ProcessError> {
        let record = self
            .store
            .get_status(job_id)
            .await?
            .ok_or_else(|| ProcessError::NotFound(job_id.to_string()))?;

        if record.state.is_terminal() {
            tracing::warn!(job_id, state = %record.state, "Job already finished, skipping");
            return Ok(outcome_of(&record));
        }

        let total = self.steps.len();
        self.write(
            job_id,
            JobUpdate::processing().message("Processing started").progress(0),
        )
        .await?;

        let mut ctx = PipelineContext::from_payload(job_id, &record.payload);

        for (index, step) in self.steps.iter().enumerate() {
            let name = step.name().to_string();
            self.write(
                job_id,
                JobUpdate::processing().step(&name).message(step.description()),
            )
            .await?;

            let started = Instant::now();
            let result = AssertUnwindSafe(step.run(&ctx)).catch_unwind().await;
            let elapsed = started.elapsed();
            metrics::histogram!("report_step_seconds", "step" => name.clone())
                .record(elapsed.as_secs_f64());

            let output = match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return self.fail(job_id, &name, e.to_string(), e.code()).await,
                Err(panic) => {
                    return self
                        .fail(job_id, &name, panic_message(panic.as_ref()), "panic")
                        .await
                }
            };

            let mut update = JobUpdate::processing()
                .step(&name)
                .message(format!("{name} completed"))
                .progress(step_progress(index + 1, total))
                .merge(step.output_key(), output.value.clone());
            if let Some(reason) = &output.partial {
                update = update.warning(reason.clone());
            }
            for alert in &output.alerts {
                update = update.warning(format!("{name}: {alert}"));
            }
            self.write(job_id, update).await?;

            ctx.record(step.output_key(), output.value);
            tracing::info!(
                job_id,
                step = %name,
                elapsed_ms = elapsed.as_millis() as u64,
                partial = output.partial.is_some(),
                "Step completed"
            );

            // No subscribers is fine.
            let _ = self.events.send(StepEvent::Completed {
                job_id: job_id.to_string(),
                step: name,
                output_key: step.output_key().to_string(),
                partial: output.partial.is_some(),
                elapsed,
            });
        }

        let artifacts = match AssertUnwindSafe(self.finalizer.finalize(&ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(artifacts)) => artifacts,
            Ok(Err(e)) => return self.fail(job_id, FINALIZE_STEP, e.to_string(), e.code()).await,
            Err(panic) => {
                return self
                    .fail(job_id, FINALIZE_STEP, panic_message(panic.as_ref()), "panic")
                    .await
            }
        };

        let mut done = JobUpdate::new(JobState::Completed)
            .message("Report ready")
            .progress(100);
        done.result = Some(artifacts.result);
        done.download_url = artifacts.download_url;
        done.lead_id = artifacts.lead_id;
        self.write(job_id, done).await?;

        metrics::counter!("report_jobs_completed").increment(1);
        tracing::info!(job_id, steps = total, "Job completed");
        Ok(JobOutcome::Completed)
    }

    async fn fail(
        &self,
        job_id: &str,
        step: &str,
        message: String,
        code: &str,
    ) -> Result<JobOutcome, ProcessError> {
        tracing::error!(job_id, step, code, error = %message, "Pipeline step failed");
        metrics::counter!("report_jobs_failed", "code" => code.to_string()).increment(1);

        self.write(job_id, JobUpdate::failed(message.clone(), code).step(step))
            .await?;

        Ok(JobOutcome::Failed {
            step: step.to_string(),
            message,
            code: code.to_string(),
        })
    }

    /// Write `update`; on failure try once to leave the job in `error`.
    async fn write(&self, job_id: &str, update: JobUpdate) -> Result<JobRecord, ProcessError> {
        match self.store.update_status(job_id, update).await {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to save job state");
                let fallback = JobUpdate::failed(
                    "Report generation failed while saving progress.",
                    "storage_error",
                );
                if let Err(fallback_err) = self.store.update_status(job_id, fallback).await {
                    tracing::error!(
                        job_id,
                        error = %fallback_err,
                        "Failed to mark job as failed after storage error"
                    );
                }
                metrics::counter!("report_jobs_failed", "code" => "storage_error").increment(1);
                Err(ProcessError::Store(e))
            }
        }
    }
}

/// Progress after `done` of `total` steps; 100 is reserved for completion.
fn step_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done * 100 / total).min(99)) as u8
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "Unexpected failure in pipeline step".to_string()
    }
}

fn outcome_of(record: &JobRecord) -> JobOutcome {
    match record.state {
        JobState::Error => JobOutcome::Failed {
            step: record.step.clone().unwrap_or_default(),
            message: record.message.clone().unwrap_or_default(),
            code: record.code.clone().unwrap_or_default(),
        },
        _ => JobOutcome::Completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_progress() {
        assert_eq!(step_progress(1, 6), 16);
        assert_eq!(step_progress(3, 6), 50);
        assert_eq!(step_progress(6, 6), 99);
        assert_eq!(step_progress(0, 0), 0);
    }

    #[test]
    fn test_panic_message_payloads() {
        let boxed: Box<dyn Any + Send> = Box::new("Explosion");
        assert_eq!(panic_message(boxed.as_ref()), "Explosion");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("Explosion"));
        assert_eq!(panic_message(boxed.as_ref()), "Explosion");

        let boxed: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(boxed.as_ref()), "Unexpected failure in pipeline step");
    }

    #[tokio::test]
    async fn test_link_finalizer() {
        let mut ctx = PipelineContext::new("job-9", json!({"company_name": "Acme", "lead_id": "lead-1"}));
        ctx.record("report_data", json!({"executive_summary": "ok"}));

        let artifacts = LinkFinalizer::new("/api/v1/reports/").finalize(&ctx).await.unwrap();
        assert_eq!(artifacts.result, json!({"executive_summary": "ok"}));
        assert_eq!(artifacts.download_url.as_deref(), Some("/api/v1/reports/job-9/download"));
        assert_eq!(artifacts.lead_id.as_deref(), Some("lead-1"));
    }

    #[test]
    fn test_link_finalizer_requires_report_data() {
        let ctx = PipelineContext::new("job-9", json!({}));
        let err = tokio_test::assert_err!(tokio_test::block_on(
            LinkFinalizer::new("/r").finalize(&ctx)
        ));
        assert_eq!(err.code(), "step_failed");
    }
}
