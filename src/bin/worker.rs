use std::sync::Arc;
use std::time::Duration;

use bizcase_report::{
    config::AppConfig,
    services::{
        job_store::JobStore,
        llm_client::LlmClient,
        pipeline::{report_pipeline, LlmSettings},
        processor::{JobOutcome, JobProcessor, LinkFinalizer, ProcessError, StepEvent},
        queue::JobQueue,
        redis_store::RedisJobStore,
    },
};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting report worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    tracing::info!("Initializing services");
    let store: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::new(&config.redis_url, config.retention())
            .expect("Failed to initialize job store"),
    );
    let queue = Arc::new(JobQueue::new(&config.redis_url).expect("Failed to initialize job queue"));

    // Entries left claimed by a crashed worker go back on the queue.
    let reclaimer = queue.clone();
    let reclaim_after = Duration::from_secs(config.queue_reclaim_after_secs);
    let reclaim_every = config.retention().cleanup_interval.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reclaim_every);
        loop {
            ticker.tick().await;
            match reclaimer.reclaim(reclaim_after).await {
                Ok(0) => {}
                Ok(moved) => {
                    metrics::counter!("report_jobs_reclaimed").increment(moved);
                    tracing::warn!(moved, "Requeued abandoned report jobs");
                }
                Err(e) => tracing::warn!(error = %e, "Queue reclaim failed"),
            }
        }
    });

    let llm = LlmClient::from_config(&config).expect("Failed to initialize LLM client");
    if config.llm_api_key.is_none() {
        tracing::warn!("LLM_API_KEY is not set; every job will fail with no_api_key");
    }

    let steps = report_pipeline(Arc::new(llm), LlmSettings::from_config(&config));
    let finalizer = Arc::new(LinkFinalizer::new(config.download_base_url.clone()));
    let processor = JobProcessor::new(store, steps, finalizer);

    let mut events = processor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StepEvent::Completed { job_id, step, partial, elapsed, .. }) => {
                    tracing::debug!(
                        job_id = %job_id,
                        step = %step,
                        partial,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Step event"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Step event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(steps = processor.steps().len(), "Worker ready, starting job processing loop");

    // Main processing loop
    loop {
        match process_next_job(&queue, &processor).await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Process the next job from the queue.
/// Returns Ok(true) if a job was processed, Ok(false) if no job available.
async fn process_next_job(
    queue: &JobQueue,
    processor: &JobProcessor,
) -> Result<bool, Box<dyn std::error::Error>> {
    let job = match queue.dequeue().await? {
        Some(j) => j,
        None => return Ok(false),
    };

    tracing::info!(job_id = %job.job_id, enqueued_at = %job.enqueued_at, "Processing report job");

    // Failed jobs are terminal; they leave the processing list either way.
    let result = processor.process_job(&job.job_id).await;
    queue.complete(&job).await?;

    match result {
        Ok(JobOutcome::Completed) => {
            tracing::info!(job_id = %job.job_id, "Job completed successfully");
        }
        Ok(JobOutcome::Failed { step, code, .. }) => {
            tracing::warn!(job_id = %job.job_id, step = %step, code = %code, "Job failed");
        }
        Err(ProcessError::NotFound(_)) => {
            tracing::warn!(job_id = %job.job_id, "Job expired before it was processed");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(true)
}
