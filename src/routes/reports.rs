use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde_json::Map;

use crate::app_state::AppState;
use crate::models::job::JobUpdate;
use crate::models::report::{EnqueueResponse, ReportRequest, StatusResponse};
use crate::services::job_store::JobStore;
use crate::services::pipeline::INPUT_KEY;
use crate::services::queue::QueuedJob;

type ApiError = (StatusCode, Json<StatusResponse>);

fn api_error(status: StatusCode, message: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(StatusResponse::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }),
    )
}

/// POST /api/v1/reports — Accept a report request and queue it.
pub async fn submit_report(
    State(state): State<AppState>,
    Json(request): Json<ReportRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    request
        .validate()
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string(), "invalid_request"))?;

    let input = serde_json::to_value(&request).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialize report request");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Unable to accept request.", "internal")
    })?;
    let mut payload = Map::new();
    payload.insert(INPUT_KEY.to_string(), input);

    let job_id = state.store.enqueue(payload).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to create job");
        api_error(StatusCode::SERVICE_UNAVAILABLE, "Unable to accept request.", "storage_error")
    })?;

    if let Err(e) = state.queue.enqueue(&QueuedJob::new(&job_id)).await {
        tracing::error!(job_id = %job_id, error = %e, "Failed to queue job");
        let update = JobUpdate::failed("Unable to schedule report generation.", "queue_error");
        if let Err(e) = state.store.update_status(&job_id, update).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to mark unqueued job as failed");
        }
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Unable to schedule report generation.",
            "queue_error",
        ));
    }

    metrics::counter!("report_jobs_submitted").increment(1);
    tracing::info!(job_id = %job_id, company = %request.company_name, "Report job submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id,
            status: "queued".to_string(),
            message: "Report generation started".to_string(),
        }),
    ))
}

/// GET /api/v1/reports/{job_id} — Poll a report job.
pub async fn get_report_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> (StatusCode, Json<StatusResponse>) {
    let (status, body) = lookup_status(state.store.as_ref(), &job_id).await;
    (status, Json(body))
}

/// Map a job id to the status object a polling client sees.
pub async fn lookup_status(store: &dyn JobStore, job_id: &str) -> (StatusCode, StatusResponse) {
    match store.get_status(job_id).await {
        Ok(Some(record)) => (StatusCode::OK, StatusResponse::from(&record)),
        Ok(None) => (StatusCode::NOT_FOUND, StatusResponse::not_found()),
        Err(e) => {
            tracing::error!(job_id, error = %e, "Failed to read job status");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                StatusResponse::Error {
                    message: "Unable to read job status.".to_string(),
                    code: None,
                },
            )
        }
    }
}
