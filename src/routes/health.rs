use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub redis: ComponentHealth,
    /// Jobs waiting for a worker, when Redis answered.
    pub queue_depth: Option<u64>,
    /// Jobs claimed by workers and not yet completed.
    pub in_flight: Option<u64>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

/// GET /health — Redis connectivity and queue backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let redis_start = std::time::Instant::now();
    let redis_check = match state.queue.health_check().await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(redis_start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Redis health check failed");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    };

    let healthy = redis_check.status == "ok";
    let (queue_depth, in_flight) = if healthy {
        (
            state.queue.queue_depth().await.ok(),
            state.queue.in_flight().await.ok(),
        )
    } else {
        (None, None)
    };
    if let Some(depth) = queue_depth {
        metrics::gauge!("report_queue_depth").set(depth as f64);
    }
    if let Some(count) = in_flight {
        metrics::gauge!("report_jobs_in_flight").set(count as f64);
    }

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            redis: redis_check,
            queue_depth,
            in_flight,
        },
    };

    (status_code, Json(response))
}
