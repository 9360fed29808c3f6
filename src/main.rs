use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use bizcase_report::app_state::AppState;
use bizcase_report::config::AppConfig;
use bizcase_report::routes;
use bizcase_report::services::{
    job_store::JobStore, queue::JobQueue, redis_store::RedisJobStore,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing bizcase-report server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("report_jobs_submitted", "Total report jobs accepted");
    metrics::describe_counter!("report_jobs_completed", "Total report jobs completed");
    metrics::describe_counter!("report_jobs_failed", "Total report jobs that ended in error");
    metrics::describe_histogram!("report_step_seconds", "Time spent in each pipeline step");
    metrics::describe_counter!("llm_call_attempts", "HTTP attempts made against the LLM API");
    metrics::describe_counter!("llm_call_retries", "LLM attempts retried after a transient failure");
    metrics::describe_gauge!("report_queue_depth", "Current number of pending jobs in the queue");

    tracing::info!("Connecting to Redis job store");
    let store: Arc<dyn JobStore> = Arc::new(
        RedisJobStore::new(&config.redis_url, config.retention())
            .expect("Failed to initialize job store"),
    );

    tracing::info!("Connecting to Redis job queue");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");

    // Expired jobs are also swept on reads; this keeps the index small when nobody polls.
    let sweeper = store.clone();
    let interval = config.retention().cleanup_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.cleanup().await {
                tracing::warn!(error = %e, "Job cleanup failed");
            }
        }
    });

    let state = AppState::new(store, queue);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/reports", post(routes::reports::submit_report))
        .route(
            "/api/v1/reports/{job_id}",
            get(routes::reports::get_report_status),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(256 * 1024)); // 256 KB limit

    tracing::info!("Starting bizcase-report on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
