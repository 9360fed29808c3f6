//! Test helper utilities: scripted pipeline steps, a flaky store, a mock LLM
//! server and HTTP polling for end-to-end runs.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde_json::{Map, Value};
use tokio::time::sleep;

use bizcase_report::models::job::{JobRecord, JobUpdate};
use bizcase_report::services::job_store::{JobStore, MemoryJobStore, StoreError};
use bizcase_report::services::llm_client::RetryPolicy;
use bizcase_report::services::pipeline::{PipelineContext, PipelineStep, StepError, StepOutput};

/// Shared record of which steps ran, in order.
pub type RunLog = Arc<Mutex<Vec<String>>>;

pub fn run_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn ran(log: &RunLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// What a scripted step does when run.
#[derive(Debug, Clone)]
pub enum Script {
    Return(Value),
    Partial(Value, &'static str),
    Fail(&'static str),
    Panic(&'static str),
}

pub struct ScriptedStep {
    pub name: String,
    pub output_key: String,
    pub script: Script,
    pub log: RunLog,
}

impl ScriptedStep {
    pub fn new(name: &str, output_key: &str, script: Script, log: &RunLog) -> Arc<dyn PipelineStep> {
        Arc::new(Self {
            name: name.to_string(),
            output_key: output_key.to_string(),
            script,
            log: log.clone(),
        })
    }
}

#[async_trait]
impl PipelineStep for ScriptedStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    async fn run(&self, _ctx: &PipelineContext) -> Result<StepOutput, StepError> {
        self.log.lock().unwrap().push(self.name.clone());
        match &self.script {
            Script::Return(value) => Ok(StepOutput::complete(value.clone())),
            Script::Partial(value, reason) => Ok(StepOutput::partial(value.clone(), *reason)),
            Script::Fail(message) => Err(StepError::failed(*message)),
            Script::Panic(message) => panic!("{}", message),
        }
    }
}

/// Fails unless every earlier output is already visible in the store.
pub struct StoreCheckingStep {
    pub name: String,
    pub store: Arc<dyn JobStore>,
}

#[async_trait]
impl PipelineStep for StoreCheckingStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_key(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StepOutput, StepError> {
        let record = self
            .store
            .get_status(&ctx.job_id)
            .await
            .map_err(|e| StepError::failed(e.to_string()))?
            .ok_or_else(|| StepError::failed("job vanished"))?;

        for key in ctx.outputs.keys() {
            if !record.payload.contains_key(key) {
                return Err(StepError::failed(format!("{key} not stored yet")));
            }
        }
        Ok(StepOutput::complete(Value::Bool(true)))
    }
}

/// The six report stages with plain scripted outputs.
pub fn happy_steps(log: &RunLog, report_data: Value) -> Vec<Arc<dyn PipelineStep>> {
    vec![
        ScriptedStep::new("basic_roi_calculation", "basic_roi", Script::Return(Value::from("12%")), log),
        ScriptedStep::new("ai_enrichment", "enriched_profile", Script::Return(Value::from("profile")), log),
        ScriptedStep::new("enhanced_roi_calculation", "enhanced_roi", Script::Return(Value::from("18%")), log),
        ScriptedStep::new("intelligent_recommendations", "category", Script::Return(Value::from("automation")), log),
        ScriptedStep::new("hybrid_rag_analysis", "analysis", Script::Return(Value::from("market")), log),
        ScriptedStep::new("data_structuring", "report_data", Script::Return(report_data), log),
    ]
}

pub fn input_payload(input: Value) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("input".to_string(), input);
    payload
}

/// Memory store whose `update_status` fails on chosen calls (1-based).
pub struct FlakyStore {
    pub inner: MemoryJobStore,
    pub fail_calls: Vec<usize>,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(fail_calls: Vec<usize>) -> Self {
        Self {
            inner: MemoryJobStore::default(),
            fail_calls,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn enqueue(&self, initial: Map<String, Value>) -> Result<String, StoreError> {
        self.inner.enqueue(initial).await
    }

    async fn update_status(&self, job_id: &str, update: JobUpdate) -> Result<JobRecord, StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_calls.contains(&call) {
            return Err(StoreError::Poisoned);
        }
        self.inner.update_status(job_id, update).await
    }

    async fn get_status(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get_status(job_id).await
    }

    async fn cleanup(&self) -> Result<usize, StoreError> {
        self.inner.cleanup().await
    }
}

/// One canned reply from the mock LLM.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub body: String,
    pub content_type: &'static str,
    pub delay: Duration,
}

impl MockReply {
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_type: "application/json",
            delay: Duration::ZERO,
        }
    }

    pub fn sse(body: impl Into<String>) -> Self {
        Self {
            content_type: "text/event-stream",
            ..Self::json(body)
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            ..Self::json(body)
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub authorization: Option<String>,
    pub body: Value,
}

struct MockState {
    replies: Mutex<VecDeque<MockReply>>,
    hits: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// In-process stand-in for the LLM responses endpoint.
pub struct MockLlm {
    pub endpoint: String,
    state: Arc<MockState>,
}

impl MockLlm {
    /// Serve `replies` in order; the last one repeats once the rest are used.
    pub async fn start(replies: Vec<MockReply>) -> Self {
        assert!(!replies.is_empty(), "mock needs at least one reply");
        let state = Arc::new(MockState {
            replies: Mutex::new(replies.into()),
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/v1/responses", post(respond))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            endpoint: format!("http://{addr}/v1/responses"),
            state,
        }
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn respond(State(state): State<Arc<MockState>>, headers: HeaderMap, body: String) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().unwrap().push(RecordedRequest {
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
    });

    let reply = {
        let mut replies = state.replies.lock().unwrap();
        if replies.len() > 1 {
            replies.pop_front().unwrap()
        } else {
            replies.front().cloned().unwrap()
        }
    };

    if !reply.delay.is_zero() {
        sleep(reply.delay).await;
    }

    (
        StatusCode::from_u16(reply.status).unwrap(),
        [(header::CONTENT_TYPE, reply.content_type)],
        reply.body,
    )
        .into_response()
}

/// Retry policy with short delays so tests stay fast.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        max_retry_time: Duration::from_secs(5),
        request_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

/// Submit a report request to a running API and return its job id.
pub async fn submit_report(
    client: &reqwest::Client,
    base_url: &str,
    request: &Value,
) -> Result<String, Box<dyn std::error::Error>> {
    let response = client
        .post(format!("{}/api/v1/reports", base_url))
        .json(request)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Submit failed with status {}: {}", status, error_text).into());
    }

    let body: Value = response.json().await?;
    let job_id = body["job_id"].as_str().ok_or("No job_id in response")?;
    Ok(job_id.to_string())
}

/// Poll job status until completed or error (with timeout)
pub async fn poll_job_status(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    timeout_secs: u64,
) -> Result<Value, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let response = client
            .get(format!("{}/api/v1/reports/{}", base_url, job_id))
            .send()
            .await?;
        let body: Value = response.json().await?;

        match body["status"].as_str() {
            Some("completed") | Some("error") => return Ok(body),
            Some("queued") | Some("processing") => {
                if attempt % 10 == 0 && attempt > 0 {
                    println!(
                        "  ... still waiting at {} {}% (attempt {}/{})",
                        body["step"], body["percent"], attempt, max_attempts
                    );
                }
                sleep(Duration::from_millis(500)).await;
            }
            _ => return Err(format!("Unknown job status: {}", body).into()),
        }
    }

    Err(format!("Job did not complete within {} seconds", timeout_secs).into())
}
