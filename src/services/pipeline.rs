//! Pipeline step contract and the LLM-backed report steps.
//!
//! Steps receive an explicit [`PipelineContext`] holding the job input and the
//! outputs of every earlier step; nothing is shared between steps except
//! through that context and the job store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::config::AppConfig;
use crate::models::llm::{LlmRequest, QualityAlert};
use crate::services::llm_client::{LlmClient, LlmError, StreamHandler};
use crate::services::response_parser::{
    ParseError, ParseOptions, ParsedResponse, ResponseParser,
};

/// Payload key holding the enqueued input bundle.
pub const INPUT_KEY: &str = "input";

/// Sections the structured report must contain before it can be rendered.
pub const REPORT_SECTIONS: &[&str] = &[
    "executive_summary",
    "roi_analysis",
    "recommendations",
    "implementation_plan",
];

/// Inputs available to a step: the job input plus earlier step outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineContext {
    pub job_id: String,
    pub input: Value,
    pub outputs: Map<String, Value>,
}

impl PipelineContext {
    pub fn new(job_id: impl Into<String>, input: Value) -> Self {
        Self {
            job_id: job_id.into(),
            input,
            outputs: Map::new(),
        }
    }

    /// Rebuild the context from a stored job payload.
    pub fn from_payload(job_id: impl Into<String>, payload: &Map<String, Value>) -> Self {
        let mut outputs = payload.clone();
        let input = outputs.remove(INPUT_KEY).unwrap_or(Value::Null);
        Self {
            job_id: job_id.into(),
            input,
            outputs,
        }
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    pub fn record(&mut self, key: impl Into<String>, value: Value) {
        self.outputs.insert(key.into(), value);
    }

    /// Serialized context handed to the model as its input.
    pub fn prompt_input(&self) -> String {
        json!({"input": self.input, "previous_results": self.outputs}).to_string()
    }
}

/// What a successful step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub value: Value,
    /// Set when the step finished with a reduced-confidence result.
    pub partial: Option<String>,
    pub alerts: Vec<QualityAlert>,
}

impl StepOutput {
    pub fn complete(value: Value) -> Self {
        Self {
            value,
            partial: None,
            alerts: Vec::new(),
        }
    }

    pub fn partial(value: Value, reason: impl Into<String>) -> Self {
        Self {
            value,
            partial: Some(reason.into()),
            alerts: Vec::new(),
        }
    }

    pub fn with_alerts(mut self, alerts: Vec<QualityAlert>) -> Self {
        self.alerts = alerts;
        self
    }
}

/// A step's explicit failure. Panics are handled separately by the processor.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Business-logic failure reported by the step itself.
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::Failed(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            StepError::Failed(_) => "step_failed",
            StepError::Llm(e) => e.code(),
            StepError::Parse(e) => e.code(),
        }
    }
}

#[async_trait]
pub trait PipelineStep: Send + Sync {
    /// Stage name recorded as the job's `step`.
    fn name(&self) -> &str;

    /// Payload key the step's output is stored under.
    fn output_key(&self) -> &str;

    /// Progress text shown while the step runs.
    fn description(&self) -> &str {
        self.name()
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StepOutput, StepError>;
}

/// Model settings shared by every LLM step.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub keep_raw: bool,
}

impl LlmSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.llm_model.clone(),
            reasoning_effort: config.llm_reasoning_effort.clone(),
            max_output_tokens: config.llm_max_output_tokens,
            keep_raw: config.keep_raw_responses,
        }
    }
}

/// How a step's answer is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Expect {
    Text,
    Structured(Vec<String>),
}

/// A step that asks the LLM and stores its parsed answer.
pub struct LlmStep {
    name: String,
    output_key: String,
    description: String,
    instructions: String,
    expect: Expect,
    stream: bool,
    llm: Arc<LlmClient>,
    settings: Arc<LlmSettings>,
}

impl LlmStep {
    pub fn new(
        name: impl Into<String>,
        output_key: impl Into<String>,
        instructions: impl Into<String>,
        llm: Arc<LlmClient>,
        settings: Arc<LlmSettings>,
    ) -> Self {
        let name = name.into();
        Self {
            description: name.clone(),
            name,
            output_key: output_key.into(),
            instructions: instructions.into(),
            expect: Expect::Text,
            stream: false,
            llm,
            settings,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn structured(mut self, sections: &[&str]) -> Self {
        self.expect = Expect::Structured(sections.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Receive the answer as an SSE stream instead of one buffered body.
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    fn request(&self, ctx: &PipelineContext) -> LlmRequest {
        LlmRequest::new(&self.settings.model, &self.instructions, ctx.prompt_input())
            .max_output_tokens(self.settings.max_output_tokens)
            .reasoning_effort(self.settings.reasoning_effort.clone())
    }
}

#[async_trait]
impl PipelineStep for LlmStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_key(&self) -> &str {
        &self.output_key
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: &PipelineContext) -> Result<StepOutput, StepError> {
        let request = self.request(ctx);

        let raw = if self.stream {
            let chunks = AtomicUsize::new(0);
            let on_chunk = |delta: &str| {
                let n = chunks.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(job_id = %ctx.job_id, step = %self.name, chunk = n, len = delta.len(), "Stream chunk");
            };
            let handler: &StreamHandler<'_> = &on_chunk;
            let raw = self.llm.call(&request, None, Some(handler)).await?;
            tracing::debug!(
                job_id = %ctx.job_id,
                step = %self.name,
                chunks = chunks.load(Ordering::Relaxed),
                "Stream finished"
            );
            raw
        } else {
            self.llm.call(&request, None, None).await?
        };

        let parser = ResponseParser::new(ParseOptions {
            keep_raw: self.settings.keep_raw,
            max_output_tokens: self.settings.max_output_tokens,
        });
        let parsed = match &self.expect {
            Expect::Text => parser.parse(&raw.body),
            Expect::Structured(sections) => {
                let sections: Vec<&str> = sections.iter().map(String::as_str).collect();
                parser.parse_structured(&raw.body, &sections)
            }
        }
        .into_result()?;

        let partial = partial_reason(&self.name, &parsed);
        let alerts = parsed.alerts().to_vec();
        let value = match parsed {
            ParsedResponse::Text(t) if t.function_calls.is_empty() => Value::String(t.text),
            ParsedResponse::Text(t) => json!({
                "text": t.text,
                "function_calls": t.function_calls,
            }),
            ParsedResponse::Stream(s) => Value::String(s.text),
            ParsedResponse::Structured(s) => Value::Object(s.value),
            ParsedResponse::Failure(e) => return Err(e.into()),
        };

        let output = match partial {
            Some(reason) => StepOutput::partial(value, reason),
            None => StepOutput::complete(value),
        };
        Ok(output.with_alerts(alerts))
    }
}

/// Why a parsed answer should only count as a partial result.
fn partial_reason(step: &str, parsed: &ParsedResponse) -> Option<String> {
    if parsed.is_truncated() {
        return Some(format!("{step}: model output was truncated"));
    }
    match parsed {
        ParsedResponse::Stream(s) if !s.finished => {
            Some(format!("{step}: stream ended before completion"))
        }
        _ => None,
    }
}

struct Stage {
    name: &'static str,
    output_key: &'static str,
    description: &'static str,
    instructions: &'static str,
    structured: bool,
    stream: bool,
}

const STAGES: &[Stage] = &[
    Stage {
        name: "basic_roi_calculation",
        output_key: "basic_roi",
        description: "Researching company and estimating baseline ROI",
        instructions: "Research the company in the input and estimate a baseline return on investment.",
        structured: false,
        stream: false,
    },
    Stage {
        name: "ai_enrichment",
        output_key: "enriched_profile",
        description: "Enriching company profile",
        instructions: "Enrich the company profile with industry context, size and likely priorities.",
        structured: false,
        stream: false,
    },
    Stage {
        name: "enhanced_roi_calculation",
        output_key: "enhanced_roi",
        description: "Refining ROI estimate",
        instructions: "Refine the baseline ROI using the enriched profile.",
        structured: false,
        stream: false,
    },
    Stage {
        name: "intelligent_recommendations",
        output_key: "category",
        description: "Recommending solution category",
        instructions: "Recommend the best-fitting solution category and explain why.",
        structured: false,
        stream: false,
    },
    Stage {
        name: "hybrid_rag_analysis",
        output_key: "analysis",
        description: "Running market analysis",
        instructions: "Write a market and competitive analysis for the recommended category.",
        structured: false,
        stream: true,
    },
    Stage {
        name: "data_structuring",
        output_key: "report_data",
        description: "Structuring report",
        instructions: "Combine all previous results into one JSON object with the keys executive_summary, roi_analysis, recommendations and implementation_plan. Return only JSON.",
        structured: true,
        stream: false,
    },
];

/// The ordered business-case pipeline.
pub fn report_pipeline(llm: Arc<LlmClient>, settings: LlmSettings) -> Vec<Arc<dyn PipelineStep>> {
    let settings = Arc::new(settings);
    STAGES
        .iter()
        .map(|stage| {
            let mut step = LlmStep::new(
                stage.name,
                stage.output_key,
                stage.instructions,
                llm.clone(),
                settings.clone(),
            )
            .description(stage.description);
            if stage.structured {
                step = step.structured(REPORT_SECTIONS);
            }
            if stage.stream {
                step = step.streaming();
            }
            Arc::new(step) as Arc<dyn PipelineStep>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_client::RetryPolicy;

    #[test]
    fn test_context_splits_input_from_outputs() {
        let mut payload = Map::new();
        payload.insert("input".to_string(), json!({"company_name": "Acme"}));
        payload.insert("basic_roi".to_string(), json!("12%"));

        let ctx = PipelineContext::from_payload("job-1", &payload);
        assert_eq!(ctx.input, json!({"company_name": "Acme"}));
        assert_eq!(ctx.output("basic_roi"), Some(&json!("12%")));
        assert!(ctx.output("input").is_none());

        let prompt: Value = serde_json::from_str(&ctx.prompt_input()).unwrap();
        assert_eq!(prompt["previous_results"]["basic_roi"], "12%");
    }

    #[test]
    fn test_step_error_codes_and_messages() {
        let err = StepError::failed("Processing failed.");
        assert_eq!(err.to_string(), "Processing failed.");
        assert_eq!(err.code(), "step_failed");

        let err: StepError = ParseError::MissingSections(vec!["roi_analysis".into()]).into();
        assert_eq!(err.code(), "missing_sections");

        let err: StepError = LlmError::NoApiKey.into();
        assert_eq!(err.code(), "no_api_key");
    }

    #[test]
    fn test_unfinished_stream_is_partial() {
        let parser = ResponseParser::default();

        let cut = parser.parse(b"data: {\"choices\":[{\"delta\":{\"content\":\"Acme \"}}]}\n");
        assert_eq!(
            partial_reason("hybrid_rag_analysis", &cut).as_deref(),
            Some("hybrid_rag_analysis: stream ended before completion")
        );

        let done = parser.parse(b"data: {\"choices\":[{\"delta\":{\"content\":\"Acme\"}}]}\ndata: [DONE]\n");
        assert_eq!(partial_reason("hybrid_rag_analysis", &done), None);

        let long = parser.parse(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Acme\"},\"finish_reason\":\"length\"}]}\ndata: [DONE]\n",
        );
        assert_eq!(
            partial_reason("hybrid_rag_analysis", &long).as_deref(),
            Some("hybrid_rag_analysis: model output was truncated")
        );
    }

    #[test]
    fn test_report_pipeline_order() {
        let llm = Arc::new(LlmClient::new("http://localhost/v1/responses", None, RetryPolicy::default()).unwrap());
        let settings = LlmSettings {
            model: "gpt-4o-mini".to_string(),
            reasoning_effort: None,
            max_output_tokens: None,
            keep_raw: false,
        };
        let steps = report_pipeline(llm, settings);
        let names: Vec<&str> = steps.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "basic_roi_calculation",
                "ai_enrichment",
                "enhanced_roi_calculation",
                "intelligent_recommendations",
                "hybrid_rag_analysis",
                "data_structuring",
            ]
        );
        assert_eq!(steps[5].output_key(), "report_data");
        assert_eq!(steps[4].description(), "Running market analysis");
    }
}
