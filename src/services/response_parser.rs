//! Normalizes raw LLM response bodies into usable output.
//!
//! A body may be a single JSON document (responses or chat-completions shape),
//! a server-sent-event stream of deltas, or a malformed JSON fragment. The
//! parser decodes the bytes (repairing mis-encoded text), picks the right path,
//! extracts the answer text, detects truncation, and for structured steps
//! validates the required top-level sections.

use encoding_rs::WINDOWS_1252;
use serde_json::{Map, Value};
use strsim::jaro_winkler;

use crate::models::llm::{FunctionCall, QualityAlert};
use crate::services::json_repair::{decode_lenient, strip_code_fence};

/// Prefixes some gateways prepend to JSON to defeat script inclusion.
const HIJACK_PREFIXES: &[&str] = &["for (;;);", "for(;;);", "while(1);", ")]}'"];

const STREAM_DONE: &str = "[DONE]";

/// Generic replies that parse fine but do not answer anything.
const TRIVIAL_ANSWERS: &[&str] = &[
    "hello! how can i help you today?",
    "hi there! how can i assist you today?",
    "sure! let me know what you need.",
    "i'm sorry, but i can't help with that.",
    "as an ai language model, i cannot do that.",
];

const TRIVIAL_SIMILARITY: f64 = 0.88;
const TRIVIAL_MAX_LEN: usize = 160;

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Keep the decoded body on the parsed value for debugging.
    pub keep_raw: bool,
    /// The `max_output_tokens` the request was sent with, for usage-based truncation checks.
    pub max_output_tokens: Option<u32>,
}

/// Result of parsing one response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Text(TextOutput),
    Structured(StructuredOutput),
    Stream(StreamOutput),
    Failure(ParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextOutput {
    pub text: String,
    pub truncated: bool,
    pub function_calls: Vec<FunctionCall>,
    pub alerts: Vec<QualityAlert>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutput {
    pub text: String,
    pub truncated: bool,
    /// Whether a `[DONE]` sentinel or a final complete message was seen.
    pub finished: bool,
    /// Number of `data:` events that were not valid JSON.
    pub skipped: usize,
    pub alerts: Vec<QualityAlert>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput {
    pub value: Map<String, Value>,
    pub truncated: bool,
    /// Whether the JSON needed a repair pass before it decoded.
    pub repaired: bool,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("LLM response body was empty")]
    Empty,

    #[error("LLM response is not valid JSON: {0}")]
    Malformed(String),

    #[error("LLM response contains no output text")]
    MissingOutput,

    #[error("Structured LLM output is not a JSON object")]
    NotAnObject,

    #[error("Structured LLM output is missing sections: {}", .0.join(", "))]
    MissingSections(Vec<String>),
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::MissingSections(_) => "missing_sections",
            _ => "parse_error",
        }
    }
}

impl ParsedResponse {
    /// Answer text for the text and stream variants.
    pub fn text(&self) -> Option<&str> {
        match self {
            ParsedResponse::Text(t) => Some(&t.text),
            ParsedResponse::Stream(s) => Some(&s.text),
            _ => None,
        }
    }

    pub fn is_truncated(&self) -> bool {
        match self {
            ParsedResponse::Text(t) => t.truncated,
            ParsedResponse::Stream(s) => s.truncated,
            ParsedResponse::Structured(s) => s.truncated,
            ParsedResponse::Failure(_) => false,
        }
    }

    pub fn alerts(&self) -> &[QualityAlert] {
        match self {
            ParsedResponse::Text(t) => &t.alerts,
            ParsedResponse::Stream(s) => &s.alerts,
            _ => &[],
        }
    }

    pub fn into_result(self) -> Result<ParsedResponse, ParseError> {
        match self {
            ParsedResponse::Failure(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    /// Incremental text to append.
    pub delta: Option<String>,
    /// Complete answer text that supersedes accumulated deltas.
    pub complete: Option<String>,
    pub truncated: bool,
    pub done: bool,
}

/// Decode a single SSE line.
///
/// Returns `Ok(None)` for lines that carry no data (comments, `event:`, blank
/// keep-alives) and `Err` when a `data:` payload is not valid JSON.
pub fn decode_sse_line(line: &str) -> Result<Option<StreamChunk>, serde_json::Error> {
    let line = strip_hijack_prefix(line.trim());
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = strip_hijack_prefix(data.trim());
    if data.is_empty() {
        return Ok(None);
    }
    if data == STREAM_DONE {
        return Ok(Some(StreamChunk {
            done: true,
            ..Default::default()
        }));
    }

    let event: Value = serde_json::from_str(data)?;
    Ok(Some(chunk_from_event(&event)))
}

fn chunk_from_event(event: &Value) -> StreamChunk {
    let mut chunk = StreamChunk::default();

    // Chat-completions style
    if let Some(choice) = event.pointer("/choices/0") {
        if let Some(delta) = choice.pointer("/delta/content").and_then(Value::as_str) {
            chunk.delta = Some(delta.to_string());
        }
        if let Some(full) = choice.pointer("/message/content").and_then(Value::as_str) {
            chunk.complete = Some(full.to_string());
        }
        if choice.get("finish_reason").and_then(Value::as_str) == Some("length") {
            chunk.truncated = true;
        }
        return chunk;
    }

    // Responses API style
    match event.get("type").and_then(Value::as_str) {
        Some("response.output_text.delta") => {
            chunk.delta = event.get("delta").and_then(Value::as_str).map(str::to_string);
        }
        Some("response.output_text.done") => {
            chunk.complete = event.get("text").and_then(Value::as_str).map(str::to_string);
        }
        Some("response.completed") => {
            chunk.complete = event.get("response").and_then(extract_text);
        }
        Some("response.incomplete") => {
            chunk.truncated = true;
            chunk.complete = event.get("response").and_then(extract_text);
        }
        Some("content_block_delta") => {
            chunk.delta = event
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        _ => {}
    }
    chunk
}

fn strip_hijack_prefix(mut text: &str) -> &str {
    loop {
        let before = text;
        for prefix in HIJACK_PREFIXES {
            if let Some(rest) = text.strip_prefix(prefix) {
                text = rest.trim_start();
            }
        }
        if before.len() == text.len() {
            return text;
        }
    }
}

/// Top-level keys that mark a responses or chat-completions envelope.
const ENVELOPE_KEYS: &[&str] = &["output", "status", "choices", "object"];

fn is_envelope(body: &str) -> bool {
    match decode_lenient(body) {
        Ok((Value::Object(map), _)) => ENVELOPE_KEYS.iter().any(|key| map.contains_key(*key)),
        _ => false,
    }
}

/// Whether the body is an SSE stream rather than a single document.
pub fn looks_like_sse(body: &str) -> bool {
    body.lines()
        .any(|line| strip_hijack_prefix(line.trim_start()).starts_with("data:"))
}

#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    options: ParseOptions,
}

impl ResponseParser {
    pub fn new(options: ParseOptions) -> Self {
        Self { options }
    }

    pub fn with_max_output_tokens(mut self, tokens: Option<u32>) -> Self {
        self.options.max_output_tokens = tokens;
        self
    }

    /// Parse a body into text (single document) or accumulated stream text.
    pub fn parse(&self, body: &[u8]) -> ParsedResponse {
        let decoded = decode_body(body);
        let trimmed = strip_hijack_prefix(decoded.trim());
        if trimmed.is_empty() {
            return ParsedResponse::Failure(ParseError::Empty);
        }

        if looks_like_sse(trimmed) {
            return ParsedResponse::Stream(self.parse_stream(trimmed));
        }

        let document = match decode_lenient(trimmed) {
            Ok((value, repaired)) => {
                if repaired {
                    tracing::debug!("LLM response needed JSON repair");
                }
                value
            }
            Err(e) => return ParsedResponse::Failure(ParseError::Malformed(e.to_string())),
        };

        match self.text_from_document(&document) {
            Some(mut output) => {
                output.raw = self.keep(trimmed);
                ParsedResponse::Text(output)
            }
            None => ParsedResponse::Failure(ParseError::MissingOutput),
        }
    }

    /// Parse a body whose answer must be a JSON object carrying every section in `required`.
    pub fn parse_structured(&self, body: &[u8], required: &[&str]) -> ParsedResponse {
        let (answer, truncated) = match self.parse(body) {
            ParsedResponse::Text(t) => (t.text, t.truncated),
            ParsedResponse::Stream(s) => (s.text, s.truncated),
            ParsedResponse::Failure(ParseError::MissingOutput) => {
                // A bare JSON object may itself be the structured document; an
                // API envelope with nothing in it is still a missing answer.
                let decoded = decode_body(body);
                let bare = strip_hijack_prefix(decoded.trim()).to_string();
                if is_envelope(&bare) {
                    return ParsedResponse::Failure(ParseError::MissingOutput);
                }
                (bare, false)
            }
            other => return other,
        };

        let (value, repaired) = match decode_lenient(strip_code_fence(answer.trim())) {
            Ok(decoded) => decoded,
            Err(e) => return ParsedResponse::Failure(ParseError::Malformed(e.to_string())),
        };
        let Value::Object(value) = value else {
            return ParsedResponse::Failure(ParseError::NotAnObject);
        };

        let missing: Vec<String> = required
            .iter()
            .filter(|section| value.get(**section).map_or(true, Value::is_null))
            .map(|section| section.to_string())
            .collect();
        if !missing.is_empty() {
            return ParsedResponse::Failure(ParseError::MissingSections(missing));
        }

        ParsedResponse::Structured(StructuredOutput {
            value,
            truncated,
            repaired,
            raw: self.keep(&answer),
        })
    }

    fn parse_stream(&self, body: &str) -> StreamOutput {
        let mut accumulated = String::new();
        let mut complete: Option<String> = None;
        let mut truncated = false;
        let mut finished = false;
        let mut skipped = 0;

        for line in body.lines() {
            match decode_sse_line(line) {
                Ok(Some(chunk)) => {
                    if chunk.done {
                        finished = true;
                        break;
                    }
                    if let Some(delta) = chunk.delta {
                        accumulated.push_str(&delta);
                    }
                    if let Some(full) = chunk.complete {
                        complete = Some(full);
                        finished = true;
                    }
                    truncated |= chunk.truncated;
                }
                Ok(None) => {}
                Err(e) => {
                    skipped += 1;
                    tracing::debug!(error = %e, "Skipping malformed stream event");
                }
            }
        }

        let text = complete.unwrap_or(accumulated);
        StreamOutput {
            alerts: quality_alerts(&text),
            text,
            truncated,
            finished,
            skipped,
            raw: self.keep(body),
        }
    }

    fn text_from_document(&self, document: &Value) -> Option<TextOutput> {
        let text = extract_text(document)?;
        Some(TextOutput {
            truncated: self.is_truncated(document),
            function_calls: extract_function_calls(document),
            alerts: quality_alerts(&text),
            text,
            raw: None,
        })
    }

    fn is_truncated(&self, document: &Value) -> bool {
        if document.get("status").and_then(Value::as_str) == Some("incomplete") {
            return true;
        }
        if document
            .get("incomplete_details")
            .is_some_and(|details| !details.is_null())
        {
            return true;
        }
        if document.pointer("/choices/0/finish_reason").and_then(Value::as_str) == Some("length") {
            return true;
        }
        match (
            self.options.max_output_tokens,
            document.pointer("/usage/output_tokens").and_then(Value::as_u64),
        ) {
            (Some(limit), Some(used)) => used >= u64::from(limit),
            _ => false,
        }
    }

    fn keep(&self, body: &str) -> Option<String> {
        self.options.keep_raw.then(|| body.to_string())
    }
}

/// Extract answer text from a single response document.
///
/// Prefers `output[].content[].text` of message entries (reasoning entries are
/// not the answer), then a top-level `output_text`, then chat-completions
/// `choices[0].message.content`.
pub fn extract_text(document: &Value) -> Option<String> {
    if let Some(items) = document.get("output").and_then(Value::as_array) {
        let mut parts = Vec::new();
        for item in items {
            match item.get("type").and_then(Value::as_str) {
                Some("message") => {
                    let Some(content) = item.get("content").and_then(Value::as_array) else {
                        continue;
                    };
                    for part in content {
                        let kind = part.get("type").and_then(Value::as_str);
                        if matches!(kind, Some("output_text") | Some("text")) {
                            if let Some(text) = part.get("text").and_then(Value::as_str) {
                                parts.push(text);
                            }
                        }
                    }
                }
                Some("output_text") => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        parts.push(text);
                    }
                }
                _ => {}
            }
        }
        if !parts.is_empty() {
            return Some(parts.concat());
        }
    }

    match document.get("output_text") {
        Some(Value::String(text)) => return Some(text.clone()),
        Some(Value::Array(items)) => {
            let joined: String = items.iter().filter_map(Value::as_str).collect();
            if !joined.is_empty() {
                return Some(joined);
            }
        }
        _ => {}
    }

    document
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Collect `function_call` entries from a response's `output` array.
pub fn extract_function_calls(document: &Value) -> Vec<FunctionCall> {
    let Some(items) = document.get("output").and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("function_call"))
        .filter_map(|item| {
            let name = item.get("name").and_then(Value::as_str)?.to_string();
            let arguments = match item.get("arguments") {
                Some(Value::String(raw)) => serde_json::from_str(raw)
                    .unwrap_or_else(|_| Value::String(raw.clone())),
                Some(other) => other.clone(),
                None => Value::Null,
            };
            Some(FunctionCall {
                name,
                call_id: item
                    .get("call_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                arguments,
            })
        })
        .collect()
}

/// Flag answers that are empty or look like a canned non-answer.
pub fn quality_alerts(text: &str) -> Vec<QualityAlert> {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return vec![QualityAlert::Empty];
    }
    if normalized.len() > TRIVIAL_MAX_LEN {
        return Vec::new();
    }

    TRIVIAL_ANSWERS
        .iter()
        .map(|phrase| (*phrase, jaro_winkler(&normalized, phrase)))
        .filter(|(_, score)| *score >= TRIVIAL_SIMILARITY)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(phrase, similarity)| {
            vec![QualityAlert::TrivialAnswer {
                matched: phrase.to_string(),
                similarity,
            }]
        })
        .unwrap_or_default()
}

/// Decode a body to text.
///
/// Valid UTF-8 is kept (after reversing double-encoded sequences); anything
/// else is read as Windows-1252.
pub fn decode_body(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => fix_mojibake(text),
        Err(_) => {
            tracing::debug!("LLM response is not UTF-8, transcoding from Windows-1252");
            WINDOWS_1252.decode_without_bom_handling(bytes).0.into_owned()
        }
    }
}

/// Reverse UTF-8 text that was decoded as Windows-1252 and re-encoded (`Ã©` for `é`).
pub fn fix_mojibake(text: &str) -> String {
    const MARKERS: &[&str] = &["Ã", "Â", "â€"];
    if !MARKERS.iter().any(|m| text.contains(m)) {
        return text.to_string();
    }

    let (bytes, _, unmappable) = WINDOWS_1252.encode(text);
    if unmappable {
        return text.to_string();
    }
    match std::str::from_utf8(&bytes) {
        Ok(fixed) => fixed.to_string(),
        Err(_) => text.to_string(),
    }
}
