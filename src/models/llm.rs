use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body sent to the LLM responses endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmRequest {
    pub model: String,
    pub instructions: String,
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reasoning {
    pub effort: String,
}

impl LlmRequest {
    pub fn new(
        model: impl Into<String>,
        instructions: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            instructions: instructions.into(),
            input: input.into(),
            max_output_tokens: None,
            reasoning: None,
            stream: false,
        }
    }

    pub fn max_output_tokens(mut self, tokens: Option<u32>) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    pub fn reasoning_effort(mut self, effort: Option<String>) -> Self {
        self.reasoning = effort.map(|effort| Reasoning { effort });
        self
    }
}

/// A `function_call` entry found in a response's `output` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub call_id: Option<String>,
    /// Decoded arguments, or the raw argument string when it is not valid JSON.
    pub arguments: Value,
}

/// Marker raised when an answer parses but is not useful.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityAlert {
    Empty,
    TrivialAnswer { matched: String, similarity: f64 },
}

impl std::fmt::Display for QualityAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityAlert::Empty => write!(f, "empty answer"),
            QualityAlert::TrivialAnswer { matched, similarity } => {
                write!(f, "generic answer resembling \"{matched}\" ({similarity:.2})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_omits_unset_fields() {
        let request = LlmRequest::new("gpt-4o-mini", "Summarize", "Acme Corp");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"model": "gpt-4o-mini", "instructions": "Summarize", "input": "Acme Corp"})
        );
    }

    #[test]
    fn test_request_with_options() {
        let request = LlmRequest::new("m", "i", "x")
            .max_output_tokens(Some(800))
            .reasoning_effort(Some("low".to_string()));
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["max_output_tokens"], 800);
        assert_eq!(value["reasoning"]["effort"], "low");
    }
}
