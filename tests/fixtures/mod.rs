//! Canned report requests and LLM response bodies

#![allow(dead_code)]

use serde_json::{json, Value};

/// A report request and what the pipeline should make of it.
#[derive(Debug, Clone)]
pub struct ReportFixture {
    pub company_name: &'static str,
    pub industry: &'static str,
    pub employee_count: u32,
    pub pain_points: &'static str,
    pub description: &'static str,
}

impl ReportFixture {
    pub fn request(&self) -> Value {
        json!({
            "company_name": self.company_name,
            "industry": self.industry,
            "employee_count": self.employee_count,
            "pain_points": self.pain_points,
        })
    }
}

pub const REPORT_FIXTURES: &[ReportFixture] = &[
    ReportFixture {
        company_name: "Acme Manufacturing",
        industry: "Manufacturing",
        employee_count: 250,
        pain_points: "Manual invoice matching takes two FTEs",
        description: "Mid-size manufacturer",
    },
    ReportFixture {
        company_name: "Northwind Clinics",
        industry: "Healthcare",
        employee_count: 40,
        pain_points: "Appointment no-shows and phone backlog",
        description: "Small healthcare provider",
    },
];

/// Structured report the final step is expected to return.
pub fn report_data() -> Value {
    json!({
        "executive_summary": "Automating invoice matching pays back in 7 months.",
        "roi_analysis": {"annual_savings": 120000, "payback_months": 7},
        "recommendations": ["Start with AP automation", "Integrate with ERP"],
        "implementation_plan": [
            {"phase": "Pilot", "weeks": 6},
            {"phase": "Rollout", "weeks": 10}
        ]
    })
}

/// Responses-API body whose only output text is `text`, preceded by a reasoning item.
pub fn responses_body(text: &str) -> String {
    json!({
        "id": "resp_123",
        "status": "completed",
        "output": [
            {"type": "reasoning", "summary": [{"type": "summary_text", "text": "thinking"}]},
            {
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": text}]
            }
        ]
    })
    .to_string()
}

/// Responses-API body cut off by `max_output_tokens`.
pub fn incomplete_body(text: &str) -> String {
    json!({
        "status": "incomplete",
        "incomplete_details": {"reason": "max_output_tokens"},
        "output": [
            {
                "type": "message",
                "content": [{"type": "output_text", "text": text}]
            }
        ]
    })
    .to_string()
}

/// Chat-completions style SSE stream that spells out `parts` and ends with `[DONE]`.
pub fn sse_body(parts: &[&str]) -> String {
    let mut body = String::new();
    for part in parts {
        let event = json!({"choices": [{"delta": {"content": part}, "finish_reason": null}]});
        body.push_str(&format!("data: {event}\n\n"));
    }
    let last = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
    body.push_str(&format!("data: {last}\n\n"));
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn api_error_body(message: &str) -> String {
    json!({"error": {"message": message, "type": "invalid_request_error"}}).to_string()
}
