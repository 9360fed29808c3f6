//! Best-effort repair of malformed JSON emitted by an LLM, and integrity
//! auditing of previously stored responses.
//!
//! Repair handles the defects seen in practice: markdown code fences, prose
//! before the document, trailing commas, unterminated strings and unbalanced
//! braces/brackets. It never invents keys or values beyond `null` for a
//! dangling `"key":`.

use serde::Serialize;
use serde_json::Value;

/// Repair common JSON defects. The result is not guaranteed to be valid JSON;
/// callers revalidate it.
pub fn repair(input: &str) -> String {
    let body = strip_code_fence(input.trim());
    let start = body.find(['{', '[']).unwrap_or(0);
    let body = &body[start..];

    let mut out = String::with_capacity(body.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if !closers.contains(&c) {
                    // Stray closer with nothing to close.
                    continue;
                }
                // Close anything opened inside the scope being closed.
                while let Some(open) = closers.pop() {
                    drop_trailing_comma(&mut out);
                    out.push(open);
                    if open == c {
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str("null");
    }
    while let Some(open) = closers.pop() {
        drop_trailing_comma(&mut out);
        out.push(open);
    }
    drop_trailing_comma(&mut out);
    out
}

/// Decode `text` as JSON, running one repair pass if the first attempt fails.
///
/// Returns the value and whether repair was needed.
pub fn decode_lenient(text: &str) -> Result<(Value, bool), serde_json::Error> {
    match serde_json::from_str(text) {
        Ok(value) => Ok((value, false)),
        Err(original) => match serde_json::from_str(&repair(text)) {
            Ok(value) => Ok((value, true)),
            Err(_) => Err(original),
        },
    }
}

/// Remove a surrounding ```json ... ``` fence if present.
pub fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let rest = rest.trim_end();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn drop_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    if out[..trimmed_len].ends_with(',') {
        out.truncate(trimmed_len - 1);
    }
}

/// A response body as it was received next to the value that was persisted.
#[derive(Debug, Clone)]
pub struct StoredResponse<'a> {
    pub original: &'a str,
    pub stored: &'a Value,
}

/// Outcome of auditing a stored response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "integrity", rename_all = "snake_case")]
pub enum Integrity {
    Intact,
    Corrupted {
        reason: String,
        /// The original body after repair, when repair produced valid JSON.
        repaired: Option<Value>,
    },
}

impl Integrity {
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Integrity::Corrupted { .. })
    }
}

impl StoredResponse<'_> {
    /// Compare the stored value's serialization against the original body.
    pub fn audit(&self) -> Integrity {
        let stored = match serde_json::to_string(self.stored) {
            Ok(s) => s,
            Err(e) => {
                return Integrity::Corrupted {
                    reason: format!("stored value does not serialize: {e}"),
                    repaired: None,
                }
            }
        };

        match serde_json::from_str::<Value>(self.original) {
            Ok(original) => {
                let canonical = original.to_string();
                if canonical == stored {
                    Integrity::Intact
                } else {
                    Integrity::Corrupted {
                        reason: "stored value differs from original body".to_string(),
                        repaired: Some(original),
                    }
                }
            }
            Err(e) => Integrity::Corrupted {
                reason: format!("original body is not valid JSON: {e}"),
                repaired: serde_json::from_str(&repair(self.original)).ok(),
            },
        }
    }
}
