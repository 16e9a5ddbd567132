//! Robust JSON extraction from model output.
//!
//! Providers occasionally wrap JSON in markdown fences or prose. Parsing
//! tries the raw text first, then a fence-stripped variant, then the first
//! balanced JSON payload located by a small string-aware scanner.

use codeforge_core::{CodeforgeError, CodeforgeResult};
use serde_json::Value;

const PREVIEW_LIMIT: usize = 2000;

/// Parse a JSON object out of raw model output.
pub fn parse_llm_json(text: &str) -> CodeforgeResult<Value> {
    let cleaned = text.trim();
    if let Ok(value) = serde_json::from_str(cleaned) {
        return Ok(value);
    }

    let stripped = strip_markdown_fences(cleaned);
    if stripped != cleaned {
        if let Ok(value) = serde_json::from_str(stripped) {
            return Ok(value);
        }
    }

    if let Some(candidate) = extract_first_json_payload(stripped) {
        return serde_json::from_str(candidate).map_err(|err| parse_error(text, &err.to_string()));
    }
    parse_error_result(text, "no JSON payload found")
}

fn parse_error(raw: &str, message: &str) -> CodeforgeError {
    CodeforgeError::ResponseParse {
        message: message.to_string(),
        preview: truncate_preview(raw),
    }
}

fn parse_error_result(raw: &str, message: &str) -> CodeforgeResult<Value> {
    Err(parse_error(raw, message))
}

/// Truncate raw model output for event payloads, on a char boundary.
pub fn truncate_preview(raw: &str) -> String {
    if raw.len() <= PREVIEW_LIMIT {
        return raw.to_string();
    }
    let mut end = PREVIEW_LIMIT;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

/// Remove a surrounding markdown code fence, if present.
pub fn strip_markdown_fences(text: &str) -> &str {
    let stripped = text.trim();
    if !stripped.starts_with("```") {
        return stripped;
    }
    let mut lines: Vec<&str> = stripped.lines().collect();
    if lines.first().is_some_and(|l| l.starts_with("```")) {
        lines.remove(0);
    }
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    // Recover the span of the remaining lines within the original text so we
    // can return a borrowed slice.
    match (lines.first(), lines.last()) {
        (Some(first), Some(last)) => {
            let start = offset_of(stripped, first);
            let end = offset_of(stripped, last) + last.len();
            stripped[start..end].trim()
        }
        _ => "",
    }
}

fn offset_of(haystack: &str, needle: &str) -> usize {
    needle.as_ptr() as usize - haystack.as_ptr() as usize
}

/// Locate the first balanced JSON object or array in `text`.
///
/// The scanner tracks string and escape state explicitly, so braces inside
/// string literals do not confuse the balance stack.
pub fn extract_first_json_payload(text: &str) -> Option<&str> {
    let mut in_string = false;
    let mut escape = false;
    let mut start_index: Option<usize> = None;
    let mut stack: Vec<u8> = Vec::new();

    for (index, byte) in text.bytes().enumerate() {
        if escape {
            escape = false;
            continue;
        }
        if in_string && byte == b'\\' {
            escape = true;
            continue;
        }
        if byte == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match byte {
            b'{' | b'[' => {
                if start_index.is_none() {
                    start_index = Some(index);
                }
                stack.push(byte);
            }
            b'}' | b']' => {
                let Some(opener) = stack.pop() else {
                    continue;
                };
                if (opener == b'{' && byte != b'}') || (opener == b'[' && byte != b']') {
                    continue;
                }
                if stack.is_empty() {
                    if let Some(start) = start_index {
                        return Some(&text[start..=index]);
                    }
                }
            }
            _ => {}
        }
    }
    None
}
