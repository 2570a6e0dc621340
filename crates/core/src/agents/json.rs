//! Pull JSON out of free-form model output.

use regex::Regex;
use std::sync::LazyLock;

static JSON_ARRAY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\[.*\]").unwrap());
static JSON_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Drop a leading ```lang line and a trailing ``` if present
pub fn strip_markdown_fences(text: &str) -> &str {
    let mut text = text.trim();

    if text.starts_with("```") {
        if let Some(newline) = text.find('\n') {
            text = text[newline..].trim();
        }
    }

    if let Some(stripped) = text.strip_suffix("```") {
        text = stripped.trim();
    }

    text
}

/// Remove a fence only when it wraps the whole text. A fenced block in the
/// middle of a Markdown report is kept.
pub fn strip_enclosing_fence(text: &str) -> String {
    let stripped = text.trim();

    if !(stripped.len() >= 6 && stripped.starts_with("```") && stripped.ends_with("```")) {
        return stripped.to_string();
    }

    match (stripped.find('\n'), stripped.rfind('\n')) {
        (Some(first), Some(last)) if last > first => stripped[first + 1..last].trim().to_string(),
        _ => stripped.trim_matches('`').trim().to_string(),
    }
}

/// Greedy first-array-then-object extraction
pub fn extract_json_payload(text: &str) -> Option<&str> {
    let text = strip_markdown_fences(text);
    if text.is_empty() {
        return None;
    }

    JSON_ARRAY_RE
        .find(text)
        .or_else(|| JSON_OBJECT_RE.find(text))
        .map(|m| m.as_str().trim())
}

pub fn safe_json_loads(text: &str) -> Option<serde_json::Value> {
    let extracted = extract_json_payload(text)?;
    match serde_json::from_str(extracted) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Extracted payload is not valid JSON: {}", e);
            None
        }
    }
}
