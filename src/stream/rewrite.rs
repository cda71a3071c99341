//! Continuation request synthesis.
//!
//! A continuation presents the partially delivered output as a completed
//! model turn followed by a user follow-up, which is the upstream's
//! documented way to resume a generation without re-emitting delivered
//! content.

use serde_json::{json, Map, Value};

/// Follow-up message asking the model to resume in place.
pub const CONTINUATION_PROMPT: &str =
    "Continue exactly where you left off without any preamble or repetition.";

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error("invalid contents field in continuation request")]
    InvalidContents,
    #[error("continuation request cannot have empty contents")]
    EmptyContents,
}

/// Build a continuation body from the original request and the text
/// delivered so far. All fields other than `contents` are carried verbatim.
///
/// # Errors
///
/// Returns [`RewriteError`] when `contents` is missing, not an array, or
/// empty.
pub fn build_continuation_body(
    original: &Map<String, Value>,
    accumulated_text: &str,
) -> Result<Map<String, Value>, RewriteError> {
    tracing::debug!(
        accumulated_chars = accumulated_text.len(),
        "building continuation request body"
    );

    let mut body = original.clone();
    let contents = body
        .get("contents")
        .and_then(Value::as_array)
        .ok_or(RewriteError::InvalidContents)?;
    if contents.is_empty() {
        return Err(RewriteError::EmptyContents);
    }

    // Splice the synthesized turns right after the last user message, or at
    // the end when the conversation carries no user entry.
    let last_user_index = contents
        .iter()
        .rposition(|entry| {
            entry.get("role").and_then(Value::as_str) == Some("user")
        })
        .unwrap_or(contents.len() - 1);

    let mut spliced = Vec::with_capacity(contents.len() + 2);
    spliced.extend_from_slice(&contents[..=last_user_index]);
    spliced.push(json!({
        "role": "model",
        "parts": [{ "text": accumulated_text }]
    }));
    spliced.push(json!({
        "role": "user",
        "parts": [{ "text": CONTINUATION_PROMPT }]
    }));
    spliced.extend_from_slice(&contents[last_user_index + 1..]);

    if spliced.is_empty() {
        return Err(RewriteError::EmptyContents);
    }
    body.insert("contents".to_string(), Value::Array(spliced));
    Ok(body)
}
