//! Parsing of upstream `data:` records.
//!
//! The upstream schema is mapping-shaped with optional fields at every
//! level, so every accessor downcasts defensively and returns an empty view
//! rather than failing. Structural corruption is surfaced separately through
//! [`DataFrame::valid_structure`] so the supervisor can decide to retry.

use std::borrow::Cow;

use memchr::memchr;
use serde_json::Value;

/// Completion marker the injected system instruction asks the model to emit.
pub const DONE_MARKER: &str = "[done]";

const DATA_PREFIX: &str = "data: ";

/// Finish reasons that indicate a safety block rather than a normal stop.
const BLOCK_FINISH_REASONS: [&str; 3] = ["SAFETY", "PROHIBITED_CONTENT", "RECITATION"];

/// True iff the line is an SSE data record.
#[must_use]
pub fn is_data_line(line: &str) -> bool {
    line.starts_with(DATA_PREFIX)
}

/// The derived view of a data record: its text fragment and thought flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameView {
    pub text: String,
    pub is_thought: bool,
}

/// A parsed SSE line. Non-data lines and undecodable payloads carry no
/// payload; accessors then return the empty/absent view.
#[derive(Debug)]
pub struct DataFrame {
    is_data: bool,
    payload: Option<Value>,
}

impl DataFrame {
    /// Parse one SSE line. JSON decoding happens at most once per line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let is_data = is_data_line(line);
        let payload = if is_data { decode_payload(line) } else { None };
        Self { is_data, payload }
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.is_data
    }

    /// Text fragment and thought flag of the first candidate's first part.
    ///
    /// Any structural deviation yields an empty view; that alone does not
    /// signal interruption.
    #[must_use]
    pub fn view(&self) -> FrameView {
        let Some(part) = self.first_part() else {
            return FrameView::default();
        };
        FrameView {
            text: part
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            is_thought: part
                .get("thought")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    /// `candidates[0].finishReason`, when the candidates array is well-formed.
    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.first_candidate()?
            .get("finishReason")
            .and_then(Value::as_str)
    }

    /// True iff the payload signals a safety block, either through
    /// `promptFeedback.blockReason` or a safety-like finish reason.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        let Some(payload) = self.payload.as_ref() else {
            return false;
        };
        if payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .is_some()
        {
            return true;
        }
        self.finish_reason()
            .is_some_and(|reason| BLOCK_FINISH_REASONS.contains(&reason))
    }

    /// Structural-corruption predicate: a data record must decode and carry
    /// a non-empty `candidates` array whose first element is a mapping.
    /// Non-data lines are always considered valid.
    #[must_use]
    pub fn valid_structure(&self) -> bool {
        if !self.is_data {
            return true;
        }
        self.first_candidate().is_some()
    }

    fn first_candidate(&self) -> Option<&Value> {
        let candidate = self
            .payload
            .as_ref()?
            .get("candidates")?
            .as_array()?
            .first()?;
        candidate.is_object().then_some(candidate)
    }

    fn first_part(&self) -> Option<&Value> {
        self.first_candidate()?
            .get("content")?
            .get("parts")?
            .as_array()?
            .first()
    }
}

fn decode_payload(line: &str) -> Option<Value> {
    let start = memchr(b'{', line.as_bytes())?;
    match serde_json::from_str(&line[start..]) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(error = %err, "data record payload failed to decode");
            None
        }
    }
}

/// Remove the completion marker from the first candidate's first part text.
///
/// Removal happens only on the terminal record (`at_end`) and only when the
/// payload is well-formed; all surrounding JSON is preserved. A record whose
/// text does not carry the marker is returned unchanged.
#[must_use]
pub fn remove_done_marker(line: &str, at_end: bool) -> Cow<'_, str> {
    if !at_end || !is_data_line(line) {
        return Cow::Borrowed(line);
    }
    let Some(mut payload) = decode_payload(line) else {
        return Cow::Borrowed(line);
    };

    let Some(text) = first_part_text_mut(&mut payload) else {
        return Cow::Borrowed(line);
    };
    let Some(current) = text.as_str() else {
        return Cow::Borrowed(line);
    };
    if !current.contains(DONE_MARKER) {
        return Cow::Borrowed(line);
    }

    *text = Value::String(current.replace(DONE_MARKER, ""));
    Cow::Owned(format!("{DATA_PREFIX}{payload}"))
}

fn first_part_text_mut(payload: &mut Value) -> Option<&mut Value> {
    payload
        .get_mut("candidates")?
        .as_array_mut()?
        .first_mut()?
        .get_mut("content")?
        .get_mut("parts")?
        .as_array_mut()?
        .first_mut()?
        .get_mut("text")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_line(payload: &Value) -> String {
        format!("data: {payload}")
    }

    fn text_chunk(text: &str) -> String {
        data_line(&json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        }))
    }

    #[test]
    fn test_view_extracts_text_and_thought() {
        let line = data_line(&json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hi", "thought": true }] } }]
        }));
        let frame = DataFrame::parse(&line);
        let view = frame.view();
        assert_eq!(view.text, "Hi");
        assert!(view.is_thought);
    }

    #[test]
    fn test_view_defaults_on_structural_deviation() {
        for line in [
            "data: {}".to_string(),
            data_line(&json!({ "candidates": [] })),
            data_line(&json!({ "candidates": "nope" })),
            data_line(&json!({ "candidates": [{ "content": {} }] })),
            data_line(&json!({ "candidates": [42] })),
            ": comment".to_string(),
        ] {
            let view = DataFrame::parse(&line).view();
            assert_eq!(view, FrameView::default(), "line: {line}");
        }
    }

    #[test]
    fn test_finish_reason() {
        let line = data_line(&json!({
            "candidates": [{ "content": { "parts": [{ "text": "x" }] }, "finishReason": "STOP" }]
        }));
        assert_eq!(DataFrame::parse(&line).finish_reason(), Some("STOP"));
        assert_eq!(DataFrame::parse(&text_chunk("x")).finish_reason(), None);
        assert_eq!(DataFrame::parse("data: {}").finish_reason(), None);
    }

    #[test]
    fn test_is_blocked_via_prompt_feedback() {
        let line = data_line(&json!({
            "promptFeedback": { "blockReason": "SAFETY" },
            "candidates": [{}]
        }));
        assert!(DataFrame::parse(&line).is_blocked());
    }

    #[test]
    fn test_is_blocked_via_finish_reason() {
        for reason in ["SAFETY", "PROHIBITED_CONTENT", "RECITATION"] {
            let line = data_line(&json!({
                "candidates": [{ "finishReason": reason }]
            }));
            assert!(DataFrame::parse(&line).is_blocked(), "reason: {reason}");
        }
        let stop = data_line(&json!({ "candidates": [{ "finishReason": "STOP" }] }));
        assert!(!DataFrame::parse(&stop).is_blocked());
    }

    #[test]
    fn test_valid_structure() {
        assert!(DataFrame::parse(": keep-alive").valid_structure());
        assert!(DataFrame::parse(&text_chunk("ok")).valid_structure());

        assert!(!DataFrame::parse("data: not json").valid_structure());
        assert!(!DataFrame::parse("data: {}").valid_structure());
        assert!(!DataFrame::parse(&data_line(&json!({ "candidates": [] }))).valid_structure());
        assert!(!DataFrame::parse(&data_line(&json!({ "candidates": ["x"] }))).valid_structure());
    }

    #[test]
    fn test_remove_done_marker_strips_text() {
        let line = text_chunk("The end.[done]");
        let processed = remove_done_marker(&line, true);
        let frame = DataFrame::parse(&processed);
        assert_eq!(frame.view().text, "The end.");
    }

    #[test]
    fn test_remove_done_marker_preserves_siblings() {
        let line = data_line(&json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Bye[done]" }], "role": "model" },
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": { "totalTokenCount": 7 }
        }));
        let processed = remove_done_marker(&line, true);
        let frame = DataFrame::parse(&processed);
        assert_eq!(frame.view().text, "Bye");
        assert_eq!(frame.finish_reason(), Some("STOP"));
        assert!(processed.contains("usageMetadata"));
    }

    #[test]
    fn test_remove_done_marker_requires_at_end() {
        let line = text_chunk("mid[done]stream");
        let processed = remove_done_marker(&line, false);
        assert_eq!(processed.as_ref(), line);
    }

    #[test]
    fn test_remove_done_marker_without_marker_is_noop() {
        let line = text_chunk("no marker here");
        let processed = remove_done_marker(&line, true);
        assert!(matches!(processed, Cow::Borrowed(_)));
        assert_eq!(processed.as_ref(), line);
    }

    #[test]
    fn test_remove_done_marker_on_malformed_payload_is_noop() {
        let processed = remove_done_marker("data: not json", true);
        assert_eq!(processed.as_ref(), "data: not json");
    }

    #[test]
    fn test_remove_done_marker_may_leave_empty_text() {
        let line = text_chunk("[done]");
        let processed = remove_done_marker(&line, true);
        assert_eq!(DataFrame::parse(&processed).view().text, "");
    }
}
