use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::ProxyError;

/// Rough prompt-size heuristic: four characters per token.
const CHARS_PER_TOKEN: u64 = 4;

/// Extract the model name from a generateContent-style URL path, e.g.
/// `/v1beta/models/gemini-2.5-pro:streamGenerateContent` -> `gemini-2.5-pro`.
#[must_use]
pub fn model_from_path(path: &str) -> Option<&str> {
    let rest = path.split("/models/").nth(1)?;
    let model = rest
        .split(|c| c == ':' || c == '/' || c == '?')
        .next()
        .unwrap_or(rest);
    if model.is_empty() {
        None
    } else {
        Some(model)
    }
}

/// Estimate the prompt token count of a generation request.
///
/// Counts characters of every `text` part under `contents` and under the
/// system instruction (either spelling), then divides by four, rounding up.
#[must_use]
pub fn estimate_tokens(body: &Map<String, Value>) -> u64 {
    let mut chars: u64 = 0;

    if let Some(contents) = body.get("contents").and_then(Value::as_array) {
        for entry in contents {
            chars += part_chars(entry.get("parts"));
        }
    }
    for field in ["systemInstruction", "system_instruction"] {
        if let Some(instruction) = body.get(field) {
            chars += part_chars(instruction.get("parts"));
        }
    }

    chars.div_ceil(CHARS_PER_TOKEN)
}

fn part_chars(parts: Option<&Value>) -> u64 {
    let Some(parts) = parts.and_then(Value::as_array) else {
        return 0;
    };
    parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(|text| text.chars().count() as u64)
        .sum()
}

/// Refuse requests whose estimated prompt size exceeds the configured cap
/// for the model named in the URL path.
///
/// # Errors
///
/// Returns [`ProxyError::TokenBudget`] with the configured HTTP code and
/// message when the estimate exceeds the cap.
pub fn check_token_budget(
    config: &Config,
    path: &str,
    body: &Map<String, Value>,
) -> Result<(), ProxyError> {
    if config.model_max_tokens.is_empty() {
        return Ok(());
    }
    let Some(model) = model_from_path(path) else {
        return Ok(());
    };
    let Some(&cap) = config.model_max_tokens.get(model) else {
        return Ok(());
    };

    let estimate = estimate_tokens(body);
    if estimate > cap {
        tracing::warn!(model, estimate, cap, "request rejected by token budget");
        return Err(ProxyError::TokenBudget {
            code: config.token_limit_exceeded_code,
            message: config.token_limit_exceeded_message.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_from(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object body")
    }

    #[test]
    fn test_model_from_path() {
        assert_eq!(
            model_from_path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"),
            Some("gemini-2.5-pro")
        );
        assert_eq!(
            model_from_path("/v1beta/models/gemini-2.5-flash"),
            Some("gemini-2.5-flash")
        );
        assert_eq!(model_from_path("/v1beta/models/"), None);
        assert_eq!(model_from_path("/health"), None);
    }

    #[test]
    fn test_estimate_counts_contents_and_instruction() {
        let body = body_from(json!({
            "contents": [
                { "role": "user", "parts": [{ "text": "abcd" }, { "text": "efgh" }] }
            ],
            "systemInstruction": { "parts": [{ "text": "ijkl" }] }
        }));
        // 12 chars -> 3 tokens
        assert_eq!(estimate_tokens(&body), 3);
    }

    #[test]
    fn test_estimate_rounds_up_and_survives_malformed_parts() {
        let body = body_from(json!({
            "contents": [
                { "parts": [{ "text": "abcde" }] },
                { "parts": "not-an-array" },
                { "no_parts": true }
            ]
        }));
        assert_eq!(estimate_tokens(&body), 2);
    }

    #[test]
    fn test_budget_rejects_over_cap() {
        let mut config = Config::default();
        config.model_max_tokens.insert("gemini-2.5-pro".to_string(), 2);
        let body = body_from(json!({
            "contents": [{ "parts": [{ "text": "a dozen characters here" }] }]
        }));

        let err = check_token_budget(
            &config,
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent",
            &body,
        )
        .expect_err("should exceed cap");
        assert!(matches!(err, ProxyError::TokenBudget { code: 413, .. }));
    }

    #[test]
    fn test_budget_allows_unknown_model_and_under_cap() {
        let mut config = Config::default();
        config.model_max_tokens.insert("gemini-2.5-pro".to_string(), 1000);
        let body = body_from(json!({
            "contents": [{ "parts": [{ "text": "short" }] }]
        }));

        assert!(check_token_budget(
            &config,
            "/v1beta/models/gemini-2.5-pro:streamGenerateContent",
            &body
        )
        .is_ok());
        assert!(check_token_budget(
            &config,
            "/v1beta/models/other-model:streamGenerateContent",
            &body
        )
        .is_ok());
    }
}
