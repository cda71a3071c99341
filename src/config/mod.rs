use std::env;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse {var}: {message}")]
    Parse { var: String, message: String },
}

const DEFAULT_UPSTREAM_URL_BASE: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_TOKEN_LIMIT_MESSAGE: &str =
    "Request exceeds the maximum token budget configured for this model.";
const DEFAULT_NO_RETRY_STATUS_CODES: [u16; 5] = [400, 401, 403, 404, 429];

/// Runtime configuration, loaded from environment variables with defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_url_base: String,
    pub port: u16,
    pub debug_mode: bool,
    pub max_consecutive_retries: u32,
    pub retry_delay: Duration,
    pub swallow_thoughts_after_retry: bool,
    pub enable_rate_limit: bool,
    pub rate_limit_count: usize,
    pub rate_limit_window: Duration,
    pub enable_punctuation_heuristic: bool,
    /// Per-model prompt token caps, keyed by the model name from the URL path.
    pub model_max_tokens: FxHashMap<String, u64>,
    pub token_limit_exceeded_code: u16,
    pub token_limit_exceeded_message: String,
    /// Upstream statuses that abort a continuation instead of retrying it.
    pub no_retry_status_codes: FxHashSet<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_url_base: DEFAULT_UPSTREAM_URL_BASE.to_string(),
            port: 8080,
            debug_mode: true,
            max_consecutive_retries: 100,
            retry_delay: Duration::from_millis(750),
            swallow_thoughts_after_retry: true,
            enable_rate_limit: false,
            rate_limit_count: 10,
            rate_limit_window: Duration::from_secs(60),
            enable_punctuation_heuristic: true,
            model_max_tokens: FxHashMap::default(),
            token_limit_exceeded_code: 413,
            token_limit_exceeded_message: DEFAULT_TOKEN_LIMIT_MESSAGE.to_string(),
            no_retry_status_codes: DEFAULT_NO_RETRY_STATUS_CODES.into_iter().collect(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Scalar variables that are set but unparsable fall back to their
    /// defaults. `MODEL_MAX_TOKENS` and `NO_RETRY_STATUS_CODES` must parse
    /// when present so a misconfigured limit never silently disappears.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `MODEL_MAX_TOKENS` is not a JSON object
    /// of non-negative integers or `NO_RETRY_STATUS_CODES` contains a
    /// non-numeric entry.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        Ok(Self {
            upstream_url_base: env_string("UPSTREAM_URL_BASE", &defaults.upstream_url_base),
            port: env_parse("PORT", defaults.port),
            debug_mode: env_parse("DEBUG_MODE", defaults.debug_mode),
            max_consecutive_retries: env_parse(
                "MAX_CONSECUTIVE_RETRIES",
                defaults.max_consecutive_retries,
            ),
            retry_delay: Duration::from_millis(env_parse("RETRY_DELAY_MS", 750)),
            swallow_thoughts_after_retry: env_parse(
                "SWALLOW_THOUGHTS_AFTER_RETRY",
                defaults.swallow_thoughts_after_retry,
            ),
            enable_rate_limit: env_parse("ENABLE_RATE_LIMIT", defaults.enable_rate_limit),
            rate_limit_count: env_parse("RATE_LIMIT_COUNT", defaults.rate_limit_count),
            rate_limit_window: Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECONDS", 60)),
            enable_punctuation_heuristic: env_parse(
                "ENABLE_PUNCTUATION_HEURISTIC",
                defaults.enable_punctuation_heuristic,
            ),
            model_max_tokens: parse_model_max_tokens(env::var("MODEL_MAX_TOKENS").ok())?,
            token_limit_exceeded_code: env_parse(
                "TOKEN_LIMIT_EXCEEDED_CODE",
                defaults.token_limit_exceeded_code,
            ),
            token_limit_exceeded_message: env_string(
                "TOKEN_LIMIT_EXCEEDED_MESSAGE",
                &defaults.token_limit_exceeded_message,
            ),
            no_retry_status_codes: parse_no_retry_codes(env::var("NO_RETRY_STATUS_CODES").ok())?,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(value) if !value.is_empty() => value.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn parse_model_max_tokens(raw: Option<String>) -> Result<FxHashMap<String, u64>, ConfigError> {
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return Ok(FxHashMap::default());
    };

    let parsed: serde_json::Value =
        serde_json::from_str(&raw).map_err(|err| ConfigError::Parse {
            var: "MODEL_MAX_TOKENS".to_string(),
            message: err.to_string(),
        })?;
    let Some(object) = parsed.as_object() else {
        return Err(ConfigError::Parse {
            var: "MODEL_MAX_TOKENS".to_string(),
            message: "expected a JSON object of model -> token cap".to_string(),
        });
    };

    let mut caps = FxHashMap::default();
    for (model, cap) in object {
        let Some(cap) = cap.as_u64() else {
            return Err(ConfigError::Parse {
                var: "MODEL_MAX_TOKENS".to_string(),
                message: format!("cap for '{model}' must be a non-negative integer"),
            });
        };
        caps.insert(model.clone(), cap);
    }
    Ok(caps)
}

fn parse_no_retry_codes(raw: Option<String>) -> Result<FxHashSet<u16>, ConfigError> {
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return Ok(DEFAULT_NO_RETRY_STATUS_CODES.into_iter().collect());
    };

    let mut codes = FxHashSet::default();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let code = entry.parse::<u16>().map_err(|_| ConfigError::Parse {
            var: "NO_RETRY_STATUS_CODES".to_string(),
            message: format!("'{entry}' is not an HTTP status code"),
        })?;
        codes.insert(code);
    }
    Ok(codes)
}
