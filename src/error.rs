use serde_json::{json, Value};

/// Canonical error type used across all modules.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("{message}")]
    TokenBudget { code: u16, message: String },
    #[error("Upstream error: status={status}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status code carried to the client for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::TokenBudget { code, .. } => *code,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::Transport(_) => 502,
            ProxyError::Config(_) | ProxyError::Internal(_) => 500,
        }
    }
}

/// Map an HTTP status code to the Google RPC status string used inside the
/// error envelope.
#[must_use]
pub fn google_status_for_code(code: u16) -> &'static str {
    match code {
        400 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        504 => "DEADLINE_EXCEEDED",
        _ => "UNKNOWN",
    }
}

/// Build the `{"error":{code,status,message}}` envelope for a plain error.
#[must_use]
pub fn error_body(code: u16, message: &str) -> Value {
    json!({
        "error": {
            "code": code,
            "status": google_status_for_code(code),
            "message": message,
        }
    })
}

/// Build the error envelope with an explicit `details` array.
#[must_use]
pub fn error_body_with_details(code: u16, message: &str, details: Value) -> Value {
    json!({
        "error": {
            "code": code,
            "status": google_status_for_code(code),
            "message": message,
            "details": details,
        }
    })
}

impl axum::response::IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let code = self.status_code();
        let body = error_body(code, &self.to_string());
        let status =
            http::StatusCode::from_u16(code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(body)).into_response()
    }
}
