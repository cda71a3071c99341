use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Liveness probe served at `/health` and `/healthz`.
#[must_use]
pub fn health_response() -> Response {
    axum::Json(json!({
        "status": "ok",
        "service": "antiblock-rs",
    }))
    .into_response()
}
