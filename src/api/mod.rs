pub mod dispatch;
pub mod health;
pub mod passthrough;
pub mod streaming;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::error::{error_body, error_body_with_details, google_status_for_code};

/// Build a Google-envelope JSON error response with CORS opened up.
pub(crate) fn json_error_response(code: u16, message: &str) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, axum::Json(error_body(code, message))).into_response();
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// Turn a non-200 upstream reply into the client-facing JSON error.
///
/// An upstream JSON body is mirrored, with `error.status` filled in from the
/// code table when absent. Anything else is wrapped in a synthesized
/// envelope carrying the raw upstream text.
pub(crate) fn upstream_error_response(status: u16, body: &[u8]) -> Response {
    let http_status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    if let Ok(mut payload) = serde_json::from_slice::<Value>(body) {
        if let Some(error_obj) = payload.get_mut("error").and_then(Value::as_object_mut) {
            if !error_obj.contains_key("status") {
                if let Some(code) = error_obj.get("code").and_then(Value::as_u64) {
                    error_obj.insert(
                        "status".to_string(),
                        Value::String(google_status_for_code(code as u16).to_string()),
                    );
                }
            }
        }
        let mut response = (http_status, axum::Json(payload)).into_response();
        response.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("*"),
        );
        return response;
    }

    let message = if status == 429 {
        "Resource has been exhausted (e.g. check quota)."
    } else {
        "Request failed"
    };
    let payload = error_body_with_details(
        status,
        message,
        json!([{
            "@type": "proxy.upstream",
            "body": String::from_utf8_lossy(body),
        }]),
    );
    let mut response = (http_status, axum::Json(payload)).into_response();
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}
