use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{header, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

use crate::api::{health, json_error_response, passthrough, streaming};
use crate::state::AppState;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

/// Dispatch a raw HTTP request to the matching handler.
///
/// Rate limiting runs first so a saturated key delays every path equally.
/// Streaming POSTs get the supervised SSE pipeline; everything else is
/// passed through to the upstream verbatim.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, request_body) = request.into_parts();

    if state.config.enable_rate_limit {
        if let Some(api_key) = client_api_key(&parts.headers) {
            tracing::debug!("enforcing rate limit for client key");
            state.rate_limiter.acquire(&api_key).await;
        }
    }

    if parts.method == Method::OPTIONS {
        return Ok(cors_preflight_response());
    }

    if parts.method == Method::GET && matches!(parts.uri.path(), "/health" | "/healthz") {
        return Ok(health::health_response());
    }

    if parts.method == Method::POST && is_streaming_request(&parts.uri) {
        let body_bytes = match read_request_body(request_body).await {
            Ok(bytes) => bytes,
            Err(response) => return Ok(response),
        };
        return Ok(streaming::handle_streaming_post(state, &parts, body_bytes).await);
    }

    let body_bytes = if matches!(parts.method, Method::GET | Method::HEAD) {
        None
    } else {
        match read_request_body(request_body).await {
            Ok(bytes) => Some(bytes),
            Err(response) => return Ok(response),
        }
    };
    Ok(passthrough::handle_passthrough(state, &parts, body_bytes).await)
}

/// A request is streamed when its lowercased path mentions `stream` or
/// `sse`, or when the query selects `alt=sse`.
#[must_use]
pub fn is_streaming_request(uri: &Uri) -> bool {
    let path = uri.path().to_ascii_lowercase();
    if path.contains("stream") || path.contains("sse") {
        return true;
    }
    uri.query()
        .is_some_and(|query| query.split('&').any(|pair| pair == "alt=sse"))
}

/// The API key used for rate limiting: `x-goog-api-key`, or the bearer
/// token from `authorization`.
#[must_use]
pub fn client_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-goog-api-key")
        .and_then(|value| value.to_str().ok())
    {
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(ToString::to_string)
}

fn cors_preflight_response() -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Goog-Api-Key"),
    );
    response
}

async fn read_request_body(request_body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(request_body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| json_error_response(413, "Request body too large (max 2MiB)"))
}
