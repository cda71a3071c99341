use std::sync::Arc;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;

use crate::api::{json_error_response, upstream_error_response};
use crate::state::AppState;
use crate::transport::whitelisted_headers;

/// Forward a non-streaming request to the upstream verbatim.
///
/// Successful responses are mirrored, headers included, with CORS opened
/// up; non-200 responses are normalized into the Google-style envelope.
pub async fn handle_passthrough(
    state: Arc<AppState>,
    parts: &Parts,
    body: Option<Bytes>,
) -> Response {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let upstream_url = format!("{}{}", state.config.upstream_url_base, path_and_query);

    tracing::debug!(method = %parts.method, upstream_url, "forwarding non-streaming request");

    let upstream_headers = whitelisted_headers(&parts.headers);
    let upstream_response = match state
        .upstream
        .forward(&parts.method, &upstream_url, upstream_headers, body)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "passthrough upstream request failed");
            return json_error_response(502, "Failed to connect to upstream server");
        }
    };

    let status = upstream_response.status().as_u16();
    if status != 200 {
        let error_bytes = upstream_response.bytes().await.unwrap_or_default();
        return upstream_error_response(status, &error_bytes);
    }

    let mut response_headers =
        http::HeaderMap::with_capacity(upstream_response.headers().len() + 1);
    for (name, value) in upstream_response.headers() {
        // Framing is re-established by this server's own connection.
        if name == header::CONNECTION
            || name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
        {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }
    response_headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );

    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = response_headers;
    response
}
