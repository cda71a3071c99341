use std::sync::Arc;

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::{json_error_response, upstream_error_response};
use crate::inject::inject_done_instruction;
use crate::limits::check_token_budget;
use crate::state::AppState;
use crate::stream::sse::spawn_line_reader;
use crate::stream::supervisor::{
    process_stream, ClientSink, ContinuationFailure, SupervisorSettings,
};
use crate::transport::whitelisted_headers;

/// Capacity of the channel backing the client response body.
const CLIENT_FRAME_CHANNEL_CAPACITY: usize = 32;

/// Handle a streaming generation POST: admission checks, marker injection,
/// the initial upstream request, then hand the connection to the stream
/// supervisor.
pub async fn handle_streaming_post(
    state: Arc<AppState>,
    parts: &Parts,
    body_bytes: Bytes,
) -> Response {
    let request_id = uuid::Uuid::new_v4();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path(), |pq| pq.as_str());
    let upstream_url = format!("{}{}", state.config.upstream_url_base, path_and_query);

    tracing::info!(
        %request_id,
        path = parts.uri.path(),
        upstream_url,
        "new streaming request"
    );

    let Ok(mut request_body) = serde_json::from_slice::<Map<String, Value>>(&body_bytes) else {
        return json_error_response(400, "Invalid JSON in request body");
    };

    if let Err(err) = check_token_budget(&state.config, parts.uri.path(), &request_body) {
        return err.into_response();
    }

    inject_done_instruction(&mut request_body);
    let injected_bytes = match serde_json::to_vec(&Value::Object(request_body.clone())) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            tracing::error!(%request_id, error = %err, "failed to serialize injected body");
            return json_error_response(500, "Failed to process request body");
        }
    };

    let upstream_headers = whitelisted_headers(&parts.headers);
    let initial_response = match state
        .upstream
        .post_stream(&upstream_url, upstream_headers.clone(), injected_bytes)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(%request_id, error = %err, "initial upstream request failed");
            return json_error_response(502, "Failed to connect to upstream server");
        }
    };

    let status = initial_response.status().as_u16();
    if status != 200 {
        tracing::error!(%request_id, status, "initial upstream request rejected");
        let error_bytes = initial_response.bytes().await.unwrap_or_default();
        return upstream_error_response(status, &error_bytes);
    }

    tracing::info!(%request_id, "initial upstream request succeeded, starting stream supervision");

    let settings = SupervisorSettings {
        max_retries: state.config.max_consecutive_retries,
        retry_delay: state.config.retry_delay,
        swallow_thoughts_after_retry: state.config.swallow_thoughts_after_retry,
        punctuation_heuristic: state.config.enable_punctuation_heuristic,
    };
    let initial_lines = spawn_line_reader(initial_response.bytes_stream());

    let (frame_tx, frame_rx) = mpsc::channel(CLIENT_FRAME_CHANNEL_CAPACITY);
    let sink = ClientSink::new(frame_tx);

    let continuation_state = Arc::clone(&state);
    let continuation_url = upstream_url.clone();
    let continuation_headers = upstream_headers;
    tokio::spawn(async move {
        let open_continuation = move |body: Bytes| {
            let state = Arc::clone(&continuation_state);
            let url = continuation_url.clone();
            let headers = continuation_headers.clone();
            async move { open_continuation_stream(&state, &url, headers, body).await }
        };

        match process_stream(&settings, &request_body, initial_lines, &sink, open_continuation)
            .await
        {
            Ok(()) => tracing::info!(%request_id, "streaming session completed"),
            Err(err) => tracing::error!(%request_id, error = %err, "streaming session failed"),
        }
    });

    sse_response(Body::from_stream(ReceiverStream::new(frame_rx)))
}

/// Issue one continuation POST and classify the outcome for the supervisor.
async fn open_continuation_stream(
    state: &AppState,
    url: &str,
    headers: http::HeaderMap,
    body: Bytes,
) -> Result<mpsc::Receiver<String>, ContinuationFailure> {
    match state.upstream.post_stream(url, headers, body).await {
        Ok(response) => {
            let status = response.status().as_u16();
            if status == 200 {
                return Ok(spawn_line_reader(response.bytes_stream()));
            }
            if state.config.no_retry_status_codes.contains(&status) {
                let body = response.bytes().await.unwrap_or_default();
                return Err(ContinuationFailure::Fatal { status, body });
            }
            Err(ContinuationFailure::Retryable(format!(
                "continuation request returned status {status}"
            )))
        }
        Err(err) => Err(ContinuationFailure::Retryable(err.to_string())),
    }
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    // Disable response buffering in intermediary proxies.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    response
}
