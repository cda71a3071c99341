//! Scripted generateContent upstream for manual proxy testing.
//!
//! Each `/type-N` path prefix selects a failure scenario the proxy should
//! recover from:
//!   type-1: thought prelude, then text that never carries the completion marker
//!   type-2: completion marker split across the final two chunks
//!   type-3: empty response with an immediate STOP

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_PORT: u16 = 8081;
const CHUNK_DELAY: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() {
    let port = std::env::var("MOCK_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let app = Router::new().fallback(handle);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));

    println!("mock upstream listening on 127.0.0.1:{port}");
    println!("scenarios: /type-1 (missing marker), /type-2 (split marker), /type-3 (empty)");
    axum::serve(listener, app).await.expect("serve failed");
}

async fn handle(request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or_default().to_string();

    if path == "/health" || path == "/healthz" {
        return axum::Json(json!({ "status": "ok", "service": "mock-upstream" })).into_response();
    }

    let streaming = path.to_ascii_lowercase().contains("stream")
        || query.split('&').any(|pair| pair == "alt=sse");
    let scenario = scenario_from_path(&path);

    if streaming {
        stream_response(scenario)
    } else {
        axum::Json(json!({
            "candidates": [{
                "content": { "parts": [{ "text": format!("non-streaming scenario {scenario}") }] },
                "finishReason": "STOP",
            }]
        }))
        .into_response()
    }
}

fn scenario_from_path(path: &str) -> u8 {
    for scenario in 1..=3 {
        if path.contains(&format!("/type-{scenario}")) {
            return scenario;
        }
    }
    1
}

fn stream_response(scenario: u8) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
    tokio::spawn(async move {
        for line in scenario_frames(scenario) {
            if tx.send(Ok(line)).await.is_err() {
                return;
            }
            tokio::time::sleep(CHUNK_DELAY).await;
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

fn scenario_frames(scenario: u8) -> Vec<Bytes> {
    match scenario {
        2 => {
            let mut frames = vec![
                thought_frame("Analyzing the request and preparing a response..."),
                text_frame("This scenario splits the completion marker ", None),
                text_frame("across the final two chunks: ", None),
                text_frame("[do", None),
            ];
            frames.push(text_frame("ne]", Some("STOP")));
            frames
        }
        3 => vec![text_frame("", Some("STOP"))],
        _ => vec![
            thought_frame("Let me think about this question..."),
            thought_frame("I need to consider several aspects."),
            text_frame("Here is a streamed answer that arrives in pieces ", None),
            text_frame("and deliberately never carries the completion marker, ", None),
            text_frame("so the proxy treats the stop as premature.", Some("STOP")),
        ],
    }
}

fn text_frame(text: &str, finish: Option<&str>) -> Bytes {
    let mut candidate = json!({
        "content": { "parts": [{ "text": text }] }
    });
    if let Some(finish) = finish {
        candidate["finishReason"] = Value::String(finish.to_string());
    }
    sse_line(&json!({ "candidates": [candidate] }))
}

fn thought_frame(text: &str) -> Bytes {
    sse_line(&json!({
        "candidates": [{ "content": { "parts": [{ "text": text, "thought": true }] } }]
    }))
}

fn sse_line(payload: &Value) -> Bytes {
    Bytes::from(format!("data: {payload}\n\n"))
}
