use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{json, Value};

use antiblock_rs::api::dispatch::dispatch_request;
use antiblock_rs::config::Config;
use antiblock_rs::inject::DONE_INSTRUCTION;
use antiblock_rs::state::AppState;
use antiblock_rs::stream::rewrite::CONTINUATION_PROMPT;

// ---------------------------------------------------------------------------
// Mock upstream
// ---------------------------------------------------------------------------

struct MockResponse {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl MockResponse {
    fn sse(lines: &[String]) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream; charset=utf-8",
            body: lines
                .iter()
                .map(|line| format!("{line}\n\n"))
                .collect::<String>(),
        }
    }

    fn error(status: u16, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }
}

#[derive(Clone)]
struct MockUpstream {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl MockUpstream {
    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> Value {
        self.requests.lock().unwrap()[index].clone()
    }
}

async fn mock_handler(State(upstream): State<MockUpstream>, request: Request<Body>) -> Response {
    let body = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .expect("read mock request body");
    if let Ok(value) = serde_json::from_slice::<Value>(&body) {
        upstream.requests.lock().unwrap().push(value);
    }

    let Some(next) = upstream.responses.lock().unwrap().pop_front() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let mut response = Response::new(Body::from(next.body));
    *response.status_mut() = StatusCode::from_u16(next.status).unwrap();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        next.content_type.parse().expect("content type"),
    );
    response
}

async fn spawn_upstream(responses: Vec<MockResponse>) -> (String, MockUpstream) {
    let upstream = MockUpstream {
        responses: Arc::new(Mutex::new(responses.into_iter().collect())),
        requests: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .fallback(mock_handler)
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve mock upstream");
    });
    (format!("http://{addr}"), upstream)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn build_state(base_url: &str, tweak: impl FnOnce(&mut Config)) -> Arc<AppState> {
    let mut config = Config {
        upstream_url_base: base_url.to_string(),
        retry_delay: Duration::from_millis(1),
        ..Config::default()
    };
    tweak(&mut config);
    Arc::new(AppState::new(config))
}

fn chunk(text: &str) -> String {
    format!(
        "data: {}",
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    )
}

fn chunk_with_finish(text: &str, finish: &str) -> String {
    format!(
        "data: {}",
        json!({
            "candidates": [{
                "content": { "parts": [{ "text": text }] },
                "finishReason": finish,
            }]
        })
    )
}

fn thought(text: &str) -> String {
    format!(
        "data: {}",
        json!({
            "candidates": [{ "content": { "parts": [{ "text": text, "thought": true }] } }]
        })
    )
}

fn generation_request() -> Value {
    json!({ "contents": [{ "role": "user", "parts": [{ "text": "tell me a story" }] }] })
}

async fn post_streaming(state: Arc<AppState>, body: &Value) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri("/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-goog-api-key", "test-key")
        .body(Body::from(body.to_string()))
        .expect("build request");
    dispatch_request(state, request).await.expect("dispatch")
}

async fn collect_body(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect response body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

fn sse_data_texts(raw: &str) -> Vec<String> {
    raw.split("\n\n")
        .filter(|frame| frame.starts_with("data: "))
        .map(|frame| {
            let payload: Value =
                serde_json::from_str(frame.trim_start_matches("data: ")).expect("frame JSON");
            payload["candidates"][0]["content"]["parts"][0]["text"]
                .as_str()
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

fn sse_error_payload(raw: &str) -> Option<Value> {
    raw.split("\n\n")
        .find(|frame| frame.starts_with("event: error\ndata: "))
        .map(|frame| {
            serde_json::from_str(frame.trim_start_matches("event: error\ndata: "))
                .expect("error payload JSON")
        })
}

// ---------------------------------------------------------------------------
// Streaming scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_happy_path_stream_is_forwarded_with_marker_stripped() {
    let (base_url, upstream) = spawn_upstream(vec![MockResponse::sse(&[
        chunk("Hello, "),
        chunk("world"),
        chunk_with_finish("![done]", "STOP"),
    ])])
    .await;
    let state = build_state(&base_url, |_| {});

    let response = post_streaming(state, &generation_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream; charset=utf-8"
    );
    assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");

    let body = collect_body(response).await;
    assert_eq!(sse_data_texts(&body), vec!["Hello, ", "world", "!"]);
    assert!(!body.contains("[done]"));
    assert_eq!(upstream.request_count(), 1);
}

#[tokio::test]
async fn test_system_instruction_is_injected_upstream() {
    let (base_url, upstream) = spawn_upstream(vec![MockResponse::sse(&[chunk_with_finish(
        "Done.[done]",
        "STOP",
    )])])
    .await;
    let state = build_state(&base_url, |_| {});

    let body = json!({
        "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
        "systemInstruction": { "parts": [{ "text": "Answer briefly." }] }
    });
    let response = post_streaming(state, &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let _ = collect_body(response).await;

    let seen = upstream.request(0);
    let parts = seen["systemInstruction"]["parts"].as_array().unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0]["text"], "Answer briefly.");
    assert_eq!(parts[1]["text"], DONE_INSTRUCTION);
    // The conversation itself is untouched.
    assert_eq!(seen["contents"], body["contents"]);
}

#[tokio::test]
async fn test_missing_marker_is_continued_transparently() {
    let (base_url, upstream) = spawn_upstream(vec![
        MockResponse::sse(&[chunk("The quick brown"), chunk_with_finish("", "STOP")]),
        MockResponse::sse(&[chunk_with_finish(" fox jumps.[done]", "STOP")]),
    ])
    .await;
    let state = build_state(&base_url, |_| {});

    let response = post_streaming(state, &generation_request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = collect_body(response).await;

    assert_eq!(
        sse_data_texts(&body),
        vec!["The quick brown", " fox jumps."]
    );
    assert!(sse_error_payload(&body).is_none());
    assert_eq!(upstream.request_count(), 2);

    // The continuation presents the delivered text as a prior model turn.
    let continuation = upstream.request(1);
    let contents = continuation["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 3);
    assert_eq!(contents[1]["role"], "model");
    assert_eq!(contents[1]["parts"][0]["text"], "The quick brown");
    assert_eq!(contents[2]["role"], "user");
    assert_eq!(contents[2]["parts"][0]["text"], CONTINUATION_PROMPT);
}

#[tokio::test]
async fn test_safety_block_is_recovered_and_not_forwarded() {
    let blocked = format!(
        "data: {}",
        json!({ "promptFeedback": { "blockReason": "SAFETY" } })
    );
    let (base_url, upstream) = spawn_upstream(vec![
        MockResponse::sse(&[chunk("Let me explain: "), blocked]),
        MockResponse::sse(&[chunk_with_finish("…the topic carefully.[done]", "STOP")]),
    ])
    .await;
    let state = build_state(&base_url, |_| {});

    let body = collect_body(post_streaming(state, &generation_request()).await).await;
    assert_eq!(
        sse_data_texts(&body),
        vec!["Let me explain: ", "…the topic carefully."]
    );
    assert!(!body.contains("blockReason"));
    assert_eq!(upstream.request_count(), 2);
}

#[tokio::test]
async fn test_thoughts_after_retry_are_swallowed() {
    let (base_url, upstream) = spawn_upstream(vec![
        MockResponse::sse(&[chunk("Formal ")]),
        MockResponse::sse(&[
            thought("let me reconsider"),
            chunk_with_finish("rest.[done]", "STOP"),
        ]),
    ])
    .await;
    let state = build_state(&base_url, |_| {});

    let body = collect_body(post_streaming(state, &generation_request()).await).await;
    assert_eq!(sse_data_texts(&body), vec!["Formal ", "rest."]);
    assert!(!body.contains("reconsider"));
    assert_eq!(upstream.request_count(), 2);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_surfaces_deadline_error() {
    let (base_url, upstream) = spawn_upstream(vec![
        MockResponse::sse(&[chunk("a ")]),
        MockResponse::sse(&[chunk("b ")]),
    ])
    .await;
    let state = build_state(&base_url, |config| {
        config.max_consecutive_retries = 1;
    });

    let body = collect_body(post_streaming(state, &generation_request()).await).await;
    assert_eq!(sse_data_texts(&body), vec!["a ", "b "]);

    let payload = sse_error_payload(&body).expect("terminal error frame");
    assert_eq!(payload["error"]["code"], 504);
    assert_eq!(payload["error"]["status"], "DEADLINE_EXCEEDED");
    assert!(payload["error"]["message"].as_str().unwrap().contains("DROP"));
    assert_eq!(upstream.request_count(), 2);
}

#[tokio::test]
async fn test_non_retryable_continuation_status_forwards_upstream_error() {
    let (base_url, upstream) = spawn_upstream(vec![
        MockResponse::sse(&[chunk("partial ")]),
        MockResponse::error(404, json!({ "error": { "code": 404, "message": "gone" } })),
    ])
    .await;
    let state = build_state(&base_url, |_| {});

    let body = collect_body(post_streaming(state, &generation_request()).await).await;
    assert_eq!(sse_data_texts(&body), vec!["partial "]);

    let payload = sse_error_payload(&body).expect("forwarded error frame");
    assert_eq!(payload["error"]["code"], 404);
    assert_eq!(payload["error"]["message"], "gone");
    assert_eq!(upstream.request_count(), 2);
}

#[tokio::test]
async fn test_soft_continuation_failure_is_retried_until_success() {
    let (base_url, upstream) = spawn_upstream(vec![
        MockResponse::sse(&[chunk("a ")]),
        MockResponse::error(503, json!({ "error": { "code": 503 } })),
        MockResponse::sse(&[chunk_with_finish("b.[done]", "STOP")]),
    ])
    .await;
    let state = build_state(&base_url, |_| {});

    let body = collect_body(post_streaming(state, &generation_request()).await).await;
    assert_eq!(sse_data_texts(&body), vec!["a ", "b."]);
    assert!(sse_error_payload(&body).is_none());
    assert_eq!(upstream.request_count(), 3);
}

// ---------------------------------------------------------------------------
// Pre-stream error paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_initial_upstream_error_is_mirrored_with_status_field() {
    let (base_url, _upstream) = spawn_upstream(vec![MockResponse::error(
        429,
        json!({ "error": { "code": 429, "message": "quota exceeded" } }),
    )])
    .await;
    let state = build_state(&base_url, |_| {});

    let response = post_streaming(state, &generation_request()).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );

    let payload: Value = serde_json::from_str(&collect_body(response).await).unwrap();
    assert_eq!(payload["error"]["code"], 429);
    assert_eq!(payload["error"]["status"], "RESOURCE_EXHAUSTED");
    assert_eq!(payload["error"]["message"], "quota exceeded");
}

#[tokio::test]
async fn test_invalid_json_body_is_rejected() {
    let (base_url, upstream) = spawn_upstream(vec![]).await;
    let state = build_state(&base_url, |_| {});

    let request = Request::builder()
        .method("POST")
        .uri("/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("not json"))
        .unwrap();
    let response = dispatch_request(state, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(upstream.request_count(), 0);

    let payload: Value = serde_json::from_str(&collect_body(response).await).unwrap();
    assert_eq!(payload["error"]["status"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_token_budget_refuses_oversized_prompt() {
    let (base_url, upstream) = spawn_upstream(vec![]).await;
    let state = build_state(&base_url, |config| {
        config
            .model_max_tokens
            .insert("gemini-2.5-pro".to_string(), 1);
    });

    let body = json!({
        "contents": [{ "role": "user", "parts": [{ "text": "a prompt comfortably over one token" }] }]
    });
    let response = post_streaming(state, &body).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(upstream.request_count(), 0);

    let payload: Value = serde_json::from_str(&collect_body(response).await).unwrap();
    assert_eq!(payload["error"]["code"], 413);
}

// ---------------------------------------------------------------------------
// Non-streaming surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_non_streaming_request_passes_through_without_injection() {
    let upstream_body = json!({
        "candidates": [{
            "content": { "parts": [{ "text": "single response" }] },
            "finishReason": "STOP",
        }]
    });
    let (base_url, upstream) = spawn_upstream(vec![MockResponse {
        status: 200,
        content_type: "application/json",
        body: upstream_body.to_string(),
    }])
    .await;
    let state = build_state(&base_url, |_| {});

    let request = Request::builder()
        .method("POST")
        .uri("/v1beta/models/gemini-2.5-pro:generateContent")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(generation_request().to_string()))
        .unwrap();
    let response = dispatch_request(state, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );

    let payload: Value = serde_json::from_str(&collect_body(response).await).unwrap();
    assert_eq!(payload, upstream_body);

    // No completion-marker instruction on the passthrough path.
    assert_eq!(upstream.request_count(), 1);
    assert!(upstream.request(0).get("systemInstruction").is_none());
}

#[tokio::test]
async fn test_health_endpoint() {
    let (base_url, _upstream) = spawn_upstream(vec![]).await;
    let state = build_state(&base_url, |_| {});

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = dispatch_request(state, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let payload: Value = serde_json::from_str(&collect_body(response).await).unwrap();
    assert_eq!(payload["status"], "ok");
}

#[tokio::test]
async fn test_cors_preflight_is_answered_locally() {
    let (base_url, upstream) = spawn_upstream(vec![]).await;
    let state = build_state(&base_url, |_| {});

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/v1beta/models/gemini-2.5-pro:streamGenerateContent")
        .body(Body::empty())
        .unwrap();
    let response = dispatch_request(state, request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
    assert_eq!(upstream.request_count(), 0);
}
