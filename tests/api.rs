use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

use chatbridge::app::{AppState, RuntimeConfig, build_app, load_state_with};
use chatbridge::reasoning::{ReasoningCompat, ReasoningEffort, ReasoningSummary};
use chatbridge::settings::Settings;

#[derive(Default)]
struct UpstreamLog {
    bodies: Vec<Value>,
    headers: Vec<(String, String)>,
}

struct TestContext {
    router: Router,
    log: Arc<Mutex<UpstreamLog>>,
    _home: TempDir,
}

fn sse_body(events: &[Value]) -> String {
    let mut out = String::new();
    for evt in events {
        out.push_str(&format!("data: {evt}\n\n"));
    }
    out.push_str("data: [DONE]\n\n");
    out
}

fn input_text(body: &Value) -> String {
    serde_json::to_string(body.get("input").unwrap_or(&Value::Null)).unwrap_or_default()
}

fn has_web_search_tool(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| {
            tools.iter().any(|t| {
                matches!(
                    t.get("type").and_then(Value::as_str),
                    Some("web_search") | Some("web_search_preview")
                )
            })
        })
}

async fn mock_responses(
    axum::extract::State(log): axum::extract::State<Arc<Mutex<UpstreamLog>>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> axum::response::Response {
    {
        let mut log = log.lock().unwrap();
        for name in ["authorization", "chatgpt-account-id", "session_id"] {
            if let Some(v) = headers.get(name).and_then(|h| h.to_str().ok()) {
                log.headers.push((name.to_string(), v.to_string()));
            }
        }
        log.bodies.push(body.clone());
    }

    let text = input_text(&body);

    if text.contains("always fail") || (has_web_search_tool(&body) && !text.contains("keep tools"))
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "message": "tools rejected by upstream" } })),
        )
            .into_response();
    }

    let events: Vec<Value> = if text.contains("reason please") {
        vec![
            json!({ "type": "response.created", "response": { "id": "resp_mock" } }),
            json!({ "type": "response.reasoning_summary_part.added" }),
            json!({ "type": "response.reasoning_summary_text.delta", "delta": "thinking" }),
            json!({ "type": "response.output_text.delta", "delta": "answer" }),
            json!({ "type": "response.completed", "response": { "id": "resp_mock" } }),
        ]
    } else if text.contains("fail stream") {
        vec![
            json!({ "type": "response.created", "response": { "id": "resp_mock" } }),
            json!({
                "type": "response.failed",
                "response": { "error": { "message": "upstream exploded" } },
            }),
        ]
    } else if text.contains("call a tool") {
        vec![
            json!({ "type": "response.created", "response": { "id": "resp_mock" } }),
            json!({
                "type": "response.output_item.done",
                "item": {
                    "type": "function_call",
                    "call_id": "call_1",
                    "name": "lookup",
                    "arguments": "{\"q\":\"x\"}",
                },
            }),
            json!({ "type": "response.completed", "response": { "id": "resp_mock" } }),
        ]
    } else {
        vec![
            json!({ "type": "response.created", "response": { "id": "resp_mock" } }),
            json!({ "type": "response.output_text.delta", "delta": "Hel" }),
            json!({ "type": "response.output_text.delta", "delta": "lo" }),
            json!({
                "type": "response.completed",
                "response": {
                    "id": "resp_mock",
                    "usage": { "input_tokens": 1, "output_tokens": 2, "total_tokens": 3 },
                },
            }),
        ]
    };

    (
        [(CONTENT_TYPE, "text/event-stream")],
        sse_body(&events),
    )
        .into_response()
}

async fn start_mock_upstream() -> (SocketAddr, Arc<Mutex<UpstreamLog>>) {
    let log = Arc::new(Mutex::new(UpstreamLog::default()));
    let router = Router::new()
        .route("/responses", post(mock_responses))
        .with_state(Arc::clone(&log));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, log)
}

fn settings_for(home: &TempDir, upstream: SocketAddr) -> Settings {
    Settings {
        reasoning_effort: ReasoningEffort::Medium,
        reasoning_summary: ReasoningSummary::Auto,
        reasoning_compat: ReasoningCompat::ThinkTags,
        debug_model: None,
        expose_reasoning_models: false,
        default_web_search: false,
        base_instructions: "base instructions".to_string(),
        codex_instructions: None,
        client_id: "app_test".to_string(),
        oauth_token_url: format!("http://{upstream}/oauth/token"),
        authorize_url: format!("http://{upstream}/oauth/authorize"),
        responses_url: format!("http://{upstream}/responses"),
        home: home.path().to_path_buf(),
        ollama_version: "0.12.10".to_string(),
    }
}

fn write_test_credentials(home: &TempDir) {
    let record = json!({
        "tokens": {
            "access_token": "test-token",
            "account_id": "acc_123",
        },
        "last_refresh": chrono::Utc::now().to_rfc3339(),
    });
    std::fs::write(
        home.path().join("auth.json"),
        serde_json::to_string_pretty(&record).unwrap(),
    )
    .unwrap();
}

async fn setup() -> TestContext {
    setup_with(true).await
}

async fn setup_with(credentials: bool) -> TestContext {
    let (addr, log) = start_mock_upstream().await;
    let home = TempDir::new().unwrap();
    if credentials {
        write_test_credentials(&home);
    }
    let settings = settings_for(&home, addr);
    let state: AppState = load_state_with(
        RuntimeConfig {
            listen: "127.0.0.1:0".to_string(),
        },
        settings,
    )
    .unwrap();
    TestContext {
        router: build_app(state),
        log,
        _home: home,
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_frames(raw: &str) -> Vec<Value> {
    raw.lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter(|d| *d != "[DONE]")
        .map(|d| serde_json::from_str(d).unwrap())
        .collect()
}

fn delta_contents(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| {
            f["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string)
        })
        .collect()
}

#[tokio::test]
async fn chat_completion_aggregates_upstream_stream() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({ "model": "gpt-5", "messages": [{ "role": "user", "content": "hi" }] }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["id"], "resp_mock");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-5");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 3);
}

#[tokio::test]
async fn chat_completion_streams_chunks_and_done_marker() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "stream": true,
            "messages": [{ "role": "user", "content": "hi" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let raw = body_string(resp).await;
    assert!(raw.trim_end().ends_with("data: [DONE]"));

    let frames = sse_frames(&raw);
    assert_eq!(delta_contents(&frames), vec!["Hel", "lo"]);
    assert!(frames.iter().all(|f| f["object"] == "chat.completion.chunk"));
    assert!(
        frames
            .iter()
            .any(|f| f["choices"][0]["finish_reason"] == "stop")
    );
}

#[tokio::test]
async fn think_tags_bracket_streamed_reasoning() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "stream": true,
            "messages": [{ "role": "user", "content": "reason please" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let raw = body_string(resp).await;
    let contents = delta_contents(&sse_frames(&raw));
    assert_eq!(contents, vec!["<think>", "thinking", "</think>", "answer"]);
}

#[tokio::test]
async fn streamed_tool_call_sets_tool_calls_finish_reason() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "stream": true,
            "messages": [{ "role": "user", "content": "call a tool" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let frames = sse_frames(&body_string(resp).await);

    let tool_frame = frames
        .iter()
        .find(|f| f["choices"][0]["delta"]["tool_calls"].is_array())
        .expect("tool call frame");
    assert_eq!(
        tool_frame["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
        "lookup"
    );
    assert!(
        frames
            .iter()
            .any(|f| f["choices"][0]["finish_reason"] == "tool_calls")
    );
}

#[tokio::test]
async fn usage_frame_emitted_when_requested() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "stream": true,
            "stream_options": { "include_usage": true },
            "messages": [{ "role": "user", "content": "hi" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let frames = sse_frames(&body_string(resp).await);
    let usage = frames
        .iter()
        .find(|f| f.get("usage").is_some())
        .expect("usage frame");
    assert_eq!(usage["usage"]["prompt_tokens"], 1);
    assert_eq!(usage["usage"]["completion_tokens"], 2);
}

#[tokio::test]
async fn failed_stream_surfaces_error_frame_then_done() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "stream": true,
            "messages": [{ "role": "user", "content": "fail stream" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let raw = body_string(resp).await;
    let frames = sse_frames(&raw);
    assert_eq!(frames.last().unwrap()["error"]["message"], "upstream exploded");
    assert!(raw.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn unsupported_responses_tool_never_reaches_upstream() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "messages": [{ "role": "user", "content": "hi" }],
            "responses_tools": [{ "type": "code_interpreter" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "RESPONSES_TOOL_UNSUPPORTED");
    assert_eq!(ctx.log.lock().unwrap().bodies.len(), 0);
}

#[tokio::test]
async fn rejected_passthrough_tools_retry_once_without_them() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "messages": [{ "role": "user", "content": "hi" }],
            "responses_tools": [{ "type": "web_search" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");

    let log = ctx.log.lock().unwrap();
    assert_eq!(log.bodies.len(), 2);
    assert!(has_web_search_tool(&log.bodies[0]));
    assert!(!has_web_search_tool(&log.bodies[1]));
}

#[tokio::test]
async fn retry_failure_carries_rejection_code() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "messages": [{ "role": "user", "content": "always fail" }],
            "responses_tools": [{ "type": "web_search" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "RESPONSES_TOOLS_REJECTED");
    assert_eq!(body["error"]["message"], "tools rejected by upstream");
    assert_eq!(ctx.log.lock().unwrap().bodies.len(), 2);
}

#[tokio::test]
async fn missing_credentials_is_unauthorized() {
    let ctx = setup_with(false).await;
    let req = post_json(
        "/v1/chat/completions",
        json!({ "model": "gpt-5", "messages": [{ "role": "user", "content": "hi" }] }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(resp).await;
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Missing credentials")
    );
    assert_eq!(ctx.log.lock().unwrap().bodies.len(), 0);
}

#[tokio::test]
async fn upstream_call_carries_credential_headers() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header("x-session-id", "sess_fixed")
        .body(Body::from(
            json!({ "model": "gpt-5", "messages": [{ "role": "user", "content": "hi" }] })
                .to_string(),
        ))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let log = ctx.log.lock().unwrap();
    assert!(
        log.headers
            .contains(&("authorization".into(), "Bearer test-token".into()))
    );
    assert!(
        log.headers
            .contains(&("chatgpt-account-id".into(), "acc_123".into()))
    );
    assert!(log.headers.contains(&("session_id".into(), "sess_fixed".into())));

    let body = &log.bodies[0];
    assert_eq!(body["prompt_cache_key"], "sess_fixed");
    assert_eq!(body["store"], false);
    assert_eq!(body["stream"], true);
    assert_eq!(body["model"], "gpt-5");
    assert_eq!(body["reasoning"]["effort"], "medium");
}

#[tokio::test]
async fn effort_suffix_model_maps_upstream_and_echoes_back() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({ "model": "gpt-5-high", "messages": [{ "role": "user", "content": "hi" }] }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["model"], "gpt-5-high");

    let log = ctx.log.lock().unwrap();
    assert_eq!(log.bodies[0]["model"], "gpt-5");
    assert_eq!(log.bodies[0]["reasoning"]["effort"], "high");
}

#[tokio::test]
async fn explicit_unsupported_effort_is_rejected() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/chat/completions",
        json!({
            "model": "gpt-5",
            "messages": [{ "role": "user", "content": "hi" }],
            "reasoning": { "effort": "xhigh" },
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(ctx.log.lock().unwrap().bodies.len(), 0);
}

#[tokio::test]
async fn text_completion_round_trip() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/completions",
        json!({ "model": "gpt-5", "prompt": "hi" }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["object"], "text_completion");
    assert_eq!(body["choices"][0]["text"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
}

#[tokio::test]
async fn responses_passthrough_aggregates_non_streaming() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/responses",
        json!({
            "model": "gpt-5",
            "input": [{
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": "hi" }],
            }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["object"], "response");
    assert_eq!(body["id"], "resp_mock");
    assert_eq!(body["status"], "completed");
    assert_eq!(body["output"][0]["content"][0]["text"], "Hello");

    let log = ctx.log.lock().unwrap();
    let instructions = log.bodies[0]["instructions"].as_str().unwrap();
    assert!(instructions.starts_with("base instructions"));
}

#[tokio::test]
async fn responses_passthrough_merges_requested_instructions() {
    let ctx = setup().await;
    let req = post_json(
        "/v1/responses",
        json!({
            "model": "gpt-5",
            "instructions": "be brief",
            "input": [{
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_text", "text": "hi" }],
            }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let log = ctx.log.lock().unwrap();
    assert_eq!(
        log.bodies[0]["instructions"],
        "base instructions\n\nbe brief"
    );
}

#[tokio::test]
async fn model_listing_has_openai_shape() {
    let ctx = setup().await;
    let req = Request::builder()
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["id"].as_str())
        .collect();
    assert!(ids.contains(&"gpt-5"));
}

#[tokio::test]
async fn ollama_tags_and_version() {
    let ctx = setup().await;

    let resp = ctx
        .router
        .clone()
        .oneshot(Request::builder().uri("/api/tags").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert!(body["models"].as_array().unwrap().len() > 0);
    assert!(body["models"][0]["details"]["format"] == "gguf");

    let resp = ctx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/version")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["version"], "0.12.10");
}

#[tokio::test]
async fn ollama_chat_non_streaming_returns_final_message() {
    let ctx = setup().await;
    let req = post_json(
        "/api/chat",
        json!({
            "model": "gpt-5",
            "stream": false,
            "messages": [{ "role": "user", "content": "hi" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    assert_eq!(body["message"]["content"], "Hello");
    assert_eq!(body["done"], true);
    assert!(body["eval_count"].is_number());
}

#[tokio::test]
async fn ollama_chat_streams_ndjson_frames() {
    let ctx = setup().await;
    let req = post_json(
        "/api/chat",
        json!({
            "model": "gpt-5",
            "messages": [{ "role": "user", "content": "hi" }],
        }),
    );
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(CONTENT_TYPE).unwrap(),
        "application/x-ndjson"
    );

    let raw = body_string(resp).await;
    let frames: Vec<Value> = raw
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let text: String = frames
        .iter()
        .filter(|f| f["done"] == false)
        .filter_map(|f| f["message"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello");
    assert_eq!(frames.last().unwrap()["done"], true);
}

#[tokio::test]
async fn invalid_json_body_is_bad_request() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let ctx = setup().await;
    let resp = ctx
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
}
