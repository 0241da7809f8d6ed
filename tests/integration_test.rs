//! End-to-end tests: a real proxy instance talking to an in-process mock
//! upstream, both on ephemeral ports.

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use model_router::{build_router, ApiFlavor, AppState, RouterConfig, UpstreamClient};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn spawn(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_proxy(upstream_base: &str, config_tweak: impl FnOnce(&mut RouterConfig)) -> String {
    let mut config = RouterConfig {
        upstream_base_url: format!("{upstream_base}/v1"),
        ..RouterConfig::default()
    };
    config_tweak(&mut config);

    let upstream =
        UpstreamClient::new(&config.upstream_base_url, Duration::from_secs(5)).unwrap();
    let state = Arc::new(AppState { config, upstream });
    spawn(build_router(state)).await
}

fn sse_response(body: &'static str) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(Body::from(body))
        .unwrap()
}

/// Collect `(event, data)` pairs from an SSE body, skipping comments and
/// keep-alive frames.
fn parse_sse(body: &str) -> Vec<(String, serde_json::Value)> {
    let mut events = Vec::new();
    let mut current = String::new();
    for line in body.lines() {
        if let Some(name) = line.strip_prefix("event: ") {
            current = name.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                events.push((current.clone(), value));
            }
        }
    }
    events
}

fn event_names(events: &[(String, serde_json::Value)]) -> Vec<&str> {
    events.iter().map(|(name, _)| name.as_str()).collect()
}

// ────────────────────────────────────────────────────────────────
// Non-streaming
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn plain_text_non_streaming_round_trip() {
    let mock = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            Json(serde_json::json!({
                "id": "chatcmpl-9",
                "model": "gpt-4o-mini",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1}
            }))
        }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{proxy_url}/v1/messages"))
        .header("Authorization", "Bearer test-key")
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
            "stream": false
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["id"], "msg_chatcmpl-9");
    assert_eq!(body["model"], "gpt-4o-mini");
    assert_eq!(
        body["content"],
        serde_json::json!([{"type": "text", "text": "hello"}])
    );
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 1);
    assert_eq!(body["usage"]["output_tokens"], 1);
}

#[tokio::test]
async fn tool_history_projects_onto_chat_messages() {
    let captured: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
    let captured_clone = captured.clone();

    let mock = Router::new().route(
        "/v1/chat/completions",
        post(move |body: Bytes| {
            let captured = captured_clone.clone();
            async move {
                *captured.lock().unwrap() = serde_json::from_slice(&body).ok();
                Json(serde_json::json!({
                    "id": "chatcmpl-t",
                    "model": "gpt-4o-mini",
                    "choices": [{
                        "message": {"role": "assistant", "content": "done"},
                        "finish_reason": "stop"
                    }]
                }))
            }
        }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "test-key")
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 64,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "f", "input": {"x": 1}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "42"}
                ]}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let sent = captured.lock().unwrap().clone().unwrap();
    let messages = sent["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "assistant");
    assert_eq!(messages[0]["tool_calls"][0]["id"], "t1");
    assert_eq!(messages[0]["tool_calls"][0]["function"]["name"], "f");
    assert_eq!(
        messages[0]["tool_calls"][0]["function"]["arguments"],
        "{\"x\":1}"
    );
    assert_eq!(messages[1]["role"], "tool");
    assert_eq!(messages[1]["tool_call_id"], "t1");
    assert_eq!(messages[1]["content"], "42");
}

#[tokio::test]
async fn upstream_error_maps_to_anthropic_envelope() {
    let mock = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "error": {"message": "Rate limit reached", "type": "rate_limit_exceeded"}
                })),
            )
        }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "k")
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 8,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 429);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["message"], "Rate limit reached");
}

// ────────────────────────────────────────────────────────────────
// API-flavor fallback
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn wrong_flavor_retries_against_responses() {
    let chat_hits = Arc::new(AtomicUsize::new(0));
    let responses_hits = Arc::new(AtomicUsize::new(0));
    let chat_hits_clone = chat_hits.clone();
    let responses_hits_clone = responses_hits.clone();

    let mock = Router::new()
        .route(
            "/v1/chat/completions",
            post(move || {
                let hits = chat_hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({
                            "error": {"message": "This model is only supported in v1/responses."}
                        })),
                    )
                }
            }),
        )
        .route(
            "/v1/responses",
            post(move || {
                let hits = responses_hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({
                        "id": "resp_1",
                        "model": "gpt-5-mini",
                        "status": "completed",
                        "output": [{
                            "type": "message",
                            "id": "m1",
                            "role": "assistant",
                            "content": [{"type": "output_text", "text": "routed"}]
                        }],
                        "usage": {"input_tokens": 2, "output_tokens": 3}
                    }))
                }
            }),
        );
    let mock_url = spawn(mock).await;

    // Misroute gpt-5-mini to Chat so the fallback has to kick in.
    let proxy_url = spawn_proxy(&mock_url, |config| {
        config
            .flavor_overrides
            .insert("gpt-5-mini".to_string(), ApiFlavor::Chat);
    })
    .await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("Authorization", "Bearer k")
        .json(&serde_json::json!({
            "model": "gpt-5-mini",
            "max_tokens": 32,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    // The client sees exactly one response: the successful retry.
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(
        body["content"],
        serde_json::json!([{"type": "text", "text": "routed"}])
    );
    assert_eq!(body["usage"]["output_tokens"], 3);

    assert_eq!(chat_hits.load(Ordering::SeqCst), 1);
    assert_eq!(responses_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_errors_never_trigger_flavor_retry() {
    let responses_hits = Arc::new(AtomicUsize::new(0));
    let responses_hits_clone = responses_hits.clone();

    let mock = Router::new()
        .route(
            "/v1/chat/completions",
            post(|| async {
                // A 5xx whose message happens to mention the other endpoint.
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({
                        "error": {"message": "v1/responses backend temporarily unavailable"}
                    })),
                )
            }),
        )
        .route(
            "/v1/responses",
            post(move || {
                let hits = responses_hits_clone.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({}))
                }
            }),
        );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "k")
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 8,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "api_error");
    assert_eq!(responses_hits.load(Ordering::SeqCst), 0);
}

// ────────────────────────────────────────────────────────────────
// Streaming
// ────────────────────────────────────────────────────────────────

const CHAT_TEXT_STREAM: &str = "\
data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"he\"},\"finish_reason\":null}]}\n\
\n\
data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":null}]}\n\
\n\
data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2}}\n\
\n\
data: [DONE]\n\
\n";

#[tokio::test]
async fn streaming_text_produces_anthropic_event_sequence() {
    let mock = Router::new().route(
        "/v1/chat/completions",
        post(|| async { sse_response(CHAT_TEXT_STREAM) }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "k")
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(resp.headers()["cache-control"], "no-cache");

    let body = resp.text().await.unwrap();
    let events = parse_sse(&body);

    assert_eq!(
        event_names(&events),
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    assert_eq!(events[2].1["index"], 0);
    assert_eq!(events[2].1["content_block"]["type"], "text");
    assert_eq!(events[3].1["delta"]["text"], "he");
    assert_eq!(events[4].1["delta"]["text"], "llo");
    assert_eq!(events[6].1["delta"]["stop_reason"], "end_turn");
    assert_eq!(events[6].1["usage"]["output_tokens"], 2);
}

const CHAT_TOOL_STREAM: &str = "\
data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"search\",\"arguments\":\"{\\\"q\\\":\\\"\"}}]},\"finish_reason\":null}]}\n\
\n\
data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"hi\\\"}\"}}]},\"finish_reason\":null}]}\n\
\n\
data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\
\n\
data: [DONE]\n\
\n";

#[tokio::test]
async fn streaming_tool_call_carries_argument_fragments() {
    let mock = Router::new().route(
        "/v1/chat/completions",
        post(|| async { sse_response(CHAT_TOOL_STREAM) }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "k")
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 64,
            "stream": true,
            "messages": [{"role": "user", "content": "search hi"}]
        }))
        .send()
        .await
        .unwrap();

    let body = resp.text().await.unwrap();
    let events = parse_sse(&body);

    assert_eq!(
        event_names(&events),
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    let start = &events[2].1;
    assert_eq!(start["index"], 0);
    assert_eq!(start["content_block"]["type"], "tool_use");
    assert_eq!(start["content_block"]["id"], "call_1");
    assert_eq!(start["content_block"]["name"], "search");
    assert_eq!(start["content_block"]["input"], serde_json::json!({}));

    // Concatenated fragments parse back to the tool input.
    let fragments: String = events
        .iter()
        .filter(|(name, _)| name == "content_block_delta")
        .map(|(_, v)| v["delta"]["partial_json"].as_str().unwrap())
        .collect();
    let parsed: serde_json::Value = serde_json::from_str(&fragments).unwrap();
    assert_eq!(parsed, serde_json::json!({"q": "hi"}));

    assert_eq!(events[6].1["delta"]["stop_reason"], "tool_use");
}

const RESPONSES_STREAM: &str = "\
event: response.created\n\
data: {\"type\":\"response.created\",\"response\":{\"id\":\"resp_7\",\"model\":\"gpt-5-mini\",\"status\":\"in_progress\",\"output\":[]}}\n\
\n\
event: response.output_item.added\n\
data: {\"type\":\"response.output_item.added\",\"output_index\":0,\"item\":{\"type\":\"message\",\"id\":\"m1\",\"role\":\"assistant\",\"content\":[]}}\n\
\n\
event: response.output_text.delta\n\
data: {\"type\":\"response.output_text.delta\",\"output_index\":0,\"delta\":\"hi \"}\n\
\n\
event: response.output_text.delta\n\
data: {\"type\":\"response.output_text.delta\",\"output_index\":0,\"delta\":\"there\"}\n\
\n\
event: response.output_item.done\n\
data: {\"type\":\"response.output_item.done\",\"output_index\":0,\"item\":{\"type\":\"message\",\"id\":\"m1\",\"role\":\"assistant\",\"content\":[]}}\n\
\n\
event: response.completed\n\
data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_7\",\"model\":\"gpt-5-mini\",\"status\":\"completed\",\"output\":[],\"usage\":{\"input_tokens\":5,\"output_tokens\":2}}}\n\
\n";

#[tokio::test]
async fn responses_stream_translates_typed_events() {
    let mock = Router::new().route(
        "/v1/responses",
        post(|| async { sse_response(RESPONSES_STREAM) }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "k")
        .json(&serde_json::json!({
            "model": "gpt-5-mini",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    let body = resp.text().await.unwrap();
    let events = parse_sse(&body);

    assert_eq!(
        event_names(&events),
        vec![
            "message_start",
            "ping",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert_eq!(events[0].1["message"]["id"], "msg_resp_7");
    assert_eq!(events[3].1["delta"]["text"], "hi ");
    assert_eq!(events[6].1["delta"]["stop_reason"], "end_turn");
    assert_eq!(events[6].1["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn streaming_upstream_rejection_becomes_error_event() {
    let mock = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": {"message": "Invalid API key"}})),
            )
        }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "bad")
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 16,
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    let events = parse_sse(&body);

    assert_eq!(event_names(&events), vec!["error", "message_stop"]);
    assert_eq!(events[0].1["error"]["type"], "authentication_error");
}

// ────────────────────────────────────────────────────────────────
// Front-end contract
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_capabilities() {
    let proxy_url = spawn_proxy("http://127.0.0.1:9", |_| {}).await;

    let resp = reqwest::Client::new()
        .get(format!("{proxy_url}/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "status": "ok",
            "proxy": "model-router",
            "version": env!("CARGO_PKG_VERSION"),
            "capabilities": {
                "supports_responses": true,
                "retry_on_not_chat_model": true,
            },
        })
    );
}

#[tokio::test]
async fn missing_credentials_are_rejected() {
    let proxy_url = spawn_proxy("http://127.0.0.1:9", |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .json(&serde_json::json!({
            "model": "gpt-4o-mini",
            "max_tokens": 8,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn malformed_body_is_rejected_without_upstream_call() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = hits.clone();
    let mock = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let hits = hits_clone.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Json(serde_json::json!({}))
            }
        }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |_| {}).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "k")
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_paths_return_not_found_envelope() {
    let proxy_url = spawn_proxy("http://127.0.0.1:9", |_| {}).await;

    let resp = reqwest::Client::new()
        .get(format!("{proxy_url}/v1/models"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn default_model_override_rewrites_upstream_model() {
    let captured: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
    let captured_clone = captured.clone();

    let mock = Router::new().route(
        "/v1/responses",
        post(move |body: Bytes| {
            let captured = captured_clone.clone();
            async move {
                *captured.lock().unwrap() = serde_json::from_slice(&body).ok();
                Json(serde_json::json!({
                    "id": "resp_o",
                    "model": "gpt-5-codex",
                    "status": "completed",
                    "output": [{
                        "type": "message",
                        "id": "m1",
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": "ok"}]
                    }]
                }))
            }
        }),
    );
    let mock_url = spawn(mock).await;
    let proxy_url = spawn_proxy(&mock_url, |config| {
        config.default_model_override = Some("gpt-5-codex".to_string());
        config.flavor_overrides = HashMap::new();
    })
    .await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy_url}/v1/messages"))
        .header("x-api-key", "k")
        .json(&serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 8,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    // The client-facing model echoes the original request.
    assert_eq!(body["model"], "claude-sonnet-4-20250514");

    let sent = captured.lock().unwrap().clone().unwrap();
    assert_eq!(sent["model"], "gpt-5-codex");
    assert_eq!(sent["store"], false);
}
