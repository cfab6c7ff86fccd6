mod common;

use axum::http::StatusCode;
use claude_adapter::config::ToolFormat;
use serde_json::{json, Value};

use common::{
    body_json, build_state, config, openai_completion, post_messages, read_jsonl_dir,
    scratch_dir, spawn_upstream, MockReply,
};

fn two_tools() -> Value {
    json!([
        {
            "name": "lookup",
            "description": "Look something up",
            "input_schema": {"type":"object","properties":{"q":{"type":"string"}},"required":["q"]}
        },
        {
            "name": "write_file",
            "input_schema": {"type":"object","properties":{"path":{"type":"string"},"body":{"type":"string"}}}
        }
    ])
}

fn pong() -> MockReply {
    MockReply::Json(
        StatusCode::OK,
        openai_completion(
            json!({"role":"assistant","content":"pong"}),
            "stop",
            Some(json!({"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7})),
        ),
    )
}

#[tokio::test]
async fn test_native_tools_forward_schemas_verbatim() {
    let upstream = spawn_upstream(pong()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), None);

    let tools = two_tools();
    let response = post_messages(
        state,
        &json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 128,
            "system": "Be brief.",
            "tools": tools,
            "tool_choice": {"type": "any"},
            "messages": [{"role":"user","content":"ping"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let sent = upstream.requests.lock()[0].clone();
    assert_eq!(sent["model"], "mid-model");
    assert_eq!(sent["stream"], false);
    let upstream_tools = sent["tools"].as_array().expect("tools array");
    assert_eq!(upstream_tools.len(), 2);
    assert_eq!(upstream_tools[0]["function"]["parameters"], tools[0]["input_schema"]);
    assert_eq!(upstream_tools[1]["function"]["parameters"], tools[1]["input_schema"]);
    assert_eq!(sent["tool_choice"], "required");
    assert_eq!(sent["messages"][0]["role"], "system");
    assert_eq!(sent["messages"][0]["content"], "Be brief.");
}

#[tokio::test]
async fn test_xml_tools_move_into_system_prompt() {
    let upstream = spawn_upstream(pong()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Xml), None);

    let response = post_messages(
        state,
        &json!({
            "model": "claude-opus-4",
            "max_tokens": 128,
            "tools": two_tools(),
            "tool_choice": {"type": "auto"},
            "messages": [{"role":"user","content":"ping"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let sent = upstream.requests.lock()[0].clone();
    assert_eq!(sent["model"], "big-model");
    assert!(sent.get("tools").is_none());
    assert!(sent.get("tool_choice").is_none());
    assert_eq!(sent["temperature"], 0.0);
    let system = sent["messages"][0]["content"].as_str().expect("system text");
    assert!(system.contains("lookup"));
    assert!(system.contains("write_file"));
    assert!(system.contains("<tool_code name="));
    assert!(system.contains("path"));
}

#[tokio::test]
async fn test_unary_text_reply_is_converted() {
    let upstream = spawn_upstream(pong()).await;
    let dir = scratch_dir("unary-usage");
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), Some(dir.clone()));

    let response = post_messages(
        state,
        &json!({
            "model": "claude-3-5-haiku-latest",
            "max_tokens": 64,
            "messages": [{"role":"user","content":"ping"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .expect("request id header");
    assert!(request_id.starts_with("msg_"));

    let payload = body_json(response).await;
    assert_eq!(payload["id"], "msg_chatcmpl_mock");
    assert_eq!(payload["type"], "message");
    assert_eq!(payload["role"], "assistant");
    assert_eq!(payload["model"], "claude-3-5-haiku-latest");
    assert_eq!(payload["content"], json!([{"type":"text","text":"pong"}]));
    assert_eq!(payload["stop_reason"], "end_turn");
    assert_eq!(payload["usage"]["input_tokens"], 5);
    assert_eq!(payload["usage"]["output_tokens"], 2);

    let records = read_jsonl_dir(&dir.join("token_usage"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["upstream_model"], "small-model");
    assert_eq!(records[0]["estimated"], false);
    assert_eq!(records[0]["streaming"], false);
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_unary_xml_reply_yields_tool_use() {
    let upstream = spawn_upstream(MockReply::Json(
        StatusCode::OK,
        openai_completion(
            json!({
                "role": "assistant",
                "content": "Let me look.<tool_code name=\"lookup\">{\"q\":\"x\"}</tool_code>"
            }),
            "stop",
            None,
        ),
    ))
    .await;
    let dir = scratch_dir("unary-xml");
    let state = build_state(config(&upstream.base_url, ToolFormat::Xml), Some(dir.clone()));

    let response = post_messages(
        state,
        &json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "tools": two_tools(),
            "messages": [{"role":"user","content":"find x"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["stop_reason"], "tool_use");
    let content = payload["content"].as_array().expect("content");
    assert_eq!(content.len(), 2);
    assert_eq!(content[0], json!({"type":"text","text":"Let me look."}));
    assert_eq!(content[1]["type"], "tool_use");
    assert_eq!(content[1]["name"], "lookup");
    assert_eq!(content[1]["input"], json!({"q":"x"}));
    assert!(content[1]["id"].as_str().unwrap().starts_with("toolu_"));

    let records = read_jsonl_dir(&dir.join("token_usage"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["estimated"], true);
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_tool_history_round_trips_to_native_messages() {
    let upstream = spawn_upstream(pong()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), None);

    let response = post_messages(
        state,
        &json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "tools": two_tools(),
            "messages": [
                {"role":"user","content":"find x"},
                {"role":"assistant","content":[
                    {"type":"tool_use","id":"toolu_1","name":"lookup","input":{"q":"x"}}
                ]},
                {"role":"user","content":[
                    {"type":"tool_result","tool_use_id":"toolu_1","content":"found"}
                ]}
            ]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let sent = upstream.requests.lock()[0].clone();
    let messages = sent["messages"].as_array().expect("messages");
    let assistant = messages
        .iter()
        .find(|m| m["role"] == "assistant")
        .expect("assistant turn");
    assert_eq!(assistant["tool_calls"][0]["function"]["name"], "lookup");
    let tool = messages.iter().find(|m| m["role"] == "tool").expect("tool turn");
    assert_eq!(tool["tool_call_id"], assistant["tool_calls"][0]["id"]);
    assert_eq!(tool["content"], "found");
}

#[tokio::test]
async fn test_invalid_request_never_reaches_upstream() {
    let upstream = spawn_upstream(pong()).await;
    let dir = scratch_dir("validation");
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), Some(dir.clone()));

    let response = post_messages(
        state,
        &json!({"model": "", "max_tokens": 0, "messages": []}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = body_json(response).await;
    assert_eq!(payload["type"], "error");
    assert_eq!(payload["error"]["type"], "invalid_request_error");
    let message = payload["error"]["message"].as_str().unwrap();
    assert!(message.contains("model"));
    assert!(message.contains("max_tokens"));
    assert!(message.contains("messages"));
    assert!(upstream.requests.lock().is_empty());

    let errors = read_jsonl_dir(&dir.join("error_logs"));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error_kind"], "request_validation_error");
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_upstream_rate_limit_preserves_status() {
    let upstream = spawn_upstream(MockReply::Json(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error":{"message":"Rate limit reached","type":"requests"}}),
    ))
    .await;
    let dir = scratch_dir("rate-limit");
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), Some(dir.clone()));

    let response = post_messages(
        state,
        &json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "messages": [{"role":"user","content":"ping"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let payload = body_json(response).await;
    assert_eq!(payload["error"]["type"], "rate_limit_error");
    assert!(payload["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Rate limit reached"));

    let errors = read_jsonl_dir(&dir.join("error_logs"));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["status"], 429);
    assert_eq!(errors[0]["severity"], "warning");
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_upstream_context_overflow_has_distinct_kind() {
    let upstream = spawn_upstream(MockReply::Json(
        StatusCode::BAD_REQUEST,
        json!({"error":{"message":"This model's maximum context length is 4096 tokens","code":"context_length_exceeded"}}),
    ))
    .await;
    let dir = scratch_dir("overflow");
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), Some(dir.clone()));

    let response = post_messages(
        state,
        &json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "messages": [{"role":"user","content":"ping"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = body_json(response).await;
    assert_eq!(payload["error"]["type"], "invalid_request_error");

    let errors = read_jsonl_dir(&dir.join("error_logs"));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["error_kind"], "context_window_exceeded");
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_malformed_upstream_reply_is_bad_gateway() {
    let upstream =
        spawn_upstream(MockReply::Json(StatusCode::OK, json!({"unexpected": true}))).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), None);

    let response = post_messages(
        state,
        &json!({
            "model": "claude-sonnet-4",
            "max_tokens": 64,
            "messages": [{"role":"user","content":"ping"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let payload = body_json(response).await;
    assert_eq!(payload["error"]["type"], "api_error");
}

#[tokio::test]
async fn test_single_token_request_and_context_window_are_applied() {
    let upstream = spawn_upstream(pong()).await;
    let mut cfg = config(&upstream.base_url, ToolFormat::Native);
    cfg.upstream.max_context_window = Some(1024);
    let state = build_state(cfg, None);

    let response = post_messages(
        state,
        &json!({
            "model": "claude-sonnet-4",
            "max_tokens": 1,
            "messages": [{"role":"user","content":"ping"}]
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let sent = upstream.requests.lock()[0].clone();
    assert_eq!(sent["max_tokens"], 32);
}
