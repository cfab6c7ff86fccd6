mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use claude_adapter::config::ToolFormat;
use claude_adapter::routing::dispatch::{dispatch_request, normalize_base_path};

use common::{body_json, build_state, config, send, spawn_upstream, MockReply};

fn unused_upstream() -> MockReply {
    MockReply::Json(StatusCode::OK, serde_json::json!({}))
}

#[tokio::test]
async fn test_health_reports_upstream_summary() {
    let upstream = spawn_upstream(unused_upstream()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Xml), None);

    let response = send(state, "GET", "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["upstream"], upstream.base_url.as_str());
    assert_eq!(payload["tool_format"], "xml");
}

#[tokio::test]
async fn test_wrong_method_is_rejected_with_envelope() {
    let upstream = spawn_upstream(unused_upstream()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), None);

    let response = send(state, "GET", "/v1/messages", None).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let payload = body_json(response).await;
    assert_eq!(payload["type"], "error");
    assert_eq!(payload["error"]["type"], "invalid_request_error");
    assert!(upstream.requests.lock().is_empty());
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let upstream = spawn_upstream(unused_upstream()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), None);

    let response = send(state, "POST", "/v1/complete", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = body_json(response).await;
    assert_eq!(payload["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn test_unparseable_body_is_invalid_request() {
    let upstream = spawn_upstream(unused_upstream()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), None);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .body(Body::from("{not json"))
        .expect("build request");
    let response = dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().contains_key("x-request-id"));
    let payload = body_json(response).await;
    assert_eq!(payload["error"]["type"], "invalid_request_error");
    assert!(upstream.requests.lock().is_empty());
}

#[tokio::test]
async fn test_base_path_prefixes_every_route() {
    let upstream = spawn_upstream(unused_upstream()).await;
    let state = build_state(config(&upstream.base_url, ToolFormat::Native), None);
    let base_path = Arc::<str>::from(normalize_base_path("proxy/"));

    let prefixed = Request::builder()
        .method("GET")
        .uri("/proxy/health")
        .body(Body::empty())
        .expect("build request");
    let response = dispatch_request(Arc::clone(&state), Arc::clone(&base_path), prefixed)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::OK);

    let bare = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .expect("build request");
    let response = dispatch_request(state, base_path, bare)
        .await
        .expect("dispatch");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
