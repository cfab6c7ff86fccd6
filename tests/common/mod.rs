#![allow(dead_code)]

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use claude_adapter::config::{
    AppConfig, FeaturesConfig, ModelNameMap, ServerConfig, ToolFormat, UpstreamConfig,
};
use claude_adapter::observability::usage_log::UsageLog;
use claude_adapter::routing::dispatch::dispatch_request;
use claude_adapter::state::AppState;
use claude_adapter::transport::HttpTransport;
use parking_lot::Mutex;
use serde_json::Value;

/// What the mock upstream replies with.
#[derive(Debug, Clone)]
pub enum MockReply {
    Json(StatusCode, Value),
    Sse(Vec<String>),
    /// Endless SSE body: `frame` once per `interval` until the reader goes away.
    Trickle {
        frame: String,
        interval: Duration,
        progress: Arc<TrickleProgress>,
    },
}

/// What an endless mock body has done so far.
#[derive(Debug, Default)]
pub struct TrickleProgress {
    pub sent: AtomicUsize,
    pub closed: AtomicBool,
}

impl TrickleProgress {
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Marks the trickle closed when the server drops its body.
struct CloseGuard(Arc<TrickleProgress>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

/// Mock OpenAI-compatible upstream that records every request body it sees.
pub struct MockUpstream {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<Value>>>,
    server: tokio::task::JoinHandle<()>,
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.server.abort();
    }
}

#[derive(Clone)]
struct MockState {
    reply: MockReply,
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn chat_completions(State(mock): State<MockState>, body: axum::body::Bytes) -> Response {
    let value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    mock.requests.lock().push(value);
    match mock.reply {
        MockReply::Json(status, payload) => (status, axum::Json(payload)).into_response(),
        MockReply::Sse(frames) => {
            let mut text = String::new();
            for frame in frames {
                text.push_str("data: ");
                text.push_str(&frame);
                text.push_str("\n\n");
            }
            ([(header::CONTENT_TYPE, "text/event-stream")], text).into_response()
        }
        MockReply::Trickle {
            frame,
            interval,
            progress,
        } => {
            let frames = futures_util::stream::unfold(CloseGuard(progress), move |guard| {
                let frame = frame.clone();
                async move {
                    tokio::time::sleep(interval).await;
                    guard.0.sent.fetch_add(1, Ordering::SeqCst);
                    Some((Ok::<_, Infallible>(format!("data: {frame}\n\n")), guard))
                }
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                Body::from_stream(frames),
            )
                .into_response()
        }
    }
}

pub async fn spawn_upstream(reply: MockReply) -> MockUpstream {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(MockState {
            reply,
            requests: Arc::clone(&requests),
        });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockUpstream {
        base_url: format!("http://{addr}/v1"),
        requests,
        server,
    }
}

pub fn config(base_url: &str, tool_format: ToolFormat) -> AppConfig {
    AppConfig {
        server: ServerConfig::default(),
        upstream: UpstreamConfig {
            base_url: base_url.to_string(),
            api_key: "upstream-secret".to_string(),
            models: ModelNameMap {
                opus: "big-model".to_string(),
                sonnet: "mid-model".to_string(),
                haiku: "small-model".to_string(),
            },
            tool_format,
            max_context_window: None,
            provider: "openai".to_string(),
            proxy: None,
        },
        features: FeaturesConfig::default(),
    }
}

pub fn build_state(config: AppConfig, log_dir: Option<PathBuf>) -> Arc<AppState> {
    let transport =
        HttpTransport::new(&config.server, &config.upstream).expect("build transport");
    Arc::new(AppState::new(config, transport, UsageLog::new(log_dir)))
}

pub async fn send(
    state: Arc<AppState>,
    method: &str,
    uri: &str,
    body: Option<&Value>,
) -> Response {
    let body = body.map_or_else(Body::empty, |value| {
        Body::from(serde_json::to_vec(value).expect("serialize request"))
    });
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .expect("build request");
    dispatch_request(state, Arc::<str>::from(""), request)
        .await
        .expect("dispatch")
}

pub async fn post_messages(state: Arc<AppState>, body: &Value) -> Response {
    send(state, "POST", "/v1/messages", Some(body)).await
}

pub async fn body_bytes(response: Response) -> axum::body::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body")
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json payload")
}

/// Split an inbound SSE body into `(event name, data)` pairs.
pub fn parse_sse(body: &[u8]) -> Vec<(String, Value)> {
    let text = std::str::from_utf8(body).expect("utf-8 stream");
    text.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let mut name = String::new();
            let mut data = Value::Null;
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    name = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(rest).expect("event data is json");
                }
            }
            (name, data)
        })
        .collect()
}

pub fn event_names(events: &[(String, Value)]) -> Vec<&str> {
    events.iter().map(|(name, _)| name.as_str()).collect()
}

pub fn openai_completion(message: Value, finish_reason: &str, usage: Option<Value>) -> Value {
    let mut body = serde_json::json!({
        "id": "chatcmpl_mock",
        "object": "chat.completion",
        "created": 1_727_000_000_u64,
        "model": "mid-model",
        "choices": [{"index": 0, "message": message, "finish_reason": finish_reason}],
    });
    if let Some(usage) = usage {
        body["usage"] = usage;
    }
    body
}

pub fn chunk(delta: Value, finish_reason: Option<&str>) -> String {
    serde_json::json!({
        "id": "chatcmpl_mock",
        "object": "chat.completion.chunk",
        "model": "mid-model",
        "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
    })
    .to_string()
}

pub fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "claude-adapter-it-{label}-{}-{}",
        std::process::id(),
        fastrand::u64(..)
    ));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

pub fn read_jsonl_dir(dir: &std::path::Path) -> Vec<Value> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let text = std::fs::read_to_string(entry.path()).expect("read log file");
        out.extend(
            text.lines()
                .map(|line| serde_json::from_str::<Value>(line).expect("whole json line")),
        );
    }
    out
}
