//! `POST /v1/messages`: one independent pipeline per request.
//!
//! decode → encode → upstream → (unary convert | stream reassembly) → encode.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::header::{HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ToolFormat;
use crate::error::GatewayError;
use crate::observability::token_counter::{
    estimate_request_tokens, log_request_usage, resolve_usage, ByteRatioEstimator,
    ResolvedUsage, TokenEstimator,
};
use crate::observability::usage_log::{
    error_severity, now_rfc3339, ErrorRecord, ErrorSeverity, UsageRecord,
};
use crate::protocol::anthropic::decoder::decode_anthropic_body;
use crate::protocol::anthropic::response_encoder::encode_anthropic_response;
use crate::protocol::anthropic::stream::encode_anthropic_sse_event;
use crate::protocol::anthropic::AnthropicStreamEvent;
use crate::protocol::canonical::{ContentBlock, ResponseMessage, UpstreamChunk};
use crate::protocol::openai_chat::encoder::{encode_openai_chat_request, EncodeOptions};
use crate::protocol::openai_chat::response_decoder::decode_openai_chat_response_body;
use crate::routing::resolve_upstream_model;
use crate::state::AppState;
use crate::stream::{upstream_chunk_stream, StreamReassembler};
use crate::util::generate_request_id;

const REQUEST_ID_HEADER: &str = "x-request-id";

type ChunkStream = Pin<Box<dyn Stream<Item = Result<UpstreamChunk, GatewayError>> + Send>>;

/// Per-request identity carried into logs and usage records.
#[derive(Debug, Clone)]
struct RequestContext {
    request_id: String,
    model: String,
    upstream_model: String,
    streaming: bool,
    started: Instant,
}

impl RequestContext {
    fn record_usage(&self, state: &AppState, resolved: &ResolvedUsage) {
        log_request_usage(&self.upstream_model, resolved, self.started.elapsed());
        state.usage_log.record_usage(&UsageRecord {
            timestamp: now_rfc3339(),
            provider: state.provider().to_string(),
            model: self.model.clone(),
            upstream_model: self.upstream_model.clone(),
            input_tokens: resolved.usage.input_tokens,
            output_tokens: resolved.usage.output_tokens,
            cached_input_tokens: resolved.usage.cached_input_tokens,
            streaming: self.streaming,
            estimated: resolved.estimated,
        });
    }

    fn record_error(&self, state: &AppState, err: &GatewayError) {
        match error_severity(err) {
            ErrorSeverity::Error => {
                error!(error_kind = err.kind(), error = %err, "request failed");
            }
            ErrorSeverity::Warning => {
                warn!(error_kind = err.kind(), error = %err, "request rejected");
            }
        }
        state.usage_log.record_error(
            err,
            &ErrorRecord::from_error(
                err,
                &self.request_id,
                state.provider(),
                &self.model,
                self.streaming,
            ),
        );
    }
}

/// Handle one `/v1/messages` request body.
pub async fn handler(state: Arc<AppState>, body: Bytes) -> Response {
    let request_id = generate_request_id();
    let span = tracing::info_span!("request", request_id = %request_id);
    let mut response = handle(state, request_id.clone(), body).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn handle(state: Arc<AppState>, request_id: String, body: Bytes) -> Response {
    let mut ctx = RequestContext {
        request_id,
        model: String::new(),
        upstream_model: String::new(),
        streaming: false,
        started: Instant::now(),
    };

    let request = match decode_anthropic_body(&body) {
        Ok(request) => request,
        Err(err) => return error_response(&state, &ctx, err),
    };
    drop(body);

    let upstream = &state.config.upstream;
    let tool_format = upstream.tool_format;
    ctx.model.clone_from(&request.model);
    ctx.upstream_model = resolve_upstream_model(&request.model, &upstream.models).to_string();
    ctx.streaming = request.stream;

    info!(
        target_model = %ctx.upstream_model,
        mode = if request.stream { "stream" } else { "sync" },
        tools = %tool_format,
        "dispatching request"
    );

    let options = EncodeOptions {
        upstream_model: &ctx.upstream_model,
        tool_format,
        context_window: upstream.effective_context_window(),
    };
    let upstream_body = match encode_openai_chat_request(&request, &options).and_then(|encoded| {
        serde_json::to_vec(&encoded).map(Bytes::from).map_err(|e| {
            GatewayError::Internal(format!("failed to serialize upstream request: {e}"))
        })
    }) {
        Ok(body) => body,
        Err(err) => return error_response(&state, &ctx, err),
    };
    let estimated_input = estimate_request_tokens(&request, &ByteRatioEstimator);

    if request.stream {
        handle_stream(state, ctx, tool_format, upstream_body, estimated_input).await
    } else {
        handle_unary(&state, &ctx, tool_format, upstream_body, estimated_input).await
    }
}

async fn handle_unary(
    state: &AppState,
    ctx: &RequestContext,
    tool_format: ToolFormat,
    upstream_body: Bytes,
    estimated_input: u64,
) -> Response {
    let reply = match state.transport.send_unary(upstream_body).await {
        Ok(bytes) => decode_openai_chat_response_body(&bytes, tool_format, &ctx.model),
        Err(err) => Err(err),
    };
    let reply = match reply {
        Ok(reply) => reply,
        Err(err) => return error_response(state, ctx, err),
    };

    let resolved = resolve_usage(
        reply.usage,
        estimated_input,
        estimate_reply_tokens(&reply, &ByteRatioEstimator),
    );
    ctx.record_usage(state, &resolved);
    axum::Json(encode_anthropic_response(&reply, resolved.usage)).into_response()
}

fn estimate_reply_tokens(reply: &ResponseMessage, estimator: &dyn TokenEstimator) -> u64 {
    reply
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text(text) => estimator.estimate(text),
            ContentBlock::ToolUse {
                name, arguments, ..
            } => estimator.estimate(name) + estimator.estimate(&arguments.to_string()),
            ContentBlock::ToolResult { content, .. } => estimator.estimate(content),
        })
        .sum()
}

async fn handle_stream(
    state: Arc<AppState>,
    ctx: RequestContext,
    tool_format: ToolFormat,
    upstream_body: Bytes,
    estimated_input: u64,
) -> Response {
    let body = match state.transport.send_stream(upstream_body).await {
        Ok(body) => body,
        Err(err) => return error_response(&state, &ctx, err),
    };
    let mut chunks: ChunkStream = Box::pin(upstream_chunk_stream(body));

    // Nothing is committed to the caller until the upstream produced its
    // first chunk, so early upstream failures still get a plain JSON error.
    let first = match chunks.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(err)) => return error_response(&state, &ctx, err),
        None => None,
    };

    let reassembler = StreamReassembler::new(
        ctx.request_id.clone(),
        ctx.model.clone(),
        tool_format,
        estimated_input,
    );
    let pipeline = StreamPipeline {
        state,
        ctx,
        chunks,
        reassembler,
        first,
        events: Vec::with_capacity(8),
        pending: VecDeque::new(),
        done: false,
        completed: false,
        failure: None,
    };

    let frames = futures_util::stream::unfold(pipeline, |mut pipeline| async move {
        loop {
            if let Some(frame) = pipeline.pending.pop_front() {
                return Some((Ok::<Bytes, Infallible>(frame), pipeline));
            }
            if pipeline.done {
                pipeline.complete();
                return None;
            }
            pipeline.advance().await;
        }
    });

    sse_ok_response(Body::from_stream(frames))
}

/// Pull-driven streaming pipeline: one upstream chunk is read only after the
/// frames of the previous one were handed to the caller.
struct StreamPipeline {
    state: Arc<AppState>,
    ctx: RequestContext,
    chunks: ChunkStream,
    reassembler: StreamReassembler,
    first: Option<UpstreamChunk>,
    events: Vec<AnthropicStreamEvent>,
    pending: VecDeque<Bytes>,
    done: bool,
    completed: bool,
    failure: Option<GatewayError>,
}

impl StreamPipeline {
    async fn advance(&mut self) {
        let next = match self.first.take() {
            Some(chunk) => Some(Ok(chunk)),
            None => self.chunks.next().await,
        };

        match next {
            Some(Ok(chunk)) => {
                if let Err(err) = self.reassembler.push(chunk, &mut self.events) {
                    self.stop(Some(err));
                }
            }
            Some(Err(err)) => {
                let result = self.reassembler.fail(err, &mut self.events);
                self.stop(result.err());
            }
            None => {
                let result = self.reassembler.finish(&mut self.events);
                self.stop(result.err());
            }
        }

        self.pending
            .extend(self.events.drain(..).map(|event| encode_anthropic_sse_event(&event)));
    }

    fn stop(&mut self, failure: Option<GatewayError>) {
        self.done = true;
        self.failure = failure;
    }

    fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        let span = tracing::info_span!("request", request_id = %self.ctx.request_id);
        let _entered = span.enter();
        match &self.failure {
            Some(err) => self.ctx.record_error(&self.state, err),
            None => self.ctx.record_usage(&self.state, &self.reassembler.usage()),
        }
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        if !self.completed {
            // Dropping `chunks` cancels the in-flight upstream read.
            debug!(
                request_id = %self.ctx.request_id,
                error_kind = GatewayError::ClientDisconnected.kind(),
                "client disconnected before stream end"
            );
        }
    }
}

fn error_response(state: &AppState, ctx: &RequestContext, err: GatewayError) -> Response {
    ctx.record_error(state, &err);
    err.into_response()
}

fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}
