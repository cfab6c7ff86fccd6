use crate::protocol::error_shapes::anthropic_error_payload;

/// Error type shared by every stage of the gateway pipeline.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    RequestValidation(String),
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("Upstream error: status={status}, message={message}")]
    UpstreamHttp { status: u16, message: String },
    #[error("Malformed upstream response: {0}")]
    UpstreamMalformedResponse(String),
    #[error("Tool call '{tool_name}' has undecodable arguments: {detail}")]
    ToolCallDecode { tool_name: String, detail: String },
    #[error("Client disconnected")]
    ClientDisconnected,
    #[error("Context window exceeded: {0}")]
    ContextWindowExceeded(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code and envelope type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    RequestTooLarge,
    RateLimit,
    Overloaded,
    ServerError,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        404 => ErrorCategory::NotFound,
        413 => ErrorCategory::RequestTooLarge,
        429 => ErrorCategory::RateLimit,
        503 | 529 => ErrorCategory::Overloaded,
        _ => ErrorCategory::ServerError,
    }
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::RequestValidation(_) | GatewayError::ContextWindowExceeded(_) => {
                ErrorCategory::InvalidRequest
            }
            GatewayError::UpstreamHttp { status, .. } => category_from_upstream_status(*status),
            GatewayError::UpstreamUnreachable(_)
            | GatewayError::UpstreamMalformedResponse(_)
            | GatewayError::ToolCallDecode { .. }
            | GatewayError::ClientDisconnected
            | GatewayError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// Stable identifier written to the error log and attached as the final
    /// `stop_reason` when a stream terminates on this error.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RequestValidation(_) => "request_validation_error",
            GatewayError::UpstreamUnreachable(_) => "upstream_unreachable",
            GatewayError::UpstreamHttp { .. } => "upstream_http_error",
            GatewayError::UpstreamMalformedResponse(_) => "upstream_malformed_response",
            GatewayError::ToolCallDecode { .. } => "tool_call_decode_error",
            GatewayError::ClientDisconnected => "client_disconnected",
            GatewayError::ContextWindowExceeded(_) => "context_window_exceeded",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Upstream status carried by the error, if any.
    #[must_use]
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            GatewayError::UpstreamHttp { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// HTTP status returned to the inbound caller.
    #[must_use]
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            GatewayError::UpstreamHttp { status, .. } => http::StatusCode::from_u16(*status)
                .ok()
                .filter(|code| code.is_client_error() || code.is_server_error())
                .unwrap_or(http::StatusCode::BAD_GATEWAY),
            GatewayError::UpstreamUnreachable(_) | GatewayError::UpstreamMalformedResponse(_) => {
                http::StatusCode::BAD_GATEWAY
            }
            GatewayError::RequestValidation(_) | GatewayError::ContextWindowExceeded(_) => {
                http::StatusCode::BAD_REQUEST
            }
            GatewayError::ToolCallDecode { .. }
            | GatewayError::ClientDisconnected
            | GatewayError::Internal(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Classify an upstream non-2xx reply. Context-length rejections get their own kind.
#[must_use]
pub fn classify_upstream_error(status: u16, body: &[u8]) -> GatewayError {
    let message = upstream_error_message(body);
    if is_context_overflow(&message, body) {
        return GatewayError::ContextWindowExceeded(message);
    }
    GatewayError::UpstreamHttp { status, message }
}

fn upstream_error_message(body: &[u8]) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let from_json = parsed.as_ref().and_then(|value| {
        value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .or_else(|| value.get("error"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    });
    from_json.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            "upstream returned an empty error body".to_string()
        } else {
            trimmed.chars().take(2048).collect()
        }
    })
}

fn is_context_overflow(message: &str, body: &[u8]) -> bool {
    if memchr::memmem::find(body, b"context_length_exceeded").is_some() {
        return true;
    }
    let lower = message.to_ascii_lowercase();
    lower.contains("maximum context length")
        || lower.contains("context window")
        || lower.contains("context length")
}

// ---------------------------------------------------------------------------
// Axum integration
// ---------------------------------------------------------------------------

/// Format an error as (`status_code`, Anthropic error envelope).
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, serde_json::Value) {
    let body = anthropic_error_payload(err.category(), &err.to_string());
    (err.http_status(), body)
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
