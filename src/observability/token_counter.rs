use crate::protocol::canonical::{ContentBlock, ConversationRequest, Usage};
use std::time::Duration;
use tracing::info;

/// Local token estimate used when the upstream reports no usage.
pub trait TokenEstimator: Send + Sync {
    /// Estimate tokens for `byte_len` bytes of text.
    fn estimate_len(&self, byte_len: usize) -> u64;

    fn estimate(&self, text: &str) -> u64 {
        self.estimate_len(text.len())
    }
}

/// Conservative heuristic of roughly 2.5 bytes per token. Non-empty text is
/// at least one token.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteRatioEstimator;

impl TokenEstimator for ByteRatioEstimator {
    fn estimate_len(&self, byte_len: usize) -> u64 {
        if byte_len == 0 {
            return 0;
        }
        let len = byte_len as u64;
        ((len * 2 + 1) / 5).max(1)
    }
}

/// Estimate tokens in `text` with the default estimator.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    ByteRatioEstimator.estimate(text)
}

/// Estimate the prompt tokens of a decoded request: system text, every
/// message block and the tool definitions.
#[must_use]
pub fn estimate_request_tokens(
    request: &ConversationRequest,
    estimator: &dyn TokenEstimator,
) -> u64 {
    let mut total = request.system.as_deref().map_or(0, |s| estimator.estimate(s));

    for message in &request.messages {
        for block in &message.content {
            total += match block {
                ContentBlock::Text(text) => estimator.estimate(text),
                ContentBlock::ToolUse {
                    name, arguments, ..
                } => estimator.estimate(name) + estimator.estimate(&arguments.to_string()),
                ContentBlock::ToolResult { content, .. } => estimator.estimate(content),
            };
        }
    }

    for tool in &request.tools {
        total += estimator.estimate(&tool.name);
        total += tool
            .description
            .as_deref()
            .map_or(0, |d| estimator.estimate(d));
        total += estimator.estimate(&tool.input_schema.to_string());
    }
    total
}

/// Final usage of one request and whether it was estimated locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedUsage {
    pub usage: Usage,
    pub estimated: bool,
}

/// Prefer upstream-reported usage; fall back to local estimates only when the
/// upstream reported nothing.
#[must_use]
pub fn resolve_usage(
    reported: Option<Usage>,
    estimated_input: u64,
    estimated_output: u64,
) -> ResolvedUsage {
    match reported {
        Some(usage) => ResolvedUsage {
            usage,
            estimated: false,
        },
        None => ResolvedUsage {
            usage: Usage {
                input_tokens: estimated_input,
                output_tokens: estimated_output,
                cached_input_tokens: None,
            },
            estimated: true,
        },
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, resolved: &ResolvedUsage, duration: Duration) {
    info!(
        model = model,
        input_tokens = resolved.usage.input_tokens,
        output_tokens = resolved.usage.output_tokens,
        cached_input_tokens = resolved.usage.cached_input_tokens.unwrap_or(0),
        estimated = resolved.estimated,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
