use smallvec::SmallVec;

use crate::error::{classify_upstream_error, GatewayError};
use crate::protocol::canonical::{ToolCallFragment, UpstreamChunk};
use crate::protocol::mapping::openai_usage_to_canonical;

use super::OpenAiStreamChunk;

const DONE_SENTINEL: &str = "[DONE]";

/// One decoded `data:` payload of the upstream stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    Chunk(UpstreamChunk),
    Done,
}

/// Decode one SSE `data:` payload.
///
/// Returns `Ok(None)` for empty payloads (keep-alives).
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamMalformedResponse`] for payloads that are
/// not a chunk, and the classified upstream error for an in-band
/// `{"error": ...}` chunk.
pub fn decode_openai_stream_data(data: &str) -> Result<Option<UpstreamFrame>, GatewayError> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == DONE_SENTINEL {
        return Ok(Some(UpstreamFrame::Done));
    }

    let chunk: OpenAiStreamChunk = serde_json::from_str(data).map_err(|e| {
        GatewayError::UpstreamMalformedResponse(format!("invalid stream chunk: {e}"))
    })?;
    if let Some(error) = chunk.error {
        return Err(stream_error(&error));
    }
    Ok(Some(UpstreamFrame::Chunk(decode_openai_stream_chunk(chunk))))
}

/// Flatten the first choice of an upstream chunk into an [`UpstreamChunk`].
#[must_use]
pub fn decode_openai_stream_chunk(chunk: OpenAiStreamChunk) -> UpstreamChunk {
    let usage = chunk.usage.as_ref().map(openai_usage_to_canonical);
    let Some(choice) = chunk.choices.into_iter().find(|choice| choice.index == 0) else {
        return UpstreamChunk {
            usage,
            ..UpstreamChunk::default()
        };
    };

    let tool_calls: SmallVec<[ToolCallFragment; 1]> = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| {
            let (name, arguments) = call
                .function
                .map(|function| (function.name, function.arguments))
                .unwrap_or_default();
            ToolCallFragment {
                index: call.index,
                id: call.id.filter(|id| !id.is_empty()),
                name: name.filter(|name| !name.is_empty()),
                arguments_fragment: arguments.unwrap_or_default(),
            }
        })
        .collect();

    UpstreamChunk {
        role: choice.delta.role,
        text: choice.delta.content.filter(|text| !text.is_empty()),
        tool_calls,
        finish_reason: choice.finish_reason,
        usage,
    }
}

/// Map an in-band error object to the gateway taxonomy.
fn stream_error(error: &serde_json::Value) -> GatewayError {
    let status = error
        .get("status")
        .or_else(|| error.get("code"))
        .and_then(|code| match code {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse::<u64>().ok(),
            _ => None,
        })
        .and_then(|code| u16::try_from(code).ok())
        .filter(|code| (400..600).contains(code))
        .unwrap_or(502);
    let body = serde_json::json!({ "error": error });
    classify_upstream_error(status, body.to_string().as_bytes())
}
