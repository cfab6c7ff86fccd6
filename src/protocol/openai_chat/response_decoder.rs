use crate::config::ToolFormat;
use crate::error::GatewayError;
use crate::fc::DecodedFragment;
use crate::protocol::canonical::{ContentBlock, ResponseMessage, StopReason};
use crate::protocol::mapping::{openai_finish_to_stop_reason, openai_usage_to_canonical};
use crate::util::generate_tool_use_id;

use super::{OpenAiChatResponse, OpenAiToolCall};

/// Decode a unary upstream reply body.
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamMalformedResponse`] when the body is not a
/// chat completion or carries no choices.
pub fn decode_openai_chat_response_body(
    body: &[u8],
    format: ToolFormat,
    inbound_model: &str,
) -> Result<ResponseMessage, GatewayError> {
    let response: OpenAiChatResponse = serde_json::from_slice(body).map_err(|e| {
        GatewayError::UpstreamMalformedResponse(format!("invalid chat completion: {e}"))
    })?;
    decode_openai_chat_response(response, format, inbound_model)
}

/// Convert an upstream chat completion into the inbound reply shape.
///
/// # Errors
///
/// Returns [`GatewayError::UpstreamMalformedResponse`] when `choices` is empty.
pub fn decode_openai_chat_response(
    response: OpenAiChatResponse,
    format: ToolFormat,
    inbound_model: &str,
) -> Result<ResponseMessage, GatewayError> {
    let usage = response.usage.as_ref().map(openai_usage_to_canonical);
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(GatewayError::UpstreamMalformedResponse(
            "response has no choices".to_string(),
        ));
    };

    let mut content = Vec::new();
    if let Some(text) = choice.message.content.as_deref() {
        for fragment in format.decode_text(text) {
            content.push(match fragment {
                DecodedFragment::Text(text) => ContentBlock::Text(text),
                DecodedFragment::ToolCall { name, arguments } => ContentBlock::ToolUse {
                    id: generate_tool_use_id(),
                    name,
                    arguments,
                },
            });
        }
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        content.push(decode_native_tool_call(call));
    }

    let mut stop_reason = choice
        .finish_reason
        .as_deref()
        .map_or(StopReason::EndTurn, openai_finish_to_stop_reason);
    let has_tool_use = content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));
    if has_tool_use && stop_reason == StopReason::EndTurn {
        stop_reason = StopReason::ToolUse;
    }

    let id = if response.id.is_empty() {
        crate::util::generate_request_id()
    } else {
        format!("msg_{}", response.id)
    };

    Ok(ResponseMessage {
        id,
        model: inbound_model.to_string(),
        content,
        stop_reason,
        usage,
    })
}

fn decode_native_tool_call(call: OpenAiToolCall) -> ContentBlock {
    let raw = call.function.arguments;
    let arguments = if raw.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(
                tool = %call.function.name,
                error = %e,
                "tool call arguments are not JSON"
            );
            serde_json::json!({ "raw": raw })
        })
    };
    ContentBlock::ToolUse {
        id: if call.id.is_empty() {
            generate_tool_use_id()
        } else {
            call.id
        },
        name: call.function.name,
        arguments,
    }
}
