use crate::protocol::anthropic::{AnthropicContentBlock, AnthropicResponse, AnthropicUsage};
use crate::protocol::canonical::{ContentBlock, ResponseMessage, Usage};

/// Encode a converted reply into the Anthropic Messages API wire format.
#[must_use]
pub fn encode_anthropic_response(response: &ResponseMessage, usage: Usage) -> AnthropicResponse {
    let content = response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text(text) => Some(AnthropicContentBlock::Text { text: text.clone() }),
            ContentBlock::ToolUse {
                id,
                name,
                arguments,
            } => Some(AnthropicContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: arguments.clone(),
            }),
            ContentBlock::ToolResult { .. } => None,
        })
        .collect();

    AnthropicResponse {
        id: response.id.clone(),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model.clone(),
        content,
        stop_reason: Some(response.stop_reason.as_str().to_string()),
        stop_sequence: None,
        usage: anthropic_usage(usage),
    }
}

#[must_use]
pub fn anthropic_usage(usage: Usage) -> AnthropicUsage {
    AnthropicUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: usage.cached_input_tokens,
    }
}
