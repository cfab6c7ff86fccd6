use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::error::GatewayError;
use crate::protocol::anthropic::{AnthropicContentBlock, AnthropicRequest, AnthropicTool};
use crate::protocol::canonical::{
    ContentBlock, ConversationRequest, GenerationParams, Message, Role, ToolChoice, ToolDefinition,
};

/// Parse, validate and decode a raw `/v1/messages` body.
///
/// # Errors
///
/// Returns [`GatewayError::RequestValidation`] when the body is not JSON, fails
/// field validation, or references tool results that were never requested.
pub fn decode_anthropic_body(body: &[u8]) -> Result<ConversationRequest, GatewayError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| GatewayError::RequestValidation(format!("body is not valid JSON: {e}")))?;
    validate_request_value(&value)?;
    let wire: AnthropicRequest = serde_json::from_value(value)
        .map_err(|e| GatewayError::RequestValidation(e.to_string()))?;
    decode_anthropic_request(wire)
}

/// Check field presence and ranges on the untyped body, collecting every
/// problem into a single `field: message; ...` report.
///
/// # Errors
///
/// Returns [`GatewayError::RequestValidation`] listing all failed checks.
pub fn validate_request_value(value: &serde_json::Value) -> Result<(), GatewayError> {
    let Some(body) = value.as_object() else {
        return Err(GatewayError::RequestValidation(
            "body: must be a JSON object".to_string(),
        ));
    };
    let mut errors: Vec<(&str, &str)> = Vec::new();

    match body.get("model").and_then(serde_json::Value::as_str) {
        Some(model) if !model.trim().is_empty() => {}
        _ => errors.push(("model", "is required and must be a non-empty string")),
    }

    match body.get("max_tokens") {
        Some(tokens) if tokens.as_u64().is_some_and(|n| n > 0) => {}
        _ => errors.push(("max_tokens", "is required and must be a positive integer")),
    }

    match body.get("messages").and_then(serde_json::Value::as_array) {
        Some(messages) if !messages.is_empty() => {
            let roles_ok = messages.iter().all(|message| {
                matches!(
                    message.get("role").and_then(serde_json::Value::as_str),
                    Some("user" | "assistant")
                ) && message.get("content").is_some()
            });
            if !roles_ok {
                errors.push((
                    "messages",
                    "each message needs a role of user or assistant and a content field",
                ));
            }
        }
        _ => errors.push(("messages", "is required and must be a non-empty array")),
    }

    for field in ["temperature", "top_p"] {
        if let Some(raw) = body.get(field).filter(|v| !v.is_null()) {
            if !raw.as_f64().is_some_and(|n| (0.0..=1.0).contains(&n)) {
                errors.push((field, "must be a number between 0 and 1"));
            }
        }
    }

    if let Some(stream) = body.get("stream").filter(|v| !v.is_null()) {
        if !stream.is_boolean() {
            errors.push(("stream", "must be a boolean"));
        }
    }

    if errors.is_empty() {
        return Ok(());
    }
    let report = errors
        .iter()
        .map(|(field, message)| format!("{field}: {message}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(GatewayError::RequestValidation(report))
}

/// Decode a typed Anthropic request into the conversation model.
///
/// # Errors
///
/// Returns [`GatewayError::RequestValidation`] for an empty conversation, an
/// unknown role, duplicate tool names, or a `tool_result` whose `tool_use_id`
/// was not produced by an earlier `tool_use` block.
pub fn decode_anthropic_request(
    request: AnthropicRequest,
) -> Result<ConversationRequest, GatewayError> {
    let AnthropicRequest {
        model,
        max_tokens,
        system,
        messages: wire_messages,
        tools: wire_tools,
        tool_choice: wire_tool_choice,
        stream,
        temperature,
        top_p,
        stop_sequences,
        extra: _,
    } = request;

    if wire_messages.is_empty() {
        return Err(GatewayError::RequestValidation(
            "messages: must contain at least one message".to_string(),
        ));
    }

    let mut known_tool_use_ids: FxHashSet<String> = FxHashSet::default();
    let mut messages = Vec::with_capacity(wire_messages.len());
    for (position, msg) in wire_messages.into_iter().enumerate() {
        let role = match msg.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(GatewayError::RequestValidation(format!(
                    "messages.{position}.role: unsupported role '{other}'"
                )))
            }
        };
        let content = decode_content_value(msg.content, position)?;
        for block in &content {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    known_tool_use_ids.insert(id.clone());
                }
                ContentBlock::ToolResult { tool_use_id, .. }
                    if !known_tool_use_ids.contains(tool_use_id) =>
                {
                    return Err(GatewayError::RequestValidation(format!(
                        "messages.{position}: tool_result references unknown tool_use_id '{tool_use_id}'"
                    )));
                }
                _ => {}
            }
        }
        messages.push(Message { role, content });
    }

    let tools = decode_anthropic_tools(wire_tools)?;
    let tool_choice = wire_tool_choice.as_ref().and_then(decode_tool_choice);

    Ok(ConversationRequest {
        model,
        system: decode_system_prompt(system),
        messages,
        tools,
        tool_choice,
        max_tokens,
        stream: stream.unwrap_or(false),
        generation: GenerationParams {
            temperature,
            top_p,
            stop_sequences: stop_sequences.filter(|stops| !stops.is_empty()),
        },
    })
}

/// Decode a content JSON value (string or array of blocks) into content blocks.
fn decode_content_value(
    content: serde_json::Value,
    position: usize,
) -> Result<SmallVec<[ContentBlock; 1]>, GatewayError> {
    match content {
        serde_json::Value::String(text) => Ok(SmallVec::from_elem(ContentBlock::Text(text), 1)),
        serde_json::Value::Array(blocks) => {
            let mut out = SmallVec::with_capacity(blocks.len());
            for block in blocks {
                let block: AnthropicContentBlock = serde_json::from_value(block).map_err(|e| {
                    GatewayError::RequestValidation(format!(
                        "messages.{position}.content: invalid block: {e}"
                    ))
                })?;
                match block {
                    AnthropicContentBlock::Text { text } => out.push(ContentBlock::Text(text)),
                    AnthropicContentBlock::ToolUse { id, name, input } => {
                        out.push(ContentBlock::ToolUse {
                            id,
                            name,
                            arguments: input,
                        });
                    }
                    AnthropicContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => out.push(ContentBlock::ToolResult {
                        tool_use_id,
                        content: flatten_tool_result_content(content),
                        is_error: is_error.unwrap_or(false),
                    }),
                    AnthropicContentBlock::Unsupported => {}
                }
            }
            Ok(out)
        }
        _ => Err(GatewayError::RequestValidation(format!(
            "messages.{position}.content: must be a string or an array of blocks"
        ))),
    }
}

/// Tool result content is a string, an array of text blocks, or arbitrary JSON.
fn flatten_tool_result_content(content: serde_json::Value) -> String {
    match content {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text,
        serde_json::Value::Array(parts) => {
            let all_text = parts
                .iter()
                .all(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"));
            if all_text {
                parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                serde_json::Value::Array(parts).to_string()
            }
        }
        other => other.to_string(),
    }
}

fn decode_system_prompt(system: Option<serde_json::Value>) -> Option<String> {
    match system? {
        serde_json::Value::String(text) if !text.is_empty() => Some(text),
        serde_json::Value::Array(blocks) => {
            let texts: Vec<String> = blocks
                .into_iter()
                .filter_map(|block| {
                    let serde_json::Value::Object(mut obj) = block else {
                        return None;
                    };
                    if obj.get("type").and_then(|t| t.as_str()) != Some("text") {
                        return None;
                    }
                    match obj.remove("text") {
                        Some(serde_json::Value::String(text)) => Some(text),
                        _ => None,
                    }
                })
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

fn decode_anthropic_tools(
    tools: Option<Vec<AnthropicTool>>,
) -> Result<Vec<ToolDefinition>, GatewayError> {
    let Some(tools) = tools else {
        return Ok(Vec::new());
    };
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        if tool.name.trim().is_empty() {
            return Err(GatewayError::RequestValidation(
                "tools: tool name cannot be empty".to_string(),
            ));
        }
        if !seen.insert(tool.name.clone()) {
            return Err(GatewayError::RequestValidation(format!(
                "tools: duplicate tool name '{}'",
                tool.name
            )));
        }
        out.push(ToolDefinition {
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        });
    }
    Ok(out)
}

/// Both the string shorthand (`"auto"`) and the object form are accepted.
fn decode_tool_choice(value: &serde_json::Value) -> Option<ToolChoice> {
    let kind = match value {
        serde_json::Value::String(kind) => kind.as_str(),
        serde_json::Value::Object(obj) => obj.get("type").and_then(|t| t.as_str())?,
        _ => return None,
    };
    match kind {
        "auto" => Some(ToolChoice::Auto),
        "any" => Some(ToolChoice::Any),
        "none" => Some(ToolChoice::None),
        "tool" => value
            .get("name")
            .and_then(|n| n.as_str())
            .map(|name| ToolChoice::Tool(name.to_string())),
        _ => None,
    }
}
