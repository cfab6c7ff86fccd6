use rustc_hash::FxHashMap;

use crate::config::ToolFormat;
use crate::error::GatewayError;
use crate::fc::parser::{render_tool_code, render_tool_output};
use crate::fc::prompt::has_xml_tool_instructions;
use crate::observability::token_counter::estimate_tokens;
use crate::protocol::canonical::{ContentBlock, ConversationRequest, Message, Role};
use crate::protocol::mapping::tool_choice_to_openai;

use super::{
    OpenAiChatRequest, OpenAiMessage, OpenAiStreamOptions, OpenAiToolCall, OpenAiToolCallFunction,
};

/// Tokens kept free between prompt and completion when fitting a context window.
pub const CONTEXT_RESERVE_TOKENS: u64 = 256;
/// `max_tokens: 1` requests are raised to this value.
const MIN_UPSTREAM_MAX_TOKENS: u64 = 32;
/// Completion budget never drops below this when capped by the context window.
const MIN_COMPLETION_TOKENS: u64 = 256;

/// Per-request encoding inputs resolved from configuration.
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions<'a> {
    pub upstream_model: &'a str,
    pub tool_format: ToolFormat,
    /// Effective context window in tokens, when known.
    pub context_window: Option<u64>,
}

/// Encode a decoded request into the `OpenAI` Chat Completions wire format.
///
/// # Errors
///
/// Returns [`GatewayError::RequestValidation`] for an empty conversation and
/// [`GatewayError::ContextWindowExceeded`] when the newest message alone does
/// not fit the configured context window.
pub fn encode_openai_chat_request(
    request: &ConversationRequest,
    options: &EncodeOptions<'_>,
) -> Result<OpenAiChatRequest, GatewayError> {
    if request.messages.is_empty() {
        return Err(GatewayError::RequestValidation(
            "messages: at least one message is required".to_string(),
        ));
    }

    let format = options.tool_format;
    let encoded_tools = format.encode_tools(&request.tools);

    let mut messages: Vec<OpenAiMessage> = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = encode_system(request.system.as_deref(), encoded_tools.system_suffix) {
        messages.push(OpenAiMessage::text("system", system));
    }

    let mut ids = ToolIdMap::default();
    for message in &request.messages {
        match format {
            ToolFormat::Native => encode_native_message(message, &mut ids, &mut messages),
            ToolFormat::Xml => encode_xml_message(request, message, &mut messages),
        }
    }

    let mut max_tokens = if request.max_tokens == 1 {
        MIN_UPSTREAM_MAX_TOKENS
    } else {
        request.max_tokens
    };
    if let Some(window) = options.context_window.filter(|window| *window > 0) {
        let cap = MIN_COMPLETION_TOKENS.max(window.saturating_sub(CONTEXT_RESERVE_TOKENS));
        if max_tokens > cap {
            tracing::debug!(max_tokens, cap, window, "max_tokens capped by context window");
            max_tokens = cap;
        }
        let budget = window
            .saturating_sub(max_tokens)
            .saturating_sub(CONTEXT_RESERVE_TOKENS);
        if budget > 0 {
            fit_messages_to_budget(&mut messages, budget, window)?;
        }
    }

    let tool_choice = match (&request.tool_choice, format) {
        (Some(choice), ToolFormat::Native) if encoded_tools.native_tools.is_some() => {
            Some(tool_choice_to_openai(choice))
        }
        (Some(_), ToolFormat::Xml) => {
            tracing::warn!("tool_choice is not expressible in xml tool format, dropped");
            None
        }
        _ => None,
    };

    let temperature = match format {
        ToolFormat::Xml => Some(0.0),
        ToolFormat::Native => request.generation.temperature,
    };

    Ok(OpenAiChatRequest {
        model: options.upstream_model.to_string(),
        messages,
        tools: encoded_tools.native_tools,
        tool_choice,
        stream: request.stream,
        stream_options: request
            .stream
            .then_some(OpenAiStreamOptions { include_usage: true }),
        temperature,
        max_tokens: Some(max_tokens),
        top_p: request.generation.top_p,
        stop: request
            .generation
            .stop_sequences
            .clone()
            .filter(|stops| !stops.is_empty()),
    })
}

fn encode_system(system: Option<&str>, suffix: Option<String>) -> Option<String> {
    let system = system.filter(|text| !text.is_empty());
    match (system, suffix) {
        (Some(system), Some(_)) if has_xml_tool_instructions(system) => Some(system.to_string()),
        (Some(system), Some(suffix)) => Some(format!("{system}\n\n{}", suffix.trim_start())),
        (Some(system), None) => Some(system.to_string()),
        (None, Some(suffix)) => Some(suffix.trim_start().to_string()),
        (None, None) => None,
    }
}

// ---------------------------------------------------------------------------
// Tool id de-duplication
// ---------------------------------------------------------------------------

/// Upstreams require tool call ids to be unique within one request. A reused
/// id gets a `_<n>` suffix; results resolve to the most recent mapping.
#[derive(Default)]
struct ToolIdMap {
    uses: FxHashMap<String, u32>,
    current: FxHashMap<String, String>,
}

impl ToolIdMap {
    fn assign(&mut self, id: &str) -> String {
        let count = self.uses.entry(id.to_string()).or_insert(0);
        let mapped = if *count == 0 {
            id.to_string()
        } else {
            format!("{id}_{count}")
        };
        *count += 1;
        self.current.insert(id.to_string(), mapped.clone());
        mapped
    }

    fn resolve(&self, id: &str) -> String {
        self.current
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }
}

// ---------------------------------------------------------------------------
// Message encoding
// ---------------------------------------------------------------------------

fn encode_native_message(message: &Message, ids: &mut ToolIdMap, out: &mut Vec<OpenAiMessage>) {
    let mut text_parts: Vec<&str> = Vec::new();
    match message.role {
        Role::User => {
            // Tool results go first so they directly follow the assistant turn
            // that issued the calls.
            for block in &message.content {
                match block {
                    ContentBlock::Text(text) => text_parts.push(text),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => out.push(OpenAiMessage {
                        role: "tool".to_string(),
                        content: Some(content.clone()),
                        tool_calls: None,
                        tool_call_id: Some(ids.resolve(tool_use_id)),
                    }),
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !text_parts.is_empty() {
                out.push(OpenAiMessage::text("user", text_parts.join("\n")));
            }
        }
        Role::Assistant => {
            let mut tool_calls = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::Text(text) => text_parts.push(text),
                    ContentBlock::ToolUse {
                        id,
                        name,
                        arguments,
                    } => tool_calls.push(OpenAiToolCall {
                        id: ids.assign(id),
                        type_: "function".to_string(),
                        function: OpenAiToolCallFunction {
                            name: name.clone(),
                            arguments: arguments.to_string(),
                        },
                    }),
                    ContentBlock::ToolResult { .. } => {}
                }
            }
            let text = text_parts.join("\n");
            if tool_calls.is_empty() {
                out.push(OpenAiMessage::text("assistant", text));
            } else {
                out.push(OpenAiMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: Some(tool_calls),
                    tool_call_id: None,
                });
            }
        }
    }
}

fn encode_xml_message(
    request: &ConversationRequest,
    message: &Message,
    out: &mut Vec<OpenAiMessage>,
) {
    match message.role {
        Role::User => {
            let mut results: Vec<String> = Vec::new();
            let mut text_parts: Vec<&str> = Vec::new();
            for block in &message.content {
                match block {
                    ContentBlock::Text(text) => text_parts.push(text),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let name = request
                            .tool_name_for_use_id(tool_use_id)
                            .unwrap_or(tool_use_id.as_str());
                        results.push(render_tool_output(name, content, *is_error));
                    }
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            let text = text_parts.join("\n");
            if !text.is_empty() {
                results.push(text);
            }
            if !results.is_empty() {
                out.push(OpenAiMessage::text("user", results.join("\n\n")));
            }
        }
        Role::Assistant => {
            let parts: Vec<String> = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) => Some(text.clone()),
                    ContentBlock::ToolUse {
                        name, arguments, ..
                    } => Some(render_tool_code(name, arguments)),
                    ContentBlock::ToolResult { .. } => None,
                })
                .collect();
            out.push(OpenAiMessage::text("assistant", parts.join("\n")));
        }
    }
}

// ---------------------------------------------------------------------------
// Context window fitting
// ---------------------------------------------------------------------------

fn estimate_message_tokens(message: &OpenAiMessage) -> u64 {
    let content = message.content.as_deref().map_or(0, estimate_tokens);
    let calls = message.tool_calls.as_deref().map_or(0, |calls| {
        calls
            .iter()
            .map(|call| {
                estimate_tokens(&call.function.name) + estimate_tokens(&call.function.arguments)
            })
            .sum()
    });
    content + calls
}

/// Drop the oldest non-system messages until the estimate fits `budget`.
/// System messages and the newest message are always kept.
fn fit_messages_to_budget(
    messages: &mut Vec<OpenAiMessage>,
    budget: u64,
    window: u64,
) -> Result<(), GatewayError> {
    let estimates: Vec<u64> = messages.iter().map(estimate_message_tokens).collect();
    let total: u64 = estimates.iter().sum();
    if total <= budget {
        return Ok(());
    }

    let original_len = messages.len();
    let conversation: Vec<usize> = (0..messages.len())
        .filter(|&i| messages[i].role != "system")
        .collect();
    let system_tokens: u64 = (0..messages.len())
        .filter(|&i| messages[i].role == "system")
        .map(|i| estimates[i])
        .sum();

    // Keep the longest suffix of the conversation that fits.
    let mut kept_from = conversation.len().saturating_sub(1);
    let mut running = system_tokens + conversation.last().map_or(0, |&i| estimates[i]);
    if running > budget {
        return Err(GatewayError::ContextWindowExceeded(format!(
            "estimated prompt of {running} tokens exceeds the {budget}-token budget of a {window}-token context window"
        )));
    }
    while kept_from > 0 {
        let candidate = estimates[conversation[kept_from - 1]];
        if running + candidate > budget {
            break;
        }
        running += candidate;
        kept_from -= 1;
    }
    // A tool result without its issuing assistant turn is rejected upstream.
    while kept_from + 1 < conversation.len() && messages[conversation[kept_from]].role == "tool" {
        kept_from += 1;
    }

    let dropped: rustc_hash::FxHashSet<usize> = conversation[..kept_from].iter().copied().collect();
    let mut index = 0;
    messages.retain(|_| {
        let keep = !dropped.contains(&index);
        index += 1;
        keep
    });
    tracing::info!(
        kept = messages.len(),
        total = original_len,
        budget,
        "dropped oldest messages to fit context window"
    );
    Ok(())
}
