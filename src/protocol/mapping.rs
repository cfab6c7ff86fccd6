use super::canonical::{StopReason, ToolChoice, Usage};
use super::openai_chat::{
    OpenAiToolChoice, OpenAiToolChoiceFunction, OpenAiToolChoiceFunctionCall, OpenAiUsage,
};

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn openai_finish_to_stop_reason(s: &str) -> StopReason {
    match s {
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}

// ---------------------------------------------------------------------------
// Tool choice mapping
// ---------------------------------------------------------------------------

#[must_use]
pub fn tool_choice_to_openai(choice: &ToolChoice) -> OpenAiToolChoice {
    match choice {
        ToolChoice::Auto => OpenAiToolChoice::Mode("auto".to_string()),
        ToolChoice::Any => OpenAiToolChoice::Mode("required".to_string()),
        ToolChoice::None => OpenAiToolChoice::Mode("none".to_string()),
        ToolChoice::Tool(name) => OpenAiToolChoice::Function(OpenAiToolChoiceFunctionCall {
            type_: "function".to_string(),
            function: OpenAiToolChoiceFunction { name: name.clone() },
        }),
    }
}

// ---------------------------------------------------------------------------
// Usage mapping
// ---------------------------------------------------------------------------

#[must_use]
pub fn openai_usage_to_canonical(usage: &OpenAiUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cached_input_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens)
            .filter(|cached| *cached > 0),
    }
}
