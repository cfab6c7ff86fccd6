use smallvec::SmallVec;

/// Inbound message role. The inbound protocol carries system text separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A typed unit of message content.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// One message of the conversation. Block order is preserved exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: SmallVec<[ContentBlock; 1]>,
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Inbound tool choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool(String),
}

/// Sampling parameters forwarded to the upstream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Option<Vec<String>>,
}

/// The decoded and validated inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: u64,
    pub stream: bool,
    pub generation: GenerationParams,
}

impl ConversationRequest {
    /// Name of the tool invoked by `tool_use_id`, searching prior assistant turns.
    #[must_use]
    pub fn tool_name_for_use_id(&self, tool_use_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .filter(|message| message.role == Role::Assistant)
            .flat_map(|message| message.content.iter())
            .find_map(|block| match block {
                ContentBlock::ToolUse { id, name, .. } if id == tool_use_id => Some(name.as_str()),
                _ => None,
            })
    }
}

/// Why the model stopped generating, in inbound vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
        }
    }
}

/// Token counts as reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: Option<u64>,
}

/// One indexed fragment of a streamed native tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments_fragment: String,
}

/// One delta unit of the upstream stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamChunk {
    pub role: Option<String>,
    pub text: Option<String>,
    pub tool_calls: SmallVec<[ToolCallFragment; 1]>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl UpstreamChunk {
    /// Whether the chunk carries anything beyond bookkeeping.
    #[must_use]
    pub fn has_content(&self) -> bool {
        self.role.is_some()
            || self.text.as_deref().is_some_and(|text| !text.is_empty())
            || !self.tool_calls.is_empty()
            || self.finish_reason.is_some()
    }

    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tool_call(fragment: ToolCallFragment) -> Self {
        let mut chunk = Self::default();
        chunk.tool_calls.push(fragment);
        chunk
    }

    #[must_use]
    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// The converted unary reply, before inbound wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}
