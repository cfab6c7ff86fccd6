//! Tool encoding strategies.
//!
//! `Native` forwards tool definitions as structured upstream `tools` and relies
//! on upstream `tool_calls` deltas. `Xml` describes a tag grammar in the system
//! prompt and recovers tool invocations from the model's prose.

pub mod extractor;
pub mod parser;
pub mod prompt;

use smallvec::SmallVec;

use crate::config::ToolFormat;
use crate::protocol::canonical::ToolDefinition;
use crate::protocol::openai_chat::{OpenAiTool, OpenAiToolFunction};

pub use extractor::XmlToolExtractor;

/// A piece of decoded model output.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFragment {
    /// Ordinary text, byte-for-byte as produced by the model.
    Text(String),
    /// A complete tool invocation recovered from the text.
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
}

pub type Fragments = SmallVec<[DecodedFragment; 2]>;

/// Result of encoding tool definitions for the upstream request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodedTools {
    /// Text appended to the upstream system message.
    pub system_suffix: Option<String>,
    /// Structured tool declarations for the upstream `tools` field.
    pub native_tools: Option<Vec<OpenAiTool>>,
}

impl ToolFormat {
    /// Encode tool definitions for the upstream request.
    #[must_use]
    pub fn encode_tools(self, defs: &[ToolDefinition]) -> EncodedTools {
        if defs.is_empty() {
            return EncodedTools::default();
        }
        match self {
            ToolFormat::Native => EncodedTools {
                system_suffix: None,
                native_tools: Some(defs.iter().map(native_tool).collect()),
            },
            ToolFormat::Xml => EncodedTools {
                system_suffix: Some(prompt::generate_xml_tool_instructions(defs)),
                native_tools: None,
            },
        }
    }

    /// Build the incremental text decoder for one stream.
    #[must_use]
    pub fn stream_decoder(self) -> TextDecoder {
        match self {
            ToolFormat::Native => TextDecoder::Passthrough,
            ToolFormat::Xml => TextDecoder::Xml(Box::new(XmlToolExtractor::new())),
        }
    }

    /// Split a complete response text into fragments.
    #[must_use]
    pub fn decode_text(self, text: &str) -> Vec<DecodedFragment> {
        match self {
            ToolFormat::Native => {
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![DecodedFragment::Text(text.to_string())]
                }
            }
            ToolFormat::Xml => parser::split_tool_calls(text),
        }
    }
}

fn native_tool(def: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        type_: "function".to_string(),
        function: OpenAiToolFunction {
            name: def.name.clone(),
            description: def.description.clone(),
            parameters: def.input_schema.clone(),
        },
    }
}

/// Per-stream text path decoder.
#[derive(Debug)]
pub enum TextDecoder {
    Passthrough,
    Xml(Box<XmlToolExtractor>),
}

impl TextDecoder {
    /// Feed one upstream text delta.
    pub fn feed(&mut self, text: &str) -> Fragments {
        match self {
            TextDecoder::Passthrough => {
                let mut out = Fragments::new();
                if !text.is_empty() {
                    out.push(DecodedFragment::Text(text.to_string()));
                }
                out
            }
            TextDecoder::Xml(extractor) => extractor.feed(text),
        }
    }

    /// Flush whatever is still held back at stream end.
    pub fn finish(&mut self) -> Fragments {
        match self {
            TextDecoder::Passthrough => Fragments::new(),
            TextDecoder::Xml(extractor) => extractor.finish(),
        }
    }
}
