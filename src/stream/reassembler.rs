//! Upstream chunk sequence → inbound stream event sequence.
//!
//! The reassembler is advanced one [`UpstreamChunk`] at a time and appends the
//! resulting events to a caller-provided buffer. It never reads ahead: the only
//! state it holds is the open block, the text decoder's tag lookahead and the
//! open tool call's argument accumulator.

use crate::config::ToolFormat;
use crate::error::GatewayError;
use crate::fc::{DecodedFragment, TextDecoder};
use crate::observability::token_counter::{
    resolve_usage, ByteRatioEstimator, ResolvedUsage, TokenEstimator,
};
use crate::protocol::anthropic::response_encoder::anthropic_usage;
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicMessageDeltaBody, AnthropicMessageStart,
    AnthropicStreamEvent, AnthropicUsage,
};
use crate::protocol::canonical::{StopReason, ToolCallFragment, UpstreamChunk, Usage};
use crate::protocol::mapping::openai_finish_to_stop_reason;
use crate::util::generate_tool_use_id;

/// Lifecycle of one reassembled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblerState {
    /// Nothing emitted yet.
    Idle,
    /// `message_start` emitted; blocks are being produced.
    Streaming,
    /// Upstream reported a finish reason; waiting for trailing usage or end.
    Draining,
    /// `message_stop` emitted.
    Closed,
}

#[derive(Debug)]
enum OpenBlock {
    Text {
        index: usize,
    },
    Tool {
        index: usize,
        upstream_index: u32,
        id: String,
        name: Option<String>,
        arguments: String,
        /// `content_block_start` has been emitted.
        started: bool,
    },
}

/// Protocol state machine turning upstream deltas into inbound stream events.
#[derive(Debug)]
pub struct StreamReassembler {
    state: ReassemblerState,
    message_id: String,
    model: String,
    decoder: TextDecoder,
    next_index: usize,
    open: Option<OpenBlock>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    saw_tool_use: bool,
    output_bytes: usize,
    estimated_input_tokens: u64,
}

impl StreamReassembler {
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        model: impl Into<String>,
        tool_format: ToolFormat,
        estimated_input_tokens: u64,
    ) -> Self {
        Self {
            state: ReassemblerState::Idle,
            message_id: message_id.into(),
            model: model.into(),
            decoder: tool_format.stream_decoder(),
            next_index: 0,
            open: None,
            usage: None,
            finish_reason: None,
            saw_tool_use: false,
            output_bytes: 0,
            estimated_input_tokens,
        }
    }

    #[must_use]
    pub fn state(&self) -> ReassemblerState {
        self.state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == ReassemblerState::Closed
    }

    /// Best-available usage: upstream-reported when seen, estimated otherwise.
    #[must_use]
    pub fn usage(&self) -> ResolvedUsage {
        resolve_usage(
            self.usage,
            self.estimated_input_tokens,
            ByteRatioEstimator.estimate_len(self.output_bytes),
        )
    }

    /// Advance with one upstream chunk.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ToolCallDecode`] when closing a tool block whose
    /// arguments are not valid JSON. The terminal events have already been
    /// appended to `out` when this happens.
    pub fn push(
        &mut self,
        chunk: UpstreamChunk,
        out: &mut Vec<AnthropicStreamEvent>,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self.apply(chunk, out);
        if let Err(err) = &result {
            self.terminate(err.kind(), out);
        }
        result
    }

    /// Close the stream after the upstream ended normally.
    ///
    /// # Errors
    ///
    /// Same as [`StreamReassembler::push`].
    pub fn finish(&mut self, out: &mut Vec<AnthropicStreamEvent>) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self.drain(out);
        match &result {
            Ok(()) => {
                let stop_reason = self.final_stop_reason();
                self.terminate(stop_reason.as_str(), out);
            }
            Err(err) => self.terminate(err.kind(), out),
        }
        result
    }

    /// Terminate the stream on an upstream error: close the open block and
    /// attach the error kind as the final stop reason.
    ///
    /// Once the upstream has reported a finish reason the answer is complete,
    /// so the stream is closed as if it had ended normally and `err` is only
    /// logged.
    ///
    /// # Errors
    ///
    /// Returns `err` when the stream was still in progress, or the result of
    /// [`StreamReassembler::finish`] when it was draining.
    pub fn fail(
        &mut self,
        err: GatewayError,
        out: &mut Vec<AnthropicStreamEvent>,
    ) -> Result<(), GatewayError> {
        match self.state {
            ReassemblerState::Closed => Err(err),
            ReassemblerState::Draining => {
                tracing::debug!(
                    error_kind = err.kind(),
                    error = %err,
                    "upstream error after finish reason ignored"
                );
                self.finish(out)
            }
            ReassemblerState::Idle | ReassemblerState::Streaming => {
                self.ensure_started(out);
                // Any ambiguous tag lookahead is discarded with the failed stream.
                let _ = self.decoder.finish();
                let _ = self.close_open(false, out);
                self.terminate(err.kind(), out);
                Err(err)
            }
        }
    }

    fn apply(
        &mut self,
        chunk: UpstreamChunk,
        out: &mut Vec<AnthropicStreamEvent>,
    ) -> Result<(), GatewayError> {
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        if chunk.has_content() {
            self.ensure_started(out);
        }

        if let Some(text) = chunk.text.as_deref().filter(|text| !text.is_empty()) {
            self.output_bytes += text.len();
            for fragment in self.decoder.feed(text) {
                self.emit_fragment(fragment, out)?;
            }
        }

        for fragment in chunk.tool_calls {
            self.emit_tool_fragment(fragment, out)?;
        }

        if let Some(reason) = chunk.finish_reason {
            self.finish_reason = Some(reason);
            self.state = ReassemblerState::Draining;
        }
        Ok(())
    }

    fn drain(&mut self, out: &mut Vec<AnthropicStreamEvent>) -> Result<(), GatewayError> {
        self.ensure_started(out);
        for fragment in self.decoder.finish() {
            self.emit_fragment(fragment, out)?;
        }
        self.close_open(true, out)
    }

    fn ensure_started(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        if self.state != ReassemblerState::Idle {
            return;
        }
        let input_tokens = self
            .usage
            .map_or(self.estimated_input_tokens, |usage| usage.input_tokens);
        out.push(AnthropicStreamEvent::MessageStart {
            message: AnthropicMessageStart {
                id: self.message_id.clone(),
                type_: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: AnthropicUsage {
                    input_tokens,
                    output_tokens: 0,
                    cache_read_input_tokens: None,
                },
            },
        });
        self.state = ReassemblerState::Streaming;
    }

    fn emit_fragment(
        &mut self,
        fragment: DecodedFragment,
        out: &mut Vec<AnthropicStreamEvent>,
    ) -> Result<(), GatewayError> {
        match fragment {
            DecodedFragment::Text(text) => self.emit_text(text, out),
            DecodedFragment::ToolCall { name, arguments } => {
                self.close_open(true, out)?;
                let index = self.take_index();
                self.saw_tool_use = true;
                out.push(AnthropicStreamEvent::ContentBlockStart {
                    index,
                    content_block: AnthropicContentBlock::ToolUse {
                        id: generate_tool_use_id(),
                        name,
                        input: serde_json::json!({}),
                    },
                });
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: AnthropicDelta::InputJsonDelta {
                        partial_json: arguments.to_string(),
                    },
                });
                out.push(AnthropicStreamEvent::ContentBlockStop { index });
                Ok(())
            }
        }
    }

    fn emit_text(
        &mut self,
        text: String,
        out: &mut Vec<AnthropicStreamEvent>,
    ) -> Result<(), GatewayError> {
        let index = match self.open {
            Some(OpenBlock::Text { index }) => index,
            _ => {
                self.close_open(true, out)?;
                let index = self.take_index();
                out.push(AnthropicStreamEvent::ContentBlockStart {
                    index,
                    content_block: AnthropicContentBlock::Text {
                        text: String::new(),
                    },
                });
                self.open = Some(OpenBlock::Text { index });
                index
            }
        };
        out.push(AnthropicStreamEvent::ContentBlockDelta {
            index,
            delta: AnthropicDelta::TextDelta { text },
        });
        Ok(())
    }

    fn emit_tool_fragment(
        &mut self,
        fragment: ToolCallFragment,
        out: &mut Vec<AnthropicStreamEvent>,
    ) -> Result<(), GatewayError> {
        let same_call = matches!(
            &self.open,
            Some(OpenBlock::Tool { upstream_index, .. }) if *upstream_index == fragment.index
        );
        if !same_call {
            self.close_open(true, out)?;
            let index = self.take_index();
            self.saw_tool_use = true;
            self.open = Some(OpenBlock::Tool {
                index,
                upstream_index: fragment.index,
                id: fragment
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(generate_tool_use_id),
                name: None,
                arguments: String::new(),
                started: false,
            });
        }

        let Some(OpenBlock::Tool {
            index,
            id,
            name,
            arguments,
            started,
            ..
        }) = &mut self.open
        else {
            return Ok(());
        };

        if name.is_none() {
            *name = fragment.name.filter(|name| !name.is_empty());
        }
        self.output_bytes += fragment.arguments_fragment.len();

        if *started {
            if !fragment.arguments_fragment.is_empty() {
                arguments.push_str(&fragment.arguments_fragment);
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index: *index,
                    delta: AnthropicDelta::InputJsonDelta {
                        partial_json: fragment.arguments_fragment,
                    },
                });
            }
            return Ok(());
        }

        // The block is announced once the name is known; argument text seen
        // before that is replayed as one delta.
        arguments.push_str(&fragment.arguments_fragment);
        if let Some(tool_name) = name.as_deref() {
            push_tool_start(out, *index, id, tool_name, arguments);
            *started = true;
        }
        Ok(())
    }

    /// Close the open block. Tool arguments are validated when `validate` is
    /// set; the stop event is emitted before any decode error is returned.
    fn close_open(
        &mut self,
        validate: bool,
        out: &mut Vec<AnthropicStreamEvent>,
    ) -> Result<(), GatewayError> {
        match self.open.take() {
            None => Ok(()),
            Some(OpenBlock::Text { index }) => {
                out.push(AnthropicStreamEvent::ContentBlockStop { index });
                Ok(())
            }
            Some(OpenBlock::Tool {
                index,
                id,
                name,
                arguments,
                started,
                ..
            }) => {
                let unnamed = name.is_none();
                let name = name.unwrap_or_default();
                if !started {
                    push_tool_start(out, index, &id, &name, &arguments);
                }
                if arguments.is_empty() {
                    out.push(AnthropicStreamEvent::ContentBlockDelta {
                        index,
                        delta: AnthropicDelta::InputJsonDelta {
                            partial_json: "{}".to_string(),
                        },
                    });
                }
                out.push(AnthropicStreamEvent::ContentBlockStop { index });

                if validate && unnamed {
                    return Err(GatewayError::ToolCallDecode {
                        tool_name: id,
                        detail: "tool call has no function name".to_string(),
                    });
                }
                if validate && !arguments.is_empty() {
                    if let Err(e) = serde_json::from_str::<serde_json::Value>(&arguments) {
                        return Err(GatewayError::ToolCallDecode {
                            tool_name: name,
                            detail: e.to_string(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn final_stop_reason(&self) -> StopReason {
        let mapped = self
            .finish_reason
            .as_deref()
            .map_or(StopReason::EndTurn, openai_finish_to_stop_reason);
        if self.saw_tool_use && mapped == StopReason::EndTurn {
            StopReason::ToolUse
        } else {
            mapped
        }
    }

    fn terminate(&mut self, stop_reason: &str, out: &mut Vec<AnthropicStreamEvent>) {
        out.push(AnthropicStreamEvent::MessageDelta {
            delta: AnthropicMessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: anthropic_usage(self.usage().usage),
        });
        out.push(AnthropicStreamEvent::MessageStop {});
        self.state = ReassemblerState::Closed;
    }
}

fn push_tool_start(
    out: &mut Vec<AnthropicStreamEvent>,
    index: usize,
    id: &str,
    name: &str,
    buffered_arguments: &str,
) {
    out.push(AnthropicStreamEvent::ContentBlockStart {
        index,
        content_block: AnthropicContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: serde_json::json!({}),
        },
    });
    if !buffered_arguments.is_empty() {
        out.push(AnthropicStreamEvent::ContentBlockDelta {
            index,
            delta: AnthropicDelta::InputJsonDelta {
                partial_json: buffered_arguments.to_string(),
            },
        });
    }
}
