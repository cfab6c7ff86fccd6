use bytes::Bytes;

use crate::protocol::anthropic::{AnthropicDelta, AnthropicStreamEvent};
use crate::util::{push_json_string_escaped, push_usize_decimal};

/// Encode one stream event as an SSE frame: `event: {name}\ndata: {json}\n\n`.
#[must_use]
pub fn encode_anthropic_sse_event(event: &AnthropicStreamEvent) -> Bytes {
    let name = event.event_name();
    let mut frame = String::with_capacity(64);
    frame.push_str("event: ");
    frame.push_str(name);
    frame.push_str("\ndata: ");
    match event {
        // Deltas dominate stream volume; skip serde for them.
        AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
            frame.push_str("{\"type\":\"content_block_delta\",\"index\":");
            push_usize_decimal(&mut frame, *index);
            match delta {
                AnthropicDelta::TextDelta { text } => {
                    frame.push_str(",\"delta\":{\"type\":\"text_delta\",\"text\":");
                    push_json_string_escaped(&mut frame, text);
                }
                AnthropicDelta::InputJsonDelta { partial_json } => {
                    frame.push_str(",\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":");
                    push_json_string_escaped(&mut frame, partial_json);
                }
            }
            frame.push_str("}}");
        }
        AnthropicStreamEvent::ContentBlockStop { index } => {
            frame.push_str("{\"type\":\"content_block_stop\",\"index\":");
            push_usize_decimal(&mut frame, *index);
            frame.push('}');
        }
        _ => match serde_json::to_string(event) {
            Ok(json) => frame.push_str(&json),
            Err(e) => {
                tracing::error!(event = name, error = %e, "failed to serialize stream event");
                frame.push_str("{\"type\":\"");
                frame.push_str(name);
                frame.push_str("\"}");
            }
        },
    }
    frame.push_str("\n\n");
    Bytes::from(frame)
}
