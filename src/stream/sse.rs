//! Incremental SSE parsing of the upstream response body.
//!
//! Bytes arrive in arbitrary boundaries (mid-line, mid-UTF-8 sequence). The
//! parser buffers partial lines and yields complete events; the chunk stream
//! on top decodes each `data:` payload into an [`UpstreamChunk`].

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;

use crate::error::GatewayError;
use crate::protocol::canonical::UpstreamChunk;
use crate::protocol::openai_chat::stream::{decode_openai_stream_data, UpstreamFrame};

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text and append complete events into `out`.
    ///
    /// - `event:` sets the event type of the next dispatch
    /// - `data:` lines accumulate, joined with `\n`
    /// - an empty line dispatches the pending event
    /// - `:` comments and unknown fields are ignored
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let scan_start = self.read_offset;
        let mut processed_up_to = scan_start;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            let line = line.strip_suffix('\r').unwrap_or(line);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                out,
            );
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
        } else if self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024 {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Flush at end of body: a trailing line without newline and a pending
    /// event without its blank-line terminator are still dispatched.
    pub fn finish_into(&mut self, out: &mut Vec<SseEvent>) {
        if self.read_offset < self.buffer.len() {
            let rest = std::mem::take(&mut self.buffer);
            let line = &rest[self.read_offset..];
            let line = line.strip_suffix('\r').unwrap_or(line);
            Self::process_line(
                line,
                &mut self.event_type,
                &mut self.data_buffer,
                &mut self.has_data,
                out,
            );
        }
        self.buffer.clear();
        self.read_offset = 0;
        Self::process_line(
            "",
            &mut self.event_type,
            &mut self.data_buffer,
            &mut self.has_data,
            out,
        );
    }

    fn process_line(
        line: &str,
        event_type: &mut Option<String>,
        data_buffer: &mut String,
        has_data: &mut bool,
        events: &mut Vec<SseEvent>,
    ) {
        if line.is_empty() {
            if *has_data {
                events.push(SseEvent {
                    event: event_type.take(),
                    data: std::mem::take(data_buffer),
                });
                *has_data = false;
            } else {
                *event_type = None;
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            if *has_data {
                data_buffer.push('\n');
            } else {
                *has_data = true;
            }
            data_buffer.push_str(value);
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            *event_type = Some(value.to_string());
        }
    }
}

fn invalid_utf8(e: std::str::Utf8Error) -> GatewayError {
    GatewayError::UpstreamMalformedResponse(format!("stream is not valid UTF-8: {e}"))
}

/// Length of the longest valid prefix, allowing an incomplete trailing sequence.
fn utf8_valid_prefix(bytes: &[u8]) -> Result<usize, GatewayError> {
    match std::str::from_utf8(bytes) {
        Ok(_) => Ok(bytes.len()),
        Err(e) if e.error_len().is_none() => Ok(e.valid_up_to()),
        Err(e) => Err(invalid_utf8(e)),
    }
}

/// Feed one body chunk into the parser. An incomplete trailing UTF-8
/// sequence is carried over to the next chunk.
fn feed_body_chunk(
    carry: &mut Vec<u8>,
    parser: &mut SseParser,
    bytes: &[u8],
    out: &mut Vec<SseEvent>,
) -> Result<(), GatewayError> {
    if carry.is_empty() {
        let valid = utf8_valid_prefix(bytes)?;
        let text = std::str::from_utf8(&bytes[..valid]).map_err(invalid_utf8)?;
        parser.feed_into(text, out);
        carry.extend_from_slice(&bytes[valid..]);
    } else {
        carry.extend_from_slice(bytes);
        let valid = utf8_valid_prefix(carry)?;
        let text = std::str::from_utf8(&carry[..valid]).map_err(invalid_utf8)?;
        parser.feed_into(text, out);
        carry.drain(..valid);
    }
    Ok(())
}

/// Decode an upstream SSE body into upstream chunks.
///
/// The stream ends after `[DONE]`, after the body ends, or after the first
/// error. Nothing is read from the body beyond what the consumer pulls.
pub fn upstream_chunk_stream<S>(
    body: S,
) -> impl Stream<Item = Result<UpstreamChunk, GatewayError>> + Send
where
    S: Stream<Item = Result<Bytes, GatewayError>> + Send + 'static,
{
    struct State<S> {
        body: std::pin::Pin<Box<S>>,
        parser: SseParser,
        carry: Vec<u8>,
        pending: std::collections::VecDeque<SseEvent>,
        scratch: Vec<SseEvent>,
        body_done: bool,
        finished: bool,
    }

    let state = State {
        body: Box::pin(body),
        parser: SseParser::new(),
        carry: Vec::new(),
        pending: std::collections::VecDeque::new(),
        scratch: Vec::new(),
        body_done: false,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }
            if let Some(event) = state.pending.pop_front() {
                match decode_openai_stream_data(&event.data) {
                    Ok(Some(UpstreamFrame::Chunk(chunk))) => return Some((Ok(chunk), state)),
                    Ok(Some(UpstreamFrame::Done)) => return None,
                    Ok(None) => continue,
                    Err(err) => {
                        state.finished = true;
                        return Some((Err(err), state));
                    }
                }
            }
            if state.body_done {
                return None;
            }

            match state.body.as_mut().next().await {
                Some(Ok(bytes)) => {
                    if let Err(err) = feed_body_chunk(
                        &mut state.carry,
                        &mut state.parser,
                        &bytes,
                        &mut state.scratch,
                    ) {
                        state.finished = true;
                        return Some((Err(err), state));
                    }
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.body_done = true;
                    state.parser.finish_into(&mut state.scratch);
                }
            }
            state.pending.extend(state.scratch.drain(..));
        }
    })
}
