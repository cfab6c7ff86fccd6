//! Incremental `<tool_code>` extraction over a streamed text channel.
//!
//! Text is released as soon as it cannot be part of a tag. Only a possible
//! opening-tag prefix (bounded by [`MAX_OPEN_TAG_LEN`]) or an open tag span is
//! held back. The fragment sequence produced for any chunking of the same text
//! equals [`split_tool_calls`](super::parser::split_tool_calls) on the whole.

use memchr::memchr;

use super::parser::{
    CLOSE_FINDER, MAX_OPEN_TAG_LEN, OpenTagScan, TOOL_CODE_CLOSE, parse_tool_arguments, push_text,
    scan_open_tag,
};
use super::{DecodedFragment, Fragments};

/// Default maximum held-back span (512 KB).
const DEFAULT_MAX_SPAN: usize = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExtractorState {
    /// Scanning plain text. The buffer holds at most a candidate opening tag.
    Text,
    /// Inside an opening tag. The buffer holds the raw tag plus body so far.
    InTag { name: String, body_start: usize },
}

enum TextScan {
    /// Everything before `at` is text; an opening tag starts at `at`.
    Tag { at: usize, end: usize, name: String },
    /// Everything before `at` is text; `at..` might still become a tag.
    HoldFrom(usize),
    /// The whole buffer is text.
    AllText,
}

#[derive(Debug)]
pub struct XmlToolExtractor {
    buffer: String,
    state: ExtractorState,
    close_scan_from: usize,
    max_span: usize,
}

impl Default for XmlToolExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlToolExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_span(DEFAULT_MAX_SPAN)
    }

    #[must_use]
    pub fn with_max_span(max_span: usize) -> Self {
        Self {
            buffer: String::new(),
            state: ExtractorState::Text,
            close_scan_from: 0,
            max_span: max_span.max(MAX_OPEN_TAG_LEN),
        }
    }

    #[must_use]
    pub fn is_inside_tag(&self) -> bool {
        matches!(self.state, ExtractorState::InTag { .. })
    }

    /// Feed a text delta and collect every fragment that is now certain.
    pub fn feed(&mut self, text: &str) -> Fragments {
        let mut out = Fragments::new();
        if text.is_empty() {
            return out;
        }

        // Fast path: nothing held and no tag candidate in this delta.
        if self.buffer.is_empty()
            && matches!(self.state, ExtractorState::Text)
            && memchr(b'<', text.as_bytes()).is_none()
        {
            out.push(DecodedFragment::Text(text.to_string()));
            return out;
        }

        self.buffer.push_str(text);
        loop {
            let progressed = match self.state {
                ExtractorState::Text => self.drain_text(&mut out),
                ExtractorState::InTag { .. } => self.drain_tag(&mut out),
            };
            if !progressed {
                break;
            }
        }
        out
    }

    /// Flush held-back content at end of stream. An unterminated span is
    /// released verbatim as text.
    pub fn finish(&mut self) -> Fragments {
        let mut out = Fragments::new();
        if let ExtractorState::InTag { name, .. } = &self.state {
            tracing::debug!(tool = %name, "unterminated tool_code span released as text");
        }
        let rest = std::mem::take(&mut self.buffer);
        push_text(&mut out, &rest);
        self.state = ExtractorState::Text;
        self.close_scan_from = 0;
        out
    }

    /// Returns true when the extractor entered a tag and should keep going.
    fn drain_text(&mut self, out: &mut Fragments) -> bool {
        match self.scan_text() {
            TextScan::AllText => {
                let text = std::mem::take(&mut self.buffer);
                push_text(out, &text);
                false
            }
            TextScan::HoldFrom(at) => {
                push_text(out, &self.buffer[..at]);
                self.buffer.drain(..at);
                false
            }
            TextScan::Tag { at, end, name } => {
                push_text(out, &self.buffer[..at]);
                self.buffer.drain(..at);
                self.state = ExtractorState::InTag {
                    name,
                    body_start: end,
                };
                self.close_scan_from = end;
                true
            }
        }
    }

    fn scan_text(&self) -> TextScan {
        let bytes = self.buffer.as_bytes();
        let mut cursor = 0;
        while let Some(rel) = memchr(b'<', &bytes[cursor..]) {
            let at = cursor + rel;
            match scan_open_tag(&self.buffer[at..]) {
                OpenTagScan::Tag { end, name } => return TextScan::Tag { at, end, name },
                OpenTagScan::Incomplete => return TextScan::HoldFrom(at),
                OpenTagScan::NotATag => cursor = at + 1,
            }
        }
        TextScan::AllText
    }

    /// Returns true when a span closed and scanning should resume in text.
    fn drain_tag(&mut self, out: &mut Fragments) -> bool {
        let ExtractorState::InTag { name, body_start } = &self.state else {
            return false;
        };
        let body_start = *body_start;
        let from = self.close_scan_from.max(body_start);

        let Some(rel) = CLOSE_FINDER.find(&self.buffer.as_bytes()[from..]) else {
            if self.buffer.len() > self.max_span {
                tracing::warn!(
                    tool = %name,
                    held = self.buffer.len(),
                    "tool_code span exceeded buffer limit, released as text"
                );
                let span = std::mem::take(&mut self.buffer);
                push_text(out, &span);
                self.state = ExtractorState::Text;
                self.close_scan_from = 0;
                return false;
            }
            self.close_scan_from = self
                .buffer
                .len()
                .saturating_sub(TOOL_CODE_CLOSE.len() - 1)
                .max(body_start);
            return false;
        };

        let close_at = from + rel;
        let span_end = close_at + TOOL_CODE_CLOSE.len();
        let arguments = parse_tool_arguments(&self.buffer[body_start..close_at]);
        let name = name.clone();
        match arguments {
            Some(arguments) => {
                out.push(DecodedFragment::ToolCall { name, arguments });
            }
            None => {
                tracing::debug!(tool = %name, "tool_code body is not a JSON object, kept as text");
                push_text(out, &self.buffer[..span_end]);
            }
        }
        self.buffer.drain(..span_end);
        self.state = ExtractorState::Text;
        self.close_scan_from = 0;
        true
    }
}
