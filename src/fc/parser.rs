//! `<tool_code>` tag grammar.
//!
//! A tool invocation is `<tool_code name="TOOL">{json object}</tool_code>`.
//! Anything that does not match exactly stays plain text.

use std::sync::LazyLock;

use memchr::{memchr, memmem};

use super::DecodedFragment;

pub const TOOL_CODE_OPEN_PREFIX: &str = "<tool_code";
pub const TOOL_CODE_CLOSE: &str = "</tool_code>";
pub const TOOL_OUTPUT_OPEN_PREFIX: &str = "<tool_output";
pub const TOOL_OUTPUT_CLOSE: &str = "</tool_output>";

/// Longest opening tag considered. A `<tool_code` with no `>` inside this
/// window is not a tag.
pub const MAX_OPEN_TAG_LEN: usize = 256;

pub(crate) static CLOSE_FINDER: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(TOOL_CODE_CLOSE.as_bytes()));

/// Outcome of inspecting text that starts at a `<`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OpenTagScan {
    /// A complete opening tag of `end` bytes naming `name`.
    Tag { end: usize, name: String },
    /// Could still become an opening tag once more text arrives.
    Incomplete,
    NotATag,
}

pub(crate) fn scan_open_tag(s: &str) -> OpenTagScan {
    let bytes = s.as_bytes();
    let prefix = TOOL_CODE_OPEN_PREFIX.as_bytes();
    if bytes.len() < prefix.len() {
        return if prefix.starts_with(bytes) {
            OpenTagScan::Incomplete
        } else {
            OpenTagScan::NotATag
        };
    }
    if !bytes.starts_with(prefix) {
        return OpenTagScan::NotATag;
    }
    match bytes.get(prefix.len()) {
        None => return OpenTagScan::Incomplete,
        Some(c) if c.is_ascii_whitespace() || *c == b'>' => {}
        Some(_) => return OpenTagScan::NotATag,
    }

    let window_end = bytes.len().min(MAX_OPEN_TAG_LEN);
    match memchr(b'>', &bytes[..window_end]) {
        Some(gt) => match parse_name_attr(&s[prefix.len()..gt]) {
            Some(name) => OpenTagScan::Tag { end: gt + 1, name },
            None => OpenTagScan::NotATag,
        },
        None if bytes.len() >= MAX_OPEN_TAG_LEN => OpenTagScan::NotATag,
        None => OpenTagScan::Incomplete,
    }
}

/// Extract the `name="..."` (or single-quoted) attribute value.
fn parse_name_attr(attrs: &str) -> Option<String> {
    let mut offset = 0;
    while let Some(rel) = attrs[offset..].find("name") {
        let pos = offset + rel;
        offset = pos + "name".len();
        let preceded_by_space = pos == 0 || attrs.as_bytes()[pos - 1].is_ascii_whitespace();
        if !preceded_by_space {
            continue;
        }
        let Some(value) = attrs[offset..].trim_start().strip_prefix('=') else {
            continue;
        };
        let value = value.trim_start();
        let quote = value.chars().next()?;
        if quote != '"' && quote != '\'' {
            return None;
        }
        let inner = &value[1..];
        let end = inner.find(quote)?;
        let name = inner[..end].trim();
        return (!name.is_empty()).then(|| name.to_string());
    }
    None
}

/// Parse a tag body into a JSON object. `None` means "not a tool call".
pub(crate) fn parse_tool_arguments(body: &str) -> Option<serde_json::Value> {
    let mut body = body.trim();
    if let Some(fenced) = body.strip_prefix("```") {
        let fenced = fenced.strip_prefix("json").unwrap_or(fenced);
        body = fenced.strip_suffix("```")?.trim();
    }
    if body.is_empty() {
        return Some(serde_json::Value::Object(serde_json::Map::new()));
    }
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Append text, merging with a preceding text fragment.
pub(crate) fn push_text<E>(out: &mut E, text: &str)
where
    E: Extend<DecodedFragment> + AsMut<[DecodedFragment]>,
{
    if text.is_empty() {
        return;
    }
    if let Some(DecodedFragment::Text(last)) = out.as_mut().last_mut() {
        last.push_str(text);
        return;
    }
    out.extend(std::iter::once(DecodedFragment::Text(text.to_string())));
}

/// Split a complete text into text and tool-call fragments in one pass.
#[must_use]
pub fn split_tool_calls(text: &str) -> Vec<DecodedFragment> {
    let mut out = Vec::new();
    let bytes = text.as_bytes();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(rel) = memchr(b'<', &bytes[cursor..]) {
        let at = cursor + rel;
        let OpenTagScan::Tag { end, name } = scan_open_tag(&text[at..]) else {
            cursor = at + 1;
            continue;
        };
        let body_start = at + end;
        let Some(close_rel) = CLOSE_FINDER.find(&bytes[body_start..]) else {
            break;
        };
        let close_at = body_start + close_rel;
        let span_end = close_at + TOOL_CODE_CLOSE.len();
        if let Some(arguments) = parse_tool_arguments(&text[body_start..close_at]) {
            push_text(&mut out, &text[text_start..at]);
            out.push(DecodedFragment::ToolCall { name, arguments });
            text_start = span_end;
        }
        cursor = span_end;
    }

    push_text(&mut out, &text[text_start..]);
    out
}

/// Render a tool invocation in the grammar the model was taught.
#[must_use]
pub fn render_tool_code(name: &str, arguments: &serde_json::Value) -> String {
    format!("{TOOL_CODE_OPEN_PREFIX} name=\"{name}\">\n{arguments}\n{TOOL_CODE_CLOSE}")
}

/// Render a tool result in the grammar the model was taught.
#[must_use]
pub fn render_tool_output(name: &str, content: &str, is_error: bool) -> String {
    let error_attr = if is_error { " is_error=\"true\"" } else { "" };
    format!(
        "{TOOL_OUTPUT_OPEN_PREFIX} name=\"{name}\"{error_attr}>\n{content}\n{TOOL_OUTPUT_CLOSE}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_tag_scan_states() {
        assert_eq!(scan_open_tag("<tool"), OpenTagScan::Incomplete);
        assert_eq!(scan_open_tag("<tool_code"), OpenTagScan::Incomplete);
        assert_eq!(scan_open_tag("<tool_code name=\"Re"), OpenTagScan::Incomplete);
        assert_eq!(scan_open_tag("<tool_codes>"), OpenTagScan::NotATag);
        assert_eq!(scan_open_tag("<div>"), OpenTagScan::NotATag);
        assert_eq!(scan_open_tag("<tool_code>"), OpenTagScan::NotATag);
        assert_eq!(
            scan_open_tag("<tool_code name='Read' >{}"),
            OpenTagScan::Tag {
                end: 23,
                name: "Read".to_string()
            }
        );
    }

    #[test]
    fn test_overlong_open_tag_is_not_a_tag() {
        let long = format!("<tool_code name=\"{}", "x".repeat(MAX_OPEN_TAG_LEN));
        assert_eq!(scan_open_tag(&long), OpenTagScan::NotATag);
    }

    #[test]
    fn test_name_attribute_must_be_a_whole_word() {
        assert_eq!(parse_name_attr(" toolname=\"x\""), None);
        assert_eq!(
            parse_name_attr(" id=\"1\" name = \"lookup\""),
            Some("lookup".to_string())
        );
        assert_eq!(parse_name_attr(" name=lookup"), None);
    }

    #[test]
    fn test_split_text_and_calls() {
        let text = "Thinking first.\n<tool_code name=\"Read\">\n{\"file_path\": \"src/a.rs\"}\n</tool_code>\nDone.";
        let fragments = split_tool_calls(text);
        assert_eq!(
            fragments,
            vec![
                DecodedFragment::Text("Thinking first.\n".to_string()),
                DecodedFragment::ToolCall {
                    name: "Read".to_string(),
                    arguments: json!({"file_path":"src/a.rs"}),
                },
                DecodedFragment::Text("\nDone.".to_string()),
            ]
        );
    }

    #[test]
    fn test_malformed_json_stays_text() {
        let text = "a <tool_code name=\"Read\">{file_path: 1}</tool_code> b";
        assert_eq!(
            split_tool_calls(text),
            vec![DecodedFragment::Text(text.to_string())]
        );
    }

    #[test]
    fn test_unterminated_span_stays_text() {
        let text = "x <tool_code name=\"Read\">{\"a\":1}";
        assert_eq!(
            split_tool_calls(text),
            vec![DecodedFragment::Text(text.to_string())]
        );
    }

    #[test]
    fn test_fenced_and_empty_bodies() {
        assert_eq!(
            parse_tool_arguments("```json\n{\"a\":1}\n```"),
            Some(json!({"a":1}))
        );
        assert_eq!(parse_tool_arguments("  \n"), Some(json!({})));
        assert_eq!(parse_tool_arguments("[1,2]"), None);
    }

    #[test]
    fn test_multiple_calls_back_to_back() {
        let text = "<tool_code name=\"a\">{}</tool_code><tool_code name=\"b\">{\"x\":2}</tool_code>";
        let fragments = split_tool_calls(text);
        assert_eq!(fragments.len(), 2);
        assert!(matches!(&fragments[1], DecodedFragment::ToolCall { name, .. } if name == "b"));
    }

    #[test]
    fn test_rendered_tool_code_parses_back() {
        let rendered = render_tool_code("lookup", &json!({"q":"x"}));
        assert_eq!(
            split_tool_calls(&rendered),
            vec![DecodedFragment::ToolCall {
                name: "lookup".to_string(),
                arguments: json!({"q":"x"}),
            }]
        );
    }
}
