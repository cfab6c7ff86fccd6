const ALNUM: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of the random part of generated `msg_`/`toolu_` ids.
const GENERATED_ID_LEN: usize = 24;

#[inline]
fn push_random_alphanumeric(out: &mut String, len: usize) {
    out.extend((0..len).map(|_| ALNUM[fastrand::usize(..ALNUM.len())] as char));
}

fn generated_id(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + GENERATED_ID_LEN);
    out.push_str(prefix);
    push_random_alphanumeric(&mut out, GENERATED_ID_LEN);
    out
}

/// Request id returned in `X-Request-Id`; doubles as the message id of
/// streamed replies.
#[inline]
pub(crate) fn generate_request_id() -> String {
    generated_id("msg_")
}

/// Inbound tool-use id for tool calls the upstream did not name.
#[inline]
pub(crate) fn generate_tool_use_id() -> String {
    generated_id("toolu_")
}

const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn push_json_string_escaped(out: &mut String, value: &str) {
    let bytes = value.as_bytes();
    if bytes.iter().all(|&b| b >= 0x20 && b != b'"' && b != b'\\') {
        out.push('"');
        out.push_str(value);
        out.push('"');
        return;
    }

    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c <= '\u{1f}' => {
                let control = c as u8;
                out.push_str("\\u00");
                out.push(char::from(HEX[(control >> 4) as usize]));
                out.push(char::from(HEX[(control & 0x0f) as usize]));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}

#[inline]
pub(crate) fn push_usize_decimal(out: &mut String, mut n: usize) {
    if n == 0 {
        out.push('0');
        return;
    }

    let mut buf = [0u8; 20];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = b'0' + ((n % 10) as u8);
        n /= 10;
    }
    out.extend(buf[i..].iter().map(|&b| char::from(b)));
}
