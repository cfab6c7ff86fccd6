use std::time::Duration;

/// Connection-establishment failures are retried this many times.
pub(crate) const CONNECT_RETRY_MAX_ATTEMPTS: u32 = 1;
pub(crate) const CONNECT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Whether a transport failure happened before any byte reached the upstream.
/// Failures after the request was sent are never retried.
#[inline]
pub(crate) fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_connect() || is_connect_failure_message(&err.to_string())
}

#[inline]
pub(crate) fn is_connect_failure_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 5] = [
        b"connection refused",
        b"dns error",
        b"failed to lookup address",
        b"tls handshake",
        b"error trying to connect",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}
