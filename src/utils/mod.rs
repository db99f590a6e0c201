//! Small shared helpers: identifier generation, byte-safe truncation, and
//! URL / data-URI classification used by the span pipeline.

use std::time::{SystemTime, UNIX_EPOCH};

use url::Url;

/// Wall-clock time as microseconds since the unix epoch.
pub fn unix_micros(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

/// Generate a 32-character lowercase hex trace id (128 bits, never all-zero).
pub fn gen_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a 16-character lowercase hex span id (64 bits, never zero).
pub fn gen_span_id() -> String {
    format!("{:016x}", fastrand::u64(1..))
}

/// Check that a string is entirely lowercase/uppercase hex digits.
pub fn is_hex_str(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Truncate `s` to at most `max_bytes` bytes without splitting a UTF-8
/// character. Returns the (possibly shortened) string and whether any
/// truncation happened.
///
/// A value of exactly `max_bytes` bytes passes through untouched.
pub fn truncate_by_bytes(s: &str, max_bytes: usize) -> (String, bool) {
    if s.len() <= max_bytes {
        return (s.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    (s[..end].to_string(), true)
}

/// Truncate `s` to at most `max_chars` characters (not bytes).
pub fn truncate_by_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

/// Whether `s` is a syntactically valid absolute http(s) URL with a host.
///
/// Data URIs and bare text deliberately fail this check; they are handled
/// by [`parse_data_uri_base64`].
pub fn is_valid_url(s: &str) -> bool {
    match Url::parse(s) {
        Ok(u) => (u.scheme() == "http" || u.scheme() == "https") && u.has_host(),
        Err(_) => false,
    }
}

/// Extract the base64 payload from a `data:<mime>;base64,<payload>` URI.
///
/// Returns `None` when `s` is not a base64 data URI.
pub fn parse_data_uri_base64(s: &str) -> Option<&str> {
    let rest = s.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    if !meta.ends_with(";base64") {
        return None;
    }
    Some(payload)
}

/// Deduplicate a list of strings preserving first-seen order.
pub fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|s| seen.insert(s.clone())).collect()
}
