//! Cross-process propagation: encoding a span's identity and baggage into a
//! header map and parsing it back on the receiving side.
//!
//! The parent header is `{version:02x}-{trace_id:32x}-{span_id:16x}-{flags:02x}`;
//! the baggage header is a comma-separated `k=v` list with both sides
//! URL-escaped. Header names are matched case-insensitively. Parsing is
//! tolerant: a malformed parent yields a context with empty ids (the trace
//! continues locally), malformed baggage entries are skipped individually.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{LoopError, Result};
use crate::trace::attribute::TRACE_HEADER_VERSION;
use crate::trace::span::{Span, SpanContext};
use crate::utils;

/// Header carrying the parent identity.
pub const HEADER_TRACEPARENT: &str = "X-Loop-Traceparent";
/// Header carrying the baggage map.
pub const HEADER_BAGGAGE: &str = "X-Loop-Baggage";

const ZERO_TRACE_ID: &str = "00000000000000000000000000000000";
const ZERO_SPAN_ID: &str = "0000000000000000";

impl Span {
    /// Encode this span's identity and baggage as propagation headers.
    ///
    /// The no-op span yields an empty map.
    pub fn to_header(&self) -> Result<HashMap<String, String>> {
        let Some(inner) = &self.inner else {
            return Ok(HashMap::new());
        };

        let mut headers = HashMap::with_capacity(2);
        headers.insert(
            HEADER_TRACEPARENT.to_string(),
            format!(
                "{:02x}-{}-{}-{:02x}",
                TRACE_HEADER_VERSION, inner.trace_id, inner.span_id, inner.flags
            ),
        );
        let baggage = inner.state().baggage.clone();
        if !baggage.is_empty() {
            headers.insert(HEADER_BAGGAGE.to_string(), encode_baggage(&baggage));
        }
        Ok(headers)
    }
}

fn encode_baggage(baggage: &HashMap<String, String>) -> String {
    // entries are stored already escaped
    let mut entries: Vec<String> = baggage.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    entries.sort();
    entries.join(",")
}

/// Parse a header map into a [`SpanContext`].
///
/// Lookup is case-insensitive on header names. A malformed parent header is
/// logged and yields empty ids.
pub fn from_header(headers: &HashMap<String, String>) -> SpanContext {
    let lowered: HashMap<String, &String> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    let mut ctx = SpanContext::default();
    if let Some(parent) = lowered.get(&HEADER_TRACEPARENT.to_ascii_lowercase()) {
        match parse_header_parent(parent) {
            Ok((trace_id, span_id)) => {
                ctx.trace_id = trace_id;
                ctx.span_id = span_id;
            }
            Err(e) => warn!(error = %e, "failed to parse traceparent header"),
        }
    }
    if let Some(baggage) = lowered.get(&HEADER_BAGGAGE.to_ascii_lowercase()) {
        ctx.baggage = parse_comma_separated_map(baggage, true);
    }
    ctx
}

fn parse_header_parent(value: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 4 {
        return Err(LoopError::header_parse(format!(
            "expected 4 '-'-separated segments, got {}",
            parts.len()
        )));
    }

    let trace_id = parts[1];
    if trace_id.len() != 32 || trace_id == ZERO_TRACE_ID || !utils::is_hex_str(trace_id) {
        return Err(LoopError::header_parse(format!("invalid trace id: {}", trace_id)));
    }

    let span_id = parts[2];
    if span_id.len() != 16 || span_id == ZERO_SPAN_ID || !utils::is_hex_str(span_id) {
        return Err(LoopError::header_parse(format!("invalid span id: {}", span_id)));
    }

    Ok((trace_id.to_string(), span_id.to_string()))
}

/// Parse `k=v,k2=v2` with URL-escaped components.
///
/// With `cover` set, a repeated key overwrites the earlier value; without
/// it the first value wins (used when back-propagating to a child so
/// inherited baggage persists).
pub(crate) fn parse_comma_separated_map(src: &str, cover: bool) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for entry in src.split(',') {
        let entry = entry.trim();
        let Some((raw_key, raw_value)) = entry.split_once('=') else {
            continue;
        };
        if raw_value.contains('=') {
            continue;
        }
        let Ok(key) = urlencoding::decode(raw_key) else {
            return out;
        };
        let Ok(value) = urlencoding::decode(raw_value) else {
            return out;
        };
        let key = key.into_owned();
        if cover || !out.contains_key(&key) {
            out.insert(key, value.into_owned());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::span::test_span;

    #[test]
    fn test_header_round_trip() {
        let span = test_span(false);
        span.set_baggage([("user_id", "u-42"), ("tier", "第一")]);

        let headers = span.to_header().unwrap();
        let ctx = from_header(&headers);

        assert_eq!(ctx.trace_id, span.trace_id());
        assert_eq!(ctx.span_id, span.span_id());
        assert_eq!(ctx.baggage.get("user_id"), Some(&"u-42".to_string()));
        // escaping round-trips non-ASCII values
        assert_eq!(ctx.baggage.get("tier"), Some(&"第一".to_string()));
    }

    #[test]
    fn test_header_names_case_insensitive() {
        let span = test_span(false);
        let mut headers = span.to_header().unwrap();
        let parent = headers.remove(HEADER_TRACEPARENT).unwrap();
        headers.insert("x-loop-traceparent".to_string(), parent);

        let ctx = from_header(&headers);
        assert_eq!(ctx.trace_id, span.trace_id());
    }

    #[test]
    fn test_malformed_parent_yields_empty_ids() {
        let cases = [
            "not-a-header",
            "00-zzzz-0000000000000001-00",
            "00-00000000000000000000000000000000-0000000000000001-00",
            "00-0123456789abcdef0123456789abcdef-0000000000000000-00",
            "00-0123456789abcdef0123456789abcdef-012345678-00",
        ];
        for case in cases {
            let mut headers = HashMap::new();
            headers.insert(HEADER_TRACEPARENT.to_string(), case.to_string());
            let ctx = from_header(&headers);
            assert_eq!(ctx.trace_id, "", "case: {}", case);
            assert_eq!(ctx.span_id, "", "case: {}", case);
        }
    }

    #[test]
    fn test_baggage_tolerates_malformed_entries() {
        let mut headers = HashMap::new();
        headers.insert(
            HEADER_BAGGAGE.to_string(),
            "good=1,malformed,also=ok".to_string(),
        );
        let ctx = from_header(&headers);
        assert_eq!(ctx.baggage.get("good"), Some(&"1".to_string()));
        assert_eq!(ctx.baggage.get("also"), Some(&"ok".to_string()));
        assert_eq!(ctx.baggage.len(), 2);
    }

    #[test]
    fn test_cover_semantics() {
        let parsed = parse_comma_separated_map("k=first,k=second", true);
        assert_eq!(parsed.get("k"), Some(&"second".to_string()));

        let parsed = parse_comma_separated_map("k=first,k=second", false);
        assert_eq!(parsed.get("k"), Some(&"first".to_string()));
    }
}
