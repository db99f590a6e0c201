//! Span data model and mutation discipline.
//!
//! A [`Span`] is a cheap clonable handle; the no-op handle (returned by
//! closed clients and noop paths) accepts every call and does nothing, so
//! instrumentation never has to branch on whether tracing is live.
//!
//! Mutators never return errors: a tag that violates the reserved-key type
//! contract, a baggage key carrying a wire delimiter, or an oversized value
//! is logged and discarded (or truncated) without disturbing the caller's
//! hot path. `finish()` is idempotent; the first call snapshots duration and
//! hands the span to the export pipeline, after which the span is read-only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use tracing::{error, warn};

use crate::trace::attribute::*;
use crate::trace::processor::BatchSpanProcessor;
use crate::utils;

/// Immutable identity view of a span: what crosses process boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    pub baggage: HashMap<String, String>,
}

/// A heterogeneous tag value.
///
/// Reserved keys constrain which variants they accept; export dispatches
/// string/long/double buckets on the same variants.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    Long(i64),
    Double(f64),
    Bool(bool),
    Json(serde_json::Value),
}

impl TagValue {
    /// Composite and string values are "cut-offable": they are serialized to
    /// a string and that string is subject to the per-key byte limit.
    pub fn is_cut_offable(&self) -> bool {
        matches!(self, TagValue::Str(_) | TagValue::Json(_))
    }

    /// Render the value as the string that would go on the wire.
    ///
    /// Plain strings pass through unquoted; composites are JSON-encoded.
    pub fn to_display_string(&self) -> String {
        match self {
            TagValue::Str(s) => s.clone(),
            TagValue::Long(v) => v.to_string(),
            TagValue::Double(v) => v.to_string(),
            TagValue::Bool(v) => v.to_string(),
            TagValue::Json(serde_json::Value::String(s)) => s.clone(),
            TagValue::Json(v) => v.to_string(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            TagValue::Str(_) => "string",
            TagValue::Long(_) => "long",
            TagValue::Double(_) => "double",
            TagValue::Bool(_) => "bool",
            TagValue::Json(_) => "json",
        }
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Str(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Str(v)
    }
}

impl From<i8> for TagValue {
    fn from(v: i8) -> Self {
        TagValue::Long(v as i64)
    }
}

impl From<i16> for TagValue {
    fn from(v: i16) -> Self {
        TagValue::Long(v as i64)
    }
}

impl From<i32> for TagValue {
    fn from(v: i32) -> Self {
        TagValue::Long(v as i64)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Long(v)
    }
}

impl From<u8> for TagValue {
    fn from(v: u8) -> Self {
        TagValue::Long(v as i64)
    }
}

impl From<u16> for TagValue {
    fn from(v: u16) -> Self {
        TagValue::Long(v as i64)
    }
}

impl From<u32> for TagValue {
    fn from(v: u32) -> Self {
        TagValue::Long(v as i64)
    }
}

impl From<u64> for TagValue {
    fn from(v: u64) -> Self {
        TagValue::Long(v as i64)
    }
}

impl From<f32> for TagValue {
    fn from(v: f32) -> Self {
        TagValue::Double(v as f64)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Double(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<serde_json::Value> for TagValue {
    fn from(v: serde_json::Value) -> Self {
        TagValue::Json(v)
    }
}

fn reserved_type_ok(key: &str, value: &TagValue) -> bool {
    match key {
        TAG_USER_ID | TAG_MESSAGE_ID | TAG_THREAD_ID | TAG_ERROR => {
            matches!(value, TagValue::Str(_))
        }
        TAG_INPUT_TOKENS | TAG_OUTPUT_TOKENS | TAG_TOKENS | TAG_START_TIME_FIRST_RESP
        | TAG_LATENCY_FIRST_RESP | TAG_STATUS_CODE => matches!(value, TagValue::Long(_)),
        _ => true,
    }
}

/// Mutable portion of a span, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct SpanState {
    pub(crate) parent_span_id: String,
    pub(crate) tags: HashMap<String, TagValue>,
    pub(crate) system_tags: HashMap<String, TagValue>,
    pub(crate) baggage: HashMap<String, String>,
    pub(crate) status_code: i32,
    pub(crate) duration_micros: i64,
    pub(crate) bytes_size: i64,
    pub(crate) multi_modality_keys: HashSet<String>,
}

#[derive(Debug)]
pub(crate) struct SpanInner {
    pub(crate) trace_id: String,
    pub(crate) span_id: String,
    pub(crate) workspace_id: String,
    pub(crate) name: String,
    pub(crate) span_type: String,
    pub(crate) start_time: SystemTime,
    pub(crate) scene: String,
    pub(crate) flags: u8,
    pub(crate) ultra_large_report: bool,
    pub(crate) finished: AtomicBool,
    pub(crate) processor: Weak<BatchSpanProcessor>,
    pub(crate) state: Mutex<SpanState>,
}

impl SpanInner {
    pub(crate) fn state(&self) -> MutexGuard<'_, SpanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn start_time_micros(&self) -> i64 {
        utils::unix_micros(self.start_time)
    }

    /// Apply the full tag discipline of one `set_tags` call under the state
    /// lock: reserved-type check, serialize-and-truncate, key truncation,
    /// byte accounting, count cap, and cut-off bookkeeping.
    fn apply_tags(&self, st: &mut SpanState, entries: Vec<(String, TagValue)>) {
        for (key, _) in &entries {
            if key == TAG_ERROR && st.status_code == 0 {
                st.status_code = STATUS_CODE_ERROR_DEFAULT;
            }
        }

        let mut cut_off_keys: Vec<String> = Vec::new();
        for (key, value) in entries {
            if !reserved_type_ok(&key, &value) {
                error!(
                    key = %key,
                    value_type = value.kind(),
                    "reserved tag value has unexpected type, discarded"
                );
                continue;
            }

            let mut value = value;
            let mut serialized_len = 0usize;
            let mut skip_value_bytes = false;
            if value.is_cut_offable() {
                let value_str = value.to_display_string();
                serialized_len = value_str.len();
                let limit = tag_value_size_limit(&key);
                let is_multi_modal = st.multi_modality_keys.contains(&key);
                let (shortened, was_truncated) = utils::truncate_by_bytes(&value_str, limit);
                if was_truncated && !is_multi_modal {
                    if self.ultra_large_report {
                        // Kept in full here; the exporter promotes it to a
                        // LONG_TEXT attachment and counts it as file weight.
                        skip_value_bytes = true;
                        value = TagValue::Str(value_str);
                    } else {
                        warn!(key = %key, limit, "tag value too long, truncated");
                        cut_off_keys.push(key.clone());
                        value = TagValue::Str(shortened);
                    }
                } else {
                    value = TagValue::Str(value_str);
                }
                if is_multi_modal {
                    // Already credited, minus binary payloads, on set_model_*.
                    skip_value_bytes = true;
                }
            }

            let (key, key_truncated) = utils::truncate_by_bytes(&key, MAX_KEY_BYTES);
            if key_truncated {
                warn!(key = %key, limit = MAX_KEY_BYTES, "tag key too long, truncated");
                cut_off_keys.push(key.clone());
            }

            st.bytes_size += key.len() as i64;
            if !skip_value_bytes {
                st.bytes_size += serialized_len as i64;
            }

            if st.tags.len() < MAX_TAGS_PER_SPAN || st.tags.contains_key(&key) {
                st.tags.insert(key, value);
            } else {
                warn!(limit = MAX_TAGS_PER_SPAN, key = %key, "tag count exceeds limit, dropped");
            }
        }

        if !cut_off_keys.is_empty() {
            self.merge_cut_off(st, cut_off_keys);
        }
    }

    fn merge_cut_off(&self, st: &mut SpanState, mut keys: Vec<String>) {
        if let Some(TagValue::Json(serde_json::Value::Array(existing))) =
            st.system_tags.get(SYSTEM_TAG_CUT_OFF)
        {
            for v in existing {
                if let Some(s) = v.as_str() {
                    keys.push(s.to_string());
                }
            }
        }
        let keys = utils::dedup_preserving_order(keys);
        st.system_tags
            .insert(SYSTEM_TAG_CUT_OFF.to_string(), TagValue::Json(serde_json::json!(keys)));
    }

    fn set_runtime_tag(&self, st: &mut SpanState) {
        let runtime = Runtime {
            language: RUNTIME_LANGUAGE.to_string(),
            scene: if self.scene.is_empty() {
                SCENE_CUSTOM.to_string()
            } else {
                self.scene.clone()
            },
            sdk_version: sdk_version().to_string(),
        };
        match serde_json::to_string(&runtime) {
            Ok(encoded) => {
                st.system_tags
                    .insert(SYSTEM_TAG_RUNTIME.to_string(), TagValue::Str(encoded));
            }
            Err(e) => error!(error = %e, "failed to encode runtime tag"),
        }
    }

    fn set_stat_tags(&self, st: &mut SpanState) {
        if let Some(TagValue::Long(first_resp)) = st.tags.get(TAG_START_TIME_FIRST_RESP).cloned() {
            let latency = first_resp - self.start_time_micros();
            self.apply_tags(
                st,
                vec![(TAG_LATENCY_FIRST_RESP.to_string(), TagValue::Long(latency))],
            );
        }

        let input_tokens = st.tags.get(TAG_INPUT_TOKENS).cloned();
        let output_tokens = st.tags.get(TAG_OUTPUT_TOKENS).cloned();
        if input_tokens.is_some() || output_tokens.is_some() {
            let total = long_or_zero(input_tokens) + long_or_zero(output_tokens);
            self.apply_tags(st, vec![(TAG_TOKENS.to_string(), TagValue::Long(total))]);
        }
    }
}

fn long_or_zero(v: Option<TagValue>) -> i64 {
    match v {
        Some(TagValue::Long(n)) => n,
        _ => 0,
    }
}

fn is_valid_baggage_item(key: &str, value: &str) -> bool {
    if key.len() > MAX_KEY_BYTES || value.len() > tag_value_size_limit(key) {
        warn!(key = %key, "baggage item too large, discarded");
        return false;
    }
    if BAGGAGE_SPECIAL_CHARS.iter().any(|c| key.contains(*c)) {
        error!(key = %key, "baggage key contains a delimiter character, discarded");
        return false;
    }
    true
}

/// Detect multimodal parts and strip base64 data-URI prefixes in place.
///
/// A part counts as multimodal when its URL is a base64 data URI (the
/// payload replaces the URL, to be decoded at export) or a syntactically
/// valid absolute URL (left alone; the server fetches it).
fn strip_multimodal_parts<'a>(parts: impl IntoIterator<Item = &'a mut ModelMessagePart>) -> bool {
    let mut multi_modal = false;
    for part in parts {
        let url = match part.part_type {
            ModelMessagePartType::Image => part.image_url.as_mut().map(|u| &mut u.url),
            ModelMessagePartType::File => part.file_url.as_mut().map(|u| &mut u.url),
            ModelMessagePartType::Text => None,
        };
        if let Some(url) = url {
            if url.is_empty() {
                continue;
            }
            if let Some(payload) = utils::parse_data_uri_base64(url) {
                *url = payload.to_string();
                multi_modal = true;
            } else if utils::is_valid_url(url) {
                multi_modal = true;
            }
        }
    }
    multi_modal
}

fn blank_part_urls<'a>(parts: impl IntoIterator<Item = &'a mut ModelMessagePart>) {
    for part in parts {
        match part.part_type {
            ModelMessagePartType::Image => {
                if let Some(u) = part.image_url.as_mut() {
                    u.url = String::new();
                }
            }
            ModelMessagePartType::File => {
                if let Some(u) = part.file_url.as_mut() {
                    u.url = String::new();
                }
            }
            ModelMessagePartType::Text => {}
        }
    }
}

fn model_input_stripped_size(input: &ModelInput) -> i64 {
    let mut copy = input.clone();
    blank_part_urls(copy.messages.iter_mut().flat_map(|m| m.parts.iter_mut()));
    serde_json::to_string(&copy).map(|s| s.len() as i64).unwrap_or(0)
}

fn model_output_stripped_size(output: &ModelOutput) -> i64 {
    let mut copy = output.clone();
    blank_part_urls(
        copy.choices
            .iter_mut()
            .filter_map(|c| c.message.as_mut())
            .flat_map(|m| m.parts.iter_mut()),
    );
    serde_json::to_string(&copy).map(|s| s.len() as i64).unwrap_or(0)
}

/// Handle to one unit of traced work.
///
/// Clones share the same underlying span. The default value is the no-op
/// sentinel: every method on it is a safe no-op.
#[derive(Debug, Clone, Default)]
pub struct Span {
    pub(crate) inner: Option<Arc<SpanInner>>,
}

impl Span {
    /// The no-op sentinel span.
    pub fn noop() -> Self {
        Self::default()
    }

    pub(crate) fn from_inner(inner: Arc<SpanInner>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Whether this handle refers to a live span (false for the sentinel).
    pub fn is_recording(&self) -> bool {
        self.inner.is_some()
    }

    fn live(&self) -> Option<&Arc<SpanInner>> {
        let inner = self.inner.as_ref()?;
        if inner.finished.load(Ordering::Acquire) {
            return None;
        }
        Some(inner)
    }

    pub fn trace_id(&self) -> String {
        self.inner.as_ref().map(|i| i.trace_id.clone()).unwrap_or_default()
    }

    pub fn span_id(&self) -> String {
        self.inner.as_ref().map(|i| i.span_id.clone()).unwrap_or_default()
    }

    pub fn parent_span_id(&self) -> String {
        self.inner
            .as_ref()
            .map(|i| i.state().parent_span_id.clone())
            .unwrap_or_default()
    }

    pub fn baggage(&self) -> HashMap<String, String> {
        self.inner
            .as_ref()
            .map(|i| i.state().baggage.clone())
            .unwrap_or_default()
    }

    /// Snapshot the identity of this span for propagation.
    pub fn span_context(&self) -> SpanContext {
        match &self.inner {
            Some(inner) => SpanContext {
                trace_id: inner.trace_id.clone(),
                span_id: inner.span_id.clone(),
                baggage: inner.state().baggage.clone(),
            },
            None => SpanContext::default(),
        }
    }

    pub(crate) fn bytes_size(&self) -> i64 {
        self.inner.as_ref().map(|i| i.state().bytes_size).unwrap_or(0)
    }

    /// Set one tag.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) {
        let key: String = key.into();
        let value: TagValue = value.into();
        self.set_tags([(key, value)]);
    }

    /// Set a batch of tags under one lock acquisition.
    pub fn set_tags<K, V>(&self, tags: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<TagValue>,
    {
        let Some(inner) = self.live() else { return };
        let entries: Vec<(String, TagValue)> = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        if entries.is_empty() {
            return;
        }
        let mut st = inner.state();
        inner.apply_tags(&mut st, entries);
    }

    /// Record the span input as plain text or a JSON-serializable value.
    pub fn set_input(&self, value: impl Into<TagValue>) {
        let value: TagValue = value.into();
        self.set_tags([(TAG_INPUT, value)]);
    }

    /// Record the span output as plain text or a JSON-serializable value.
    pub fn set_output(&self, value: impl Into<TagValue>) {
        let value: TagValue = value.into();
        self.set_tags([(TAG_OUTPUT, value)]);
    }

    /// Record structured model input, detecting multimodal parts.
    ///
    /// Binary parts (base64 data URIs) are stripped to their payload and the
    /// key is marked multimodal so the exporter extracts them as uploads.
    pub fn set_model_input(&self, input: ModelInput) {
        let Some(inner) = self.live() else { return };
        let mut input = input;
        let multi_modal =
            strip_multimodal_parts(input.messages.iter_mut().flat_map(|m| m.parts.iter_mut()));

        let mut st = inner.state();
        if multi_modal {
            st.multi_modality_keys.insert(TAG_INPUT.to_string());
            st.bytes_size += model_input_stripped_size(&input);
        }
        match serde_json::to_value(&input) {
            Ok(v) => inner.apply_tags(&mut st, vec![(TAG_INPUT.to_string(), TagValue::Json(v))]),
            Err(e) => error!(error = %e, "failed to serialize model input"),
        }
    }

    /// Record structured model output, detecting multimodal parts.
    pub fn set_model_output(&self, output: ModelOutput) {
        let Some(inner) = self.live() else { return };
        let mut output = output;
        let multi_modal = strip_multimodal_parts(
            output
                .choices
                .iter_mut()
                .filter_map(|c| c.message.as_mut())
                .flat_map(|m| m.parts.iter_mut()),
        );

        let mut st = inner.state();
        if multi_modal {
            st.multi_modality_keys.insert(TAG_OUTPUT.to_string());
            st.bytes_size += model_output_stripped_size(&output);
        }
        match serde_json::to_value(&output) {
            Ok(v) => inner.apply_tags(&mut st, vec![(TAG_OUTPUT.to_string(), TagValue::Json(v))]),
            Err(e) => error!(error = %e, "failed to serialize model output"),
        }
    }

    /// Set baggage items: validated, mirrored into tags, and stored
    /// URL-escaped for propagation.
    pub fn set_baggage<K, V>(&self, items: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let items: Vec<(String, String)> = items
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.set_baggage_inner(items, true);
    }

    /// Set one baggage item.
    pub fn set_baggage_item(&self, key: impl Into<String>, value: impl Into<String>) {
        let key: String = key.into();
        let value: String = value.into();
        self.set_baggage([(key, value)]);
    }

    pub(crate) fn set_baggage_inner(&self, items: Vec<(String, String)>, escape: bool) {
        let Some(inner) = self.live() else { return };
        if items.is_empty() {
            return;
        }
        let mut st = inner.state();
        for (key, value) in items {
            if !is_valid_baggage_item(&key, &value) {
                continue;
            }
            inner.apply_tags(
                &mut st,
                vec![(key.clone(), TagValue::Str(value.clone()))],
            );
            let (key, value) = if escape {
                (
                    urlencoding::encode(&key).into_owned(),
                    urlencoding::encode(&value).into_owned(),
                )
            } else {
                (key, value)
            };
            st.baggage.insert(key, value);
        }
    }

    /// Record an error message; sets the default error status code if the
    /// span still reports success.
    pub fn set_error(&self, message: impl Into<String>) {
        self.set_tags([(TAG_ERROR, TagValue::Str(message.into()))]);
    }

    pub fn set_status_code(&self, code: i32) {
        let Some(inner) = self.live() else { return };
        inner.state().status_code = code;
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.set_tags([(TAG_USER_ID, TagValue::Str(user_id.into()))]);
    }

    pub fn set_user_id_baggage(&self, user_id: impl Into<String>) {
        let user_id: String = user_id.into();
        self.set_baggage([(TAG_USER_ID.to_string(), user_id)]);
    }

    pub fn set_message_id(&self, message_id: impl Into<String>) {
        self.set_tags([(TAG_MESSAGE_ID, TagValue::Str(message_id.into()))]);
    }

    pub fn set_message_id_baggage(&self, message_id: impl Into<String>) {
        let message_id: String = message_id.into();
        self.set_baggage([(TAG_MESSAGE_ID.to_string(), message_id)]);
    }

    pub fn set_thread_id(&self, thread_id: impl Into<String>) {
        self.set_tags([(TAG_THREAD_ID, TagValue::Str(thread_id.into()))]);
    }

    pub fn set_thread_id_baggage(&self, thread_id: impl Into<String>) {
        let thread_id: String = thread_id.into();
        self.set_baggage([(TAG_THREAD_ID.to_string(), thread_id)]);
    }

    pub fn set_model_provider(&self, provider: impl Into<String>) {
        self.set_tags([(TAG_MODEL_PROVIDER, TagValue::Str(provider.into()))]);
    }

    pub fn set_model_name(&self, name: impl Into<String>) {
        self.set_tags([(TAG_MODEL_NAME, TagValue::Str(name.into()))]);
    }

    /// Record the prompt identity (key and optional version) this span used.
    pub fn set_prompt(&self, prompt_key: impl Into<String>, version: impl Into<String>) {
        let prompt_key = prompt_key.into();
        if prompt_key.is_empty() {
            return;
        }
        let version = version.into();
        self.set_tags([(TAG_PROMPT_KEY, TagValue::Str(prompt_key))]);
        if !version.is_empty() {
            self.set_tags([(TAG_PROMPT_VERSION, TagValue::Str(version))]);
        }
    }

    pub fn set_input_tokens(&self, tokens: i64) {
        self.set_tags([(TAG_INPUT_TOKENS, TagValue::Long(tokens))]);
    }

    pub fn set_output_tokens(&self, tokens: i64) {
        self.set_tags([(TAG_OUTPUT_TOKENS, TagValue::Long(tokens))]);
    }

    /// Record the wall-clock time (unix µs) of the first streamed response
    /// token; `latency_first_resp` is derived from it at finish.
    pub fn set_start_time_first_resp(&self, unix_micros: i64) {
        self.set_tags([(TAG_START_TIME_FIRST_RESP, TagValue::Long(unix_micros))]);
    }

    /// Finish the span: snapshot duration and derived stat tags, then hand
    /// it to the export pipeline. Safe to call more than once; only the
    /// first call has any effect.
    pub fn finish(&self) {
        let Some(inner) = &self.inner else { return };
        if inner
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        {
            let mut st = inner.state();
            inner.set_stat_tags(&mut st);
            inner.set_runtime_tag(&mut st);
            let elapsed = utils::unix_micros(SystemTime::now()) - inner.start_time_micros();
            st.duration_micros = elapsed.max(0);
        }

        if let Some(processor) = inner.processor.upgrade() {
            processor.on_span_end(self.clone());
        }
    }
}

#[cfg(test)]
pub(crate) fn test_span(ultra_large_report: bool) -> Span {
    Span::from_inner(Arc::new(SpanInner {
        trace_id: utils::gen_trace_id(),
        span_id: utils::gen_span_id(),
        workspace_id: "test-workspace".to_string(),
        name: "test-span".to_string(),
        span_type: SPAN_TYPE_CUSTOM.to_string(),
        start_time: SystemTime::now(),
        scene: String::new(),
        flags: 0,
        ultra_large_report,
        finished: AtomicBool::new(false),
        processor: Weak::new(),
        state: Mutex::new(SpanState {
            parent_span_id: "0".to_string(),
            ..Default::default()
        }),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_str(span: &Span, key: &str) -> Option<String> {
        let inner = span.inner.as_ref().unwrap();
        let st = inner.state();
        st.tags.get(key).map(|v| v.to_display_string())
    }

    #[test]
    fn test_noop_span_is_safe() {
        let span = Span::noop();
        span.set_tag("k", "v");
        span.set_input("text");
        span.set_error("boom");
        span.set_baggage([("k", "v")]);
        span.finish();
        assert!(!span.is_recording());
        assert_eq!(span.trace_id(), "");
    }

    #[test]
    fn test_reserved_key_type_rejected() {
        let span = test_span(false);
        span.set_tag(TAG_INPUT_TOKENS, "eleven");
        assert_eq!(tag_str(&span, TAG_INPUT_TOKENS), None);

        span.set_tag(TAG_INPUT_TOKENS, 11i64);
        assert_eq!(tag_str(&span, TAG_INPUT_TOKENS), Some("11".to_string()));

        // a later bad write leaves the earlier value unchanged
        span.set_tag(TAG_INPUT_TOKENS, 1.5f64);
        assert_eq!(tag_str(&span, TAG_INPUT_TOKENS), Some("11".to_string()));
    }

    #[test]
    fn test_value_truncation_boundary() {
        let span = test_span(false);
        let exact = "a".repeat(MAX_VALUE_BYTES);
        span.set_tag("exact", exact.clone());
        assert_eq!(tag_str(&span, "exact").unwrap().len(), MAX_VALUE_BYTES);

        let over = "a".repeat(MAX_VALUE_BYTES + 1);
        span.set_tag("over", over);
        assert_eq!(tag_str(&span, "over").unwrap().len(), MAX_VALUE_BYTES);

        let inner = span.inner.as_ref().unwrap();
        let st = inner.state();
        let cut_off = st.system_tags.get(SYSTEM_TAG_CUT_OFF).unwrap().to_display_string();
        assert!(cut_off.contains("over"));
        assert!(!cut_off.contains("exact"));
    }

    #[test]
    fn test_key_truncation_recorded() {
        let span = test_span(false);
        let long_key = "k".repeat(MAX_KEY_BYTES + 10);
        span.set_tag(long_key, "v");

        let inner = span.inner.as_ref().unwrap();
        let st = inner.state();
        let truncated_key = "k".repeat(MAX_KEY_BYTES);
        assert!(st.tags.contains_key(&truncated_key));
        let cut_off = st.system_tags.get(SYSTEM_TAG_CUT_OFF).unwrap().to_display_string();
        assert!(cut_off.contains(&truncated_key));
    }

    #[test]
    fn test_error_tag_sets_status_code() {
        let span = test_span(false);
        span.set_error("model exploded");
        let inner = span.inner.as_ref().unwrap();
        assert_eq!(inner.state().status_code, STATUS_CODE_ERROR_DEFAULT);
    }

    #[test]
    fn test_explicit_status_code_not_overridden() {
        let span = test_span(false);
        span.set_status_code(42);
        span.set_error("still broken");
        let inner = span.inner.as_ref().unwrap();
        assert_eq!(inner.state().status_code, 42);
    }

    #[test]
    fn test_bytes_size_monotone() {
        let span = test_span(false);
        let inner = span.inner.as_ref().unwrap().clone();
        let mut last = inner.state().bytes_size;
        for i in 0..10 {
            span.set_tag(format!("key_{}", i), "some value");
            let now = inner.state().bytes_size;
            assert!(now > last);
            last = now;
        }
    }

    #[test]
    fn test_tag_count_limit() {
        let span = test_span(false);
        for i in 0..(MAX_TAGS_PER_SPAN + 10) {
            span.set_tag(format!("key_{}", i), i as i64);
        }
        let inner = span.inner.as_ref().unwrap();
        assert_eq!(inner.state().tags.len(), MAX_TAGS_PER_SPAN);
    }

    #[test]
    fn test_baggage_rejects_delimiters_in_key() {
        let span = test_span(false);
        span.set_baggage([("bad=key", "v"), ("good_key", "v")]);
        let baggage = span.baggage();
        assert!(!baggage.contains_key("bad=key"));
        assert!(baggage.contains_key("good_key"));
        // valid entries are mirrored into tags
        assert_eq!(tag_str(&span, "good_key"), Some("v".to_string()));
    }

    #[test]
    fn test_tag_path_accepts_delimiter_keys() {
        // only the baggage path polices delimiters; tags just size-check
        let span = test_span(false);
        span.set_tag("bad=key", "v");
        assert_eq!(tag_str(&span, "bad=key"), Some("v".to_string()));
        assert!(!span.baggage().contains_key("bad=key"));
    }

    #[test]
    fn test_baggage_values_escaped() {
        let span = test_span(false);
        span.set_baggage([("k", "a value,with=delims")]);
        let baggage = span.baggage();
        let stored = baggage.get("k").unwrap();
        assert!(!stored.contains(','));
        assert!(!stored.contains('='));
    }

    #[test]
    fn test_finish_is_idempotent_and_freezes_span() {
        let span = test_span(false);
        span.set_input_tokens(11);
        span.set_output_tokens(52);
        span.finish();

        let inner = span.inner.as_ref().unwrap();
        let duration = inner.state().duration_micros;
        assert!(duration >= 0);
        assert_eq!(tag_str(&span, TAG_TOKENS), Some("63".to_string()));

        // further mutation is a no-op
        span.set_tag("late", "nope");
        assert_eq!(tag_str(&span, "late"), None);

        // second finish leaves duration untouched
        std::thread::sleep(std::time::Duration::from_millis(2));
        span.finish();
        assert_eq!(inner.state().duration_micros, duration);
    }

    #[test]
    fn test_finish_before_tags_still_valid() {
        let span = test_span(false);
        span.finish();
        let inner = span.inner.as_ref().unwrap();
        let st = inner.state();
        assert!(st.duration_micros >= 0);
        assert!(st.tags.is_empty());
        assert!(st.system_tags.contains_key(SYSTEM_TAG_RUNTIME));
    }

    #[test]
    fn test_latency_first_resp_derived() {
        let span = test_span(false);
        let start = span.inner.as_ref().unwrap().start_time_micros();
        span.set_start_time_first_resp(start + 1500);
        span.finish();
        assert_eq!(tag_str(&span, TAG_LATENCY_FIRST_RESP), Some("1500".to_string()));
    }

    #[test]
    fn test_model_input_multimodal_detection() {
        let span = test_span(false);
        let input = ModelInput {
            messages: vec![ModelMessage {
                parts: vec![
                    ModelMessagePart {
                        part_type: ModelMessagePartType::Image,
                        image_url: Some(ModelImageUrl {
                            name: "lights".to_string(),
                            url: "data:image/jpeg;base64,aGVsbG8=".to_string(),
                            detail: None,
                        }),
                        ..Default::default()
                    },
                    ModelMessagePart {
                        part_type: ModelMessagePartType::Text,
                        text: Some("这是什么图片？".to_string()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        span.set_model_input(input);

        let inner = span.inner.as_ref().unwrap();
        let st = inner.state();
        assert!(st.multi_modality_keys.contains(TAG_INPUT));
        // the stored tag carries the bare base64 payload, not the data URI
        let stored = st.tags.get(TAG_INPUT).unwrap().to_display_string();
        assert!(stored.contains("aGVsbG8="));
        assert!(!stored.contains("data:image/jpeg"));
    }

    #[test]
    fn test_plain_text_input_not_multimodal() {
        let span = test_span(false);
        let input = ModelInput {
            messages: vec![ModelMessage {
                parts: vec![ModelMessagePart {
                    part_type: ModelMessagePartType::Text,
                    text: Some("just text".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        span.set_model_input(input);
        let inner = span.inner.as_ref().unwrap();
        assert!(inner.state().multi_modality_keys.is_empty());
    }

    #[test]
    fn test_remote_url_part_is_multimodal() {
        let span = test_span(false);
        let input = ModelInput {
            messages: vec![ModelMessage {
                parts: vec![ModelMessagePart {
                    part_type: ModelMessagePartType::Image,
                    image_url: Some(ModelImageUrl {
                        name: "remote".to_string(),
                        url: "https://example.com/cat.png".to_string(),
                        detail: None,
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        span.set_model_input(input);
        let inner = span.inner.as_ref().unwrap();
        let st = inner.state();
        assert!(st.multi_modality_keys.contains(TAG_INPUT));
        // remote URLs are left untouched
        let stored = st.tags.get(TAG_INPUT).unwrap().to_display_string();
        assert!(stored.contains("https://example.com/cat.png"));
    }
}
