//! Reserved tag keys, size limits, and the structured model input/output
//! value types that spans accept.
//!
//! Reserved keys carry a type contract (see [`crate::trace::span::TagValue`]):
//! a `set_tags` call whose value does not match the key's allowed type is
//! logged and discarded rather than surfaced to the caller.

use serde::{Deserialize, Serialize};

// Reserved user tag keys.
pub const TAG_INPUT: &str = "input";
pub const TAG_OUTPUT: &str = "output";
pub const TAG_ERROR: &str = "error";
pub const TAG_USER_ID: &str = "user_id";
pub const TAG_MESSAGE_ID: &str = "message_id";
pub const TAG_THREAD_ID: &str = "thread_id";
pub const TAG_INPUT_TOKENS: &str = "input_tokens";
pub const TAG_OUTPUT_TOKENS: &str = "output_tokens";
pub const TAG_TOKENS: &str = "tokens";
pub const TAG_START_TIME_FIRST_RESP: &str = "start_time_first_resp";
pub const TAG_LATENCY_FIRST_RESP: &str = "latency_first_resp";
pub const TAG_STATUS_CODE: &str = "_status_code";
pub const TAG_MODEL_PROVIDER: &str = "model_provider";
pub const TAG_MODEL_NAME: &str = "model_name";
pub const TAG_PROMPT_KEY: &str = "prompt_key";
pub const TAG_PROMPT_VERSION: &str = "prompt_version";

// SDK-owned system tag keys.
pub const SYSTEM_TAG_CUT_OFF: &str = "cut_off";
pub const SYSTEM_TAG_RUNTIME: &str = "runtime";

// Runtime tag values.
pub const RUNTIME_LANGUAGE: &str = "rust";
pub const SCENE_CUSTOM: &str = "custom";
pub const SCENE_PROMPT_HUB: &str = "prompt_hub";
pub const SCENE_PROMPT_TEMPLATE: &str = "prompt_template";

// Built-in span types.
pub const SPAN_TYPE_CUSTOM: &str = "custom";
pub const SPAN_TYPE_MODEL: &str = "model";
pub const SPAN_TYPE_PROMPT: &str = "prompt";

// Size discipline. A tag value is limited to [`MAX_VALUE_BYTES`] except for
// the input/output keys, which get [`MAX_IO_BYTES`].
pub const MAX_TAGS_PER_SPAN: usize = 50;
pub const MAX_KEY_BYTES: usize = 1024;
pub const MAX_VALUE_BYTES: usize = 1024;
pub const MAX_IO_BYTES: usize = 1024 * 1024;
pub const TEXT_TRUNCATE_CHARS: usize = 1000;

/// Status code written when an `error` tag arrives on a span that still
/// reports success.
pub const STATUS_CODE_ERROR_DEFAULT: i32 = -1;

/// Version byte of the propagation header format.
pub const TRACE_HEADER_VERSION: u8 = 0;

/// Characters that must not appear in baggage keys; they are the wire
/// delimiters of the baggage header.
pub const BAGGAGE_SPECIAL_CHARS: [char; 2] = ['=', ','];

/// Byte limit for one value of the given tag key.
pub fn tag_value_size_limit(key: &str) -> usize {
    match key {
        TAG_INPUT | TAG_OUTPUT => MAX_IO_BYTES,
        _ => MAX_VALUE_BYTES,
    }
}

/// Structured input of a model span. Multimodal message parts (images,
/// files) are detected on [`crate::Span::set_model_input`] and extracted to
/// attachments at export time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInput {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ModelMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tool_choice: Option<serde_json::Value>,
}

/// Structured output of a model span.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOutput {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<ModelChoice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ModelMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ModelMessagePart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMessagePartType {
    Text,
    Image,
    File,
}

impl Default for ModelMessagePartType {
    fn default() -> Self {
        Self::Text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMessagePart {
    #[serde(rename = "type", default)]
    pub part_type: ModelMessagePartType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ModelImageUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<ModelFileUrl>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelImageUrl {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelFileUrl {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

/// SDK runtime descriptor reported under the `runtime` system tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Runtime {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub scene: String,
    #[serde(default)]
    pub sdk_version: String,
}

/// Crate version stamped into the runtime system tag.
pub fn sdk_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
