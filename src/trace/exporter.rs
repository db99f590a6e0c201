//! Export projection: finished spans become `UploadSpan` records plus zero
//! or more `UploadFile` attachments.
//!
//! Two kinds of content leave the span body at export time: oversized
//! input/output text (promoted to a LONG_TEXT attachment when ultra-large
//! reporting is on) and multimodal binary parts (base64 payloads decoded
//! into MULTIMODAL attachments, their URL slot rewritten to the generated
//! TOS key). A span that fails conversion is skipped with a logged error;
//! the rest of its batch proceeds.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{LoopError, Result};
use crate::trace::attribute::*;
use crate::trace::span::{Span, SpanInner, TagValue};
use crate::transport::Transport;
use crate::utils;

pub(crate) const PATH_INGEST_TRACE: &str = "/v1/loop/traces/ingest";
pub(crate) const PATH_UPLOAD_FILE: &str = "/v1/loop/files/upload";

pub const FILE_TYPE_TEXT: &str = "text";
pub const FILE_TYPE_IMAGE: &str = "image";
pub const FILE_TYPE_FILE: &str = "file";

/// Wire projection of one finished span.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSpan {
    pub started_at_micros: i64,
    pub span_id: String,
    pub parent_id: String,
    pub trace_id: String,
    pub duration: i64,
    pub workspace_id: String,
    pub span_name: String,
    pub span_type: String,
    pub status_code: i32,
    pub input: String,
    pub output: String,
    pub object_storage: String,
    pub system_tags_string: HashMap<String, String>,
    pub system_tags_long: HashMap<String, i64>,
    pub system_tags_double: HashMap<String, f64>,
    pub tags_string: HashMap<String, String>,
    pub tags_long: HashMap<String, i64>,
    pub tags_double: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadType {
    LongText,
    MultiModal,
}

/// One attachment extracted from a span.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub tos_key: String,
    pub data: Vec<u8>,
    pub upload_type: UploadType,
    pub tag_key: String,
    pub name: String,
    pub file_type: String,
    pub workspace_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectStorage {
    input_tos_key: String,
    output_tos_key: String,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Attachment {
    field: String,
    name: String,
    #[serde(rename = "type")]
    file_type: String,
    tos_key: String,
}

#[derive(Serialize)]
struct UploadSpanData<'a> {
    spans: &'a [UploadSpan],
}

/// Posts span batches and uploads attachments through the transport.
pub(crate) struct SpanExporter {
    transport: Arc<dyn Transport>,
}

impl SpanExporter {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub(crate) async fn export_spans(&self, spans: &[UploadSpan]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }
        debug!(count = spans.len(), "exporting spans");
        let body = serde_json::to_value(UploadSpanData { spans })?;
        let response = self.transport.post(PATH_INGEST_TRACE, body).await?;
        if response.code != 0 {
            error!(
                count = spans.len(),
                code = response.code,
                msg = %response.msg,
                "span ingest rejected"
            );
            return Err(LoopError::remote_service(
                200,
                response.code,
                response.log_id,
                response.msg,
            ));
        }
        Ok(())
    }

    pub(crate) async fn export_files(&self, files: &[UploadFile]) -> Result<()> {
        for file in files {
            debug!(tos_key = %file.tos_key, bytes = file.data.len(), "uploading attachment");
            let form = HashMap::from([("workspace_id".to_string(), file.workspace_id.clone())]);
            let response = self
                .transport
                .upload_file(PATH_UPLOAD_FILE, &file.tos_key, file.data.clone(), form)
                .await?;
            if response.code != 0 {
                error!(
                    tos_key = %file.tos_key,
                    code = response.code,
                    msg = %response.msg,
                    "attachment upload rejected"
                );
                return Err(LoopError::remote_service(
                    200,
                    response.code,
                    response.log_id,
                    response.msg,
                ));
            }
        }
        Ok(())
    }
}

/// Convert a batch of finished spans. Spans that fail conversion are
/// dropped individually.
pub(crate) fn transfer_to_upload(spans: &[Span]) -> (Vec<UploadSpan>, Vec<UploadFile>) {
    let mut upload_spans = Vec::with_capacity(spans.len());
    let mut upload_files = Vec::new();
    for span in spans {
        match convert_span(span) {
            Ok((upload_span, mut files)) => {
                upload_spans.push(upload_span);
                upload_files.append(&mut files);
            }
            Err(e) => error!(error = %e, "failed to convert span for export, skipped"),
        }
    }
    (upload_spans, upload_files)
}

fn convert_span(span: &Span) -> Result<(UploadSpan, Vec<UploadFile>)> {
    let inner = span
        .inner
        .as_ref()
        .ok_or_else(|| LoopError::internal("noop span reached the exporter"))?;
    let st = inner.state();

    let mut files = Vec::new();
    let mut io_values: HashMap<&str, String> = HashMap::new();
    for key in [TAG_INPUT, TAG_OUTPUT] {
        let Some(value) = st.tags.get(key) else {
            continue;
        };
        let text = value.to_display_string();
        let converted = if st.multi_modality_keys.contains(key) {
            convert_multi_modal(key, &text, inner, &mut files)?
        } else {
            let (converted, file) = transfer_text(text, inner, key);
            files.extend(file);
            converted
        };
        io_values.insert(key, converted);
    }

    let object_storage = encode_object_storage(&files)?;
    let (tags_string, tags_long, tags_double) = split_tags(&st.tags);
    let (system_tags_string, system_tags_long, system_tags_double) = split_tags(&st.system_tags);

    let upload_span = UploadSpan {
        started_at_micros: inner.start_time_micros(),
        span_id: inner.span_id.clone(),
        parent_id: st.parent_span_id.clone(),
        trace_id: inner.trace_id.clone(),
        duration: st.duration_micros,
        workspace_id: inner.workspace_id.clone(),
        span_name: inner.name.clone(),
        span_type: inner.span_type.clone(),
        status_code: st.status_code,
        input: io_values.remove(TAG_INPUT).unwrap_or_default(),
        output: io_values.remove(TAG_OUTPUT).unwrap_or_default(),
        object_storage,
        system_tags_string,
        system_tags_long,
        system_tags_double,
        tags_string,
        tags_long,
        tags_double,
    };
    Ok((upload_span, files))
}

/// Parse a multimodal input/output value, extract binary parts into upload
/// files, and re-serialize. Applies the long-text rule when the result is
/// still oversized.
fn convert_multi_modal(
    key: &str,
    text: &str,
    inner: &SpanInner,
    files: &mut Vec<UploadFile>,
) -> Result<String> {
    let serialized = if key == TAG_INPUT {
        let mut input: ModelInput = serde_json::from_str(text)?;
        for part in input.messages.iter_mut().flat_map(|m| m.parts.iter_mut()) {
            files.extend(transfer_message_part(part, inner, key));
        }
        serde_json::to_string(&input)?
    } else {
        let mut output: ModelOutput = serde_json::from_str(text)?;
        for part in output
            .choices
            .iter_mut()
            .filter_map(|c| c.message.as_mut())
            .flat_map(|m| m.parts.iter_mut())
        {
            files.extend(transfer_message_part(part, inner, key));
        }
        serde_json::to_string(&output)?
    };

    if serialized.len() > MAX_IO_BYTES {
        let (shortened, file) = transfer_text(serialized, inner, key);
        files.extend(file);
        return Ok(shortened);
    }
    Ok(serialized)
}

fn transfer_message_part(
    part: &mut ModelMessagePart,
    inner: &SpanInner,
    tag_key: &str,
) -> Option<UploadFile> {
    match part.part_type {
        ModelMessagePartType::Image => {
            let image = part.image_url.as_mut()?;
            transfer_binary(&mut image.url, &image.name, FILE_TYPE_IMAGE, inner, tag_key)
        }
        ModelMessagePartType::File => {
            let file = part.file_url.as_mut()?;
            transfer_binary(&mut file.url, &file.name, FILE_TYPE_FILE, inner, tag_key)
        }
        ModelMessagePartType::Text => None,
    }
}

/// Decode an inline base64 payload into an attachment and rewrite the URL
/// slot to the generated TOS key. Reachable external URLs stay as they are.
fn transfer_binary(
    url: &mut String,
    name: &str,
    file_type: &str,
    inner: &SpanInner,
    tag_key: &str,
) -> Option<UploadFile> {
    if url.is_empty() || utils::is_valid_url(url) {
        return None;
    }

    use base64::Engine as _;
    let data = match base64::engine::general_purpose::STANDARD.decode(url.as_bytes()) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, file_type, "failed to decode inline attachment, dropped");
            return None;
        }
    };

    let tos_key = format!(
        "{}_{}_{}_{}_{}",
        inner.trace_id,
        inner.span_id,
        tag_key,
        file_type,
        utils::gen_span_id()
    );
    *url = tos_key.clone();
    Some(UploadFile {
        tos_key,
        data,
        upload_type: UploadType::MultiModal,
        tag_key: tag_key.to_string(),
        name: name.to_string(),
        file_type: file_type.to_string(),
        workspace_id: inner.workspace_id.clone(),
    })
}

/// Promote oversized text to a LONG_TEXT attachment when ultra-large
/// reporting is on; otherwise pass it through unchanged.
fn transfer_text(src: String, inner: &SpanInner, tag_key: &str) -> (String, Option<UploadFile>) {
    if src.is_empty() || !inner.ultra_large_report || src.len() <= MAX_IO_BYTES {
        return (src, None);
    }

    let tos_key = format!(
        "{}_{}_{}_{}_large_text",
        inner.trace_id, inner.span_id, tag_key, FILE_TYPE_TEXT
    );
    let shortened = utils::truncate_by_chars(&src, TEXT_TRUNCATE_CHARS);
    let file = UploadFile {
        tos_key,
        data: src.into_bytes(),
        upload_type: UploadType::LongText,
        tag_key: tag_key.to_string(),
        name: String::new(),
        file_type: FILE_TYPE_TEXT.to_string(),
        workspace_id: inner.workspace_id.clone(),
    };
    (shortened, Some(file))
}

fn encode_object_storage(files: &[UploadFile]) -> Result<String> {
    if files.is_empty() {
        return Ok(String::new());
    }
    let mut storage = ObjectStorage::default();
    for file in files {
        match file.upload_type {
            UploadType::LongText => {
                if file.tag_key == TAG_INPUT {
                    storage.input_tos_key = file.tos_key.clone();
                } else if file.tag_key == TAG_OUTPUT {
                    storage.output_tos_key = file.tos_key.clone();
                }
            }
            UploadType::MultiModal => storage.attachments.push(Attachment {
                field: file.tag_key.clone(),
                name: file.name.clone(),
                file_type: file.file_type.clone(),
                tos_key: file.tos_key.clone(),
            }),
        }
    }
    Ok(serde_json::to_string(&storage)?)
}

/// Dispatch tag values into the three typed wire maps. The input/output
/// keys are excluded: they are promoted to dedicated fields.
fn split_tags(
    tags: &HashMap<String, TagValue>,
) -> (
    HashMap<String, String>,
    HashMap<String, i64>,
    HashMap<String, f64>,
) {
    let mut strings = HashMap::new();
    let mut longs = HashMap::new();
    let mut doubles = HashMap::new();
    for (key, value) in tags {
        if key == TAG_INPUT || key == TAG_OUTPUT {
            continue;
        }
        match value {
            TagValue::Str(s) => {
                strings.insert(key.clone(), s.clone());
            }
            TagValue::Long(v) => {
                longs.insert(key.clone(), *v);
            }
            TagValue::Double(v) => {
                doubles.insert(key.clone(), *v);
            }
            other => {
                strings.insert(key.clone(), other.to_display_string());
            }
        }
    }
    (strings, longs, doubles)
}
