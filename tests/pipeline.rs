//! End-to-end span pipeline tests over a scripted in-memory transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;

use looptrace::error::{LoopError, Result};
use looptrace::trace::attribute::{MAX_IO_BYTES, TEXT_TRUNCATE_CHARS};
use looptrace::transport::{ApiResponse, Transport};
use looptrace::{Client, Context, StartSpanOptions};
use looptrace::{ModelImageUrl, ModelInput, ModelMessage, ModelMessagePart, ModelMessagePartType};

#[derive(Debug, Clone)]
struct RecordedUpload {
    path: String,
    tos_key: String,
    data: Vec<u8>,
    form: HashMap<String, String>,
}

/// Transport double that records every call and can be scripted to fail the
/// next N posts or uploads with a server error.
#[derive(Default)]
struct MockTransport {
    posts: Mutex<Vec<(String, serde_json::Value)>>,
    uploads: Mutex<Vec<RecordedUpload>>,
    fail_next_posts: AtomicU32,
    fail_next_uploads: AtomicU32,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn posts(&self) -> Vec<(String, serde_json::Value)> {
        self.posts.lock().unwrap().clone()
    }

    fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }

    fn ingested_span_count(&self) -> usize {
        self.posts()
            .iter()
            .filter_map(|(_, body)| body["spans"].as_array().map(|s| s.len()))
            .sum()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse> {
        self.posts.lock().unwrap().push((path.to_string(), body));
        if Self::take_failure(&self.fail_next_posts) {
            return Err(LoopError::remote_service(500, 0, "log-1", "injected failure"));
        }
        Ok(ApiResponse::default())
    }

    async fn upload_file(
        &self,
        path: &str,
        tos_key: &str,
        data: Vec<u8>,
        form: HashMap<String, String>,
    ) -> Result<ApiResponse> {
        self.uploads.lock().unwrap().push(RecordedUpload {
            path: path.to_string(),
            tos_key: tos_key.to_string(),
            data,
            form,
        });
        if Self::take_failure(&self.fail_next_uploads) {
            return Err(LoopError::remote_service(503, 0, "log-2", "injected failure"));
        }
        Ok(ApiResponse::default())
    }
}

fn client_with(transport: Arc<MockTransport>, workspace: &str, ultra: bool) -> Client {
    Client::builder()
        .workspace_id(workspace)
        .api_token("pat-test")
        .ultra_large_report(ultra)
        .transport(transport)
        .build()
        .expect("client builds")
}

#[tokio::test]
async fn single_text_span_happy_path() {
    let transport = MockTransport::new();
    let client = client_with(transport.clone(), "ws-happy", false);

    let (_ctx, span) = client.start_span(
        &Context::new(),
        "root",
        "custom",
        StartSpanOptions::default(),
    );
    span.set_input("上海天气怎么样？");
    span.set_output(json!(["上海天气晴朗，气温25摄氏度。"]));
    span.set_input_tokens(11);
    span.set_output_tokens(52);
    span.set_status_code(0);
    span.finish();

    client.flush().await;

    let posts = transport.posts();
    assert_eq!(posts.len(), 1);
    let (path, body) = &posts[0];
    assert_eq!(path, "/v1/loop/traces/ingest");

    let spans = body["spans"].as_array().unwrap();
    assert_eq!(spans.len(), 1);
    let s = &spans[0];
    assert_eq!(s["tags_long"]["input_tokens"].as_i64(), Some(11));
    assert_eq!(s["tags_long"]["output_tokens"].as_i64(), Some(52));
    assert_eq!(s["tags_long"]["tokens"].as_i64(), Some(63));
    assert_eq!(s["input"].as_str(), Some("上海天气怎么样？"));
    assert_eq!(
        s["output"].as_str(),
        Some("[\"上海天气晴朗，气温25摄氏度。\"]")
    );
    assert_eq!(s["object_storage"].as_str(), Some(""));
    assert_eq!(s["status_code"].as_i64(), Some(0));
    assert!(s["duration"].as_i64().unwrap() >= 0);
    assert_eq!(s["workspace_id"].as_str(), Some("ws-happy"));

    assert!(transport.uploads().is_empty());
}

#[tokio::test]
async fn large_text_truncated_when_ultra_large_off() {
    let transport = MockTransport::new();
    let client = client_with(transport.clone(), "ws-large-off", false);

    let (_ctx, span) = client.start_span(
        &Context::new(),
        "root",
        "custom",
        StartSpanOptions::default(),
    );
    span.set_input("A".repeat(MAX_IO_BYTES + MAX_IO_BYTES / 2));
    span.finish();

    client.flush().await;

    let posts = transport.posts();
    assert_eq!(posts.len(), 1);
    let s = &posts[0].1["spans"][0];
    assert_eq!(s["input"].as_str().unwrap().len(), MAX_IO_BYTES);
    assert!(s["system_tags_string"]["cut_off"]
        .as_str()
        .unwrap()
        .contains("input"));
    assert!(transport.uploads().is_empty());
}

#[tokio::test]
async fn large_text_promoted_when_ultra_large_on() {
    let transport = MockTransport::new();
    let client = client_with(transport.clone(), "ws-large-on", true);

    let (_ctx, span) = client.start_span(
        &Context::new(),
        "root",
        "custom",
        StartSpanOptions::default(),
    );
    let original = "A".repeat(MAX_IO_BYTES + MAX_IO_BYTES / 2);
    span.set_input(original.clone());
    let expected_key = format!(
        "{}_{}_input_text_large_text",
        span.trace_id(),
        span.span_id()
    );
    span.finish();

    client.flush().await;

    let posts = transport.posts();
    assert_eq!(posts.len(), 1);
    let s = &posts[0].1["spans"][0];
    assert_eq!(
        s["input"].as_str().unwrap().chars().count(),
        TEXT_TRUNCATE_CHARS
    );
    assert!(s["object_storage"].as_str().unwrap().contains(&expected_key));

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].path, "/v1/loop/files/upload");
    assert_eq!(uploads[0].tos_key, expected_key);
    assert_eq!(uploads[0].data, original.into_bytes());
    assert_eq!(
        uploads[0].form.get("workspace_id"),
        Some(&"ws-large-on".to_string())
    );
}

#[tokio::test]
async fn multimodal_span_extracts_attachment() {
    let transport = MockTransport::new();
    let client = client_with(transport.clone(), "ws-multimodal", false);

    let (_ctx, span) = client.start_span(
        &Context::new(),
        "root",
        "model",
        StartSpanOptions::default(),
    );
    let image_bytes = b"jpeg-bytes".to_vec();
    let payload = base64::engine::general_purpose::STANDARD.encode(&image_bytes);
    span.set_model_input(ModelInput {
        messages: vec![ModelMessage {
            parts: vec![
                ModelMessagePart {
                    part_type: ModelMessagePartType::Image,
                    image_url: Some(ModelImageUrl {
                        name: "lights".to_string(),
                        url: format!("data:image/jpeg;base64,{}", payload),
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
    });
    let key_prefix = format!("{}_{}_input_image_", span.trace_id(), span.span_id());
    span.finish();

    client.flush().await;

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 1);
    let upload = &uploads[0];
    assert!(upload.tos_key.starts_with(&key_prefix));
    assert_eq!(upload.tos_key.len(), key_prefix.len() + 16);
    assert_eq!(upload.data, image_bytes);

    let posts = transport.posts();
    let s = &posts[0].1["spans"][0];
    // the serialized input carries the tos key in place of the binary
    assert!(s["input"].as_str().unwrap().contains(&upload.tos_key));
    assert!(!s["input"].as_str().unwrap().contains(&payload));
    let object_storage = s["object_storage"].as_str().unwrap();
    assert!(object_storage.contains(&upload.tos_key));
    assert!(object_storage.contains("lights"));
    assert!(object_storage.contains("image"));
}

#[tokio::test]
async fn transient_server_error_retries_once() {
    let transport = MockTransport::new();
    transport.fail_next_posts.store(1, Ordering::SeqCst);
    let client = client_with(transport.clone(), "ws-transient", false);

    let ctx = Context::new();
    for i in 0..10 {
        let (_ctx, span) = client.start_span(
            &ctx,
            &format!("span-{}", i),
            "custom",
            StartSpanOptions {
                start_new_trace: true,
                ..Default::default()
            },
        );
        span.finish();
    }

    client.flush().await;

    let posts = transport.posts();
    assert_eq!(posts.len(), 2, "failed batch is retried exactly once");
    assert_eq!(posts[0].1["spans"].as_array().unwrap().len(), 10);
    assert_eq!(posts[1].1["spans"].as_array().unwrap().len(), 10);
    assert!(transport.uploads().is_empty());
}

#[tokio::test]
async fn persistent_server_error_drops_after_one_retry() {
    let transport = MockTransport::new();
    transport.fail_next_posts.store(u32::MAX, Ordering::SeqCst);
    let client = client_with(transport.clone(), "ws-persistent", false);

    let (_ctx, span) = client.start_span(
        &Context::new(),
        "doomed",
        "custom",
        StartSpanOptions::default(),
    );
    span.finish();

    client.flush().await;
    // give any runaway retry loop a chance to show itself
    client.flush().await;

    assert_eq!(transport.posts().len(), 2, "original attempt plus one retry");
    assert!(transport.uploads().is_empty());
}

#[tokio::test]
async fn failed_span_batch_enqueues_no_attachments() {
    let transport = MockTransport::new();
    transport.fail_next_posts.store(2, Ordering::SeqCst);
    let client = client_with(transport.clone(), "ws-no-attach", true);

    let (_ctx, span) = client.start_span(
        &Context::new(),
        "root",
        "custom",
        StartSpanOptions::default(),
    );
    span.set_input("A".repeat(MAX_IO_BYTES + 1));
    span.finish();

    client.flush().await;

    // both the original post and the retry failed; the extracted attachment
    // must never reach the file queue
    assert_eq!(transport.posts().len(), 2);
    assert!(transport.uploads().is_empty());
}

#[tokio::test]
async fn failed_upload_retries_once_then_succeeds() {
    let transport = MockTransport::new();
    transport.fail_next_uploads.store(1, Ordering::SeqCst);
    let client = client_with(transport.clone(), "ws-upload-retry", true);

    let (_ctx, span) = client.start_span(
        &Context::new(),
        "root",
        "custom",
        StartSpanOptions::default(),
    );
    span.set_input("A".repeat(MAX_IO_BYTES + 1));
    span.finish();

    client.flush().await;

    let uploads = transport.uploads();
    assert_eq!(uploads.len(), 2, "failed upload is retried exactly once");
    assert_eq!(uploads[0].tos_key, uploads[1].tos_key);
}

#[tokio::test]
async fn shutdown_drains_pending_spans() {
    let transport = MockTransport::new();
    let client = client_with(transport.clone(), "ws-shutdown", false);

    let ctx = Context::new();
    for i in 0..1000 {
        let (_ctx, span) = client.start_span(
            &ctx,
            &format!("span-{}", i),
            "custom",
            StartSpanOptions {
                start_new_trace: true,
                ..Default::default()
            },
        );
        span.finish();
    }

    client.close().await;

    assert_eq!(transport.ingested_span_count(), 1000);

    // post-close calls are safe no-ops
    let (_ctx, span) = client.start_span(
        &ctx,
        "after-close",
        "custom",
        StartSpanOptions::default(),
    );
    assert!(!span.is_recording());
    span.finish();
    assert_eq!(transport.ingested_span_count(), 1000);
}

#[tokio::test]
async fn propagation_survives_service_boundary() {
    let transport = MockTransport::new();
    let client = client_with(transport.clone(), "ws-propagation", false);

    let (_ctx, upstream) = client.start_span(
        &Context::new(),
        "upstream",
        "custom",
        StartSpanOptions::default(),
    );
    upstream.set_baggage([("user_id", "u-99")]);
    let headers = upstream.to_header().unwrap();
    upstream.finish();

    let remote = client.get_span_from_header(&headers);
    assert_eq!(remote.trace_id, upstream.trace_id());
    assert_eq!(remote.span_id, upstream.span_id());

    let (_ctx, downstream) = client.start_span(
        &Context::new(),
        "downstream",
        "custom",
        StartSpanOptions {
            trace_id: Some(remote.trace_id.clone()),
            parent_span_id: Some(remote.span_id.clone()),
            baggage: Some(remote.baggage.clone()),
            ..Default::default()
        },
    );
    downstream.finish();
    client.flush().await;

    let posts = transport.posts();
    let all_spans: Vec<serde_json::Value> = posts
        .iter()
        .flat_map(|(_, body)| body["spans"].as_array().unwrap().clone())
        .collect();
    assert_eq!(all_spans.len(), 2);
    let down = all_spans
        .iter()
        .find(|s| s["span_name"] == "downstream")
        .unwrap();
    assert_eq!(down["trace_id"], json!(upstream.trace_id()));
    assert_eq!(down["parent_id"], json!(upstream.span_id()));
    assert_eq!(down["tags_string"]["user_id"], json!("u-99"));
}
