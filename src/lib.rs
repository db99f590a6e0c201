//! Client-side telemetry SDK for LLM applications: record structured
//! execution traces (model calls, prompt rendering, arbitrary user spans)
//! and ship them, with any oversized or binary attachments they reference,
//! to a remote ingest service.
//!
//! The SDK is built around a deadline-driven, batched, retry-capable
//! two-stage export pipeline: finished spans are queued, batched, and
//! posted; attachments extracted from a successfully posted batch feed a
//! second queue of file uploads. Tracing never blocks or fails the
//! application's hot path: span mutators are lock-cheap and infallible,
//! queues are bounded and drop under overload, and export failures degrade
//! to one retry and then a logged drop.
//!
//! # Quick Start
//!
//! ```no_run
//! use looptrace::{Client, Context, StartSpanOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .workspace_id("my-workspace")
//!         .api_token("pat-...")
//!         .build()?;
//!
//!     let ctx = Context::new();
//!     let (ctx, root) = client.start_span(&ctx, "handle_request", "custom",
//!         StartSpanOptions::default());
//!     root.set_input("user question");
//!
//!     let (_ctx, model) = client.start_span(&ctx, "invoke_model", "model",
//!         StartSpanOptions::default());
//!     model.set_model_name("gpt-large");
//!     model.set_input_tokens(11);
//!     model.set_output_tokens(52);
//!     model.finish();
//!
//!     root.finish();
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Cross-service propagation
//!
//! ```no_run
//! # use looptrace::{Client, Context, StartSpanOptions};
//! # async fn example(client: Client, span: looptrace::Span) {
//! // upstream: emit headers
//! let headers = span.to_header().unwrap();
//!
//! // downstream: continue the trace
//! let remote = client.get_span_from_header(&headers);
//! let (_ctx, child) = client.start_span(
//!     &Context::new(),
//!     "continue",
//!     "custom",
//!     StartSpanOptions {
//!         trace_id: Some(remote.trace_id),
//!         parent_span_id: Some(remote.span_id),
//!         baggage: Some(remote.baggage),
//!         ..Default::default()
//!     },
//! );
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`client`] - client construction, dedup, lifecycle, default-client facade
//! - [`trace`] - span data model, propagation, queues, export pipeline
//! - [`transport`] - HTTP contract, auth, retry classification, SSE framing
//! - [`error`] - error taxonomy
//!
//! # Delivery semantics
//!
//! At most once per span: a span may be dropped under queue overload, on a
//! second export failure, or at process crash. Callers that need guaranteed
//! delivery must use a different channel; tracing will not slow them down
//! to get it.

pub mod client;
pub mod error;
pub mod trace;
pub mod transport;
pub mod utils;

pub use client::{
    close, default_client, flush, get_span_from_context, get_span_from_header, start_span, Client,
    ClientBuilder,
};
pub use error::{LoopError, Result};
pub use trace::{
    Context, ModelChoice, ModelFileUrl, ModelImageUrl, ModelInput, ModelMessage, ModelMessagePart,
    ModelMessagePartType, ModelOutput, Span, SpanContext, StartSpanOptions, TagValue,
};
