//! Span factory: starts spans with inherited identity and baggage, binds
//! them into an explicit [`Context`], and finalizes flush/shutdown.
//!
//! Rust has no ambient request context, so [`Context`] is a cheap clonable
//! value: starting a span returns a child context with the new span bound,
//! and nested work passes that context along explicitly.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::warn;

use crate::error::Result;
use crate::trace::attribute::MAX_VALUE_BYTES;
use crate::trace::processor::BatchSpanProcessor;
use crate::trace::propagation;
use crate::trace::span::{Span, SpanContext, SpanInner, SpanState};
use crate::transport::Transport;
use crate::utils;

/// Request-scoped carrier of the currently bound span.
#[derive(Debug, Clone, Default)]
pub struct Context {
    span: Option<Span>,
}

impl Context {
    /// An empty context with no span bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this context with `span` bound as current.
    pub fn with_span(&self, span: Span) -> Self {
        Self { span: Some(span) }
    }

    /// The span bound in this context, if any.
    pub fn span(&self) -> Option<&Span> {
        self.span.as_ref()
    }
}

/// Options for starting one span. Explicit values win over everything
/// inherited from the context.
#[derive(Debug, Clone, Default)]
pub struct StartSpanOptions {
    /// Wall-clock start; defaults to now.
    pub start_time: Option<SystemTime>,
    /// Explicit parent span id; defaults to the context's span, else `"0"`.
    pub parent_span_id: Option<String>,
    /// Explicit trace id; defaults to the context's trace, else a fresh one.
    pub trace_id: Option<String>,
    /// Explicit baggage; defaults to the context's span's baggage.
    pub baggage: Option<HashMap<String, String>>,
    /// Ignore any parent in the context and start a new trace root.
    pub start_new_trace: bool,
    /// Scene recorded in the runtime system tag.
    pub scene: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ProviderOptions {
    pub workspace_id: String,
    pub ultra_large_report: bool,
}

/// Factory for spans, owning the export pipeline.
pub(crate) struct Provider {
    options: ProviderOptions,
    processor: Arc<BatchSpanProcessor>,
}

impl Provider {
    pub(crate) fn new(transport: Arc<dyn Transport>, options: ProviderOptions) -> Self {
        Self {
            options,
            processor: BatchSpanProcessor::new(transport),
        }
    }

    pub(crate) fn start_span(
        &self,
        ctx: &Context,
        name: &str,
        span_type: &str,
        mut opts: StartSpanOptions,
    ) -> (Context, Span) {
        let (name, name_truncated) = utils::truncate_by_bytes(name, MAX_VALUE_BYTES);
        if name_truncated {
            warn!(limit = MAX_VALUE_BYTES, "span name too long, truncated");
        }
        let (span_type, type_truncated) = utils::truncate_by_bytes(span_type, MAX_VALUE_BYTES);
        if type_truncated {
            warn!(limit = MAX_VALUE_BYTES, "span type too long, truncated");
        }

        // explicit options win; the context's span fills the gaps unless a
        // new trace was requested
        if !opts.start_new_trace {
            if let Some(parent) = ctx.span().filter(|s| s.is_recording()) {
                if opts.trace_id.is_none() {
                    opts.trace_id = Some(parent.trace_id());
                }
                if opts.parent_span_id.is_none() {
                    opts.parent_span_id = Some(parent.span_id());
                }
                if opts.baggage.is_none() {
                    opts.baggage = Some(parent.baggage());
                }
            }
        }

        let span = self.build_span(name, span_type, opts);
        (ctx.with_span(span.clone()), span)
    }

    fn build_span(&self, name: String, span_type: String, opts: StartSpanOptions) -> Span {
        let parent_span_id = opts
            .parent_span_id
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "0".to_string());
        let trace_id = opts
            .trace_id
            .filter(|t| !t.is_empty())
            .unwrap_or_else(utils::gen_trace_id);
        let start_time = opts.start_time.unwrap_or_else(SystemTime::now);

        let inner = Arc::new(SpanInner {
            trace_id,
            span_id: utils::gen_span_id(),
            workspace_id: self.options.workspace_id.clone(),
            name,
            span_type,
            start_time,
            scene: opts.scene.unwrap_or_default(),
            flags: 0,
            ultra_large_report: self.options.ultra_large_report,
            finished: AtomicBool::new(false),
            processor: Arc::downgrade(&self.processor),
            state: Mutex::new(SpanState {
                parent_span_id,
                ..Default::default()
            }),
        });
        let span = Span::from_inner(inner);

        // inherited baggage is already canonical, do not re-escape
        if let Some(baggage) = opts.baggage {
            span.set_baggage_inner(baggage.into_iter().collect(), false);
        }

        span
    }

    pub(crate) fn get_span_from_context(&self, ctx: &Context) -> Span {
        ctx.span().cloned().unwrap_or_default()
    }

    pub(crate) fn get_span_from_header(&self, headers: &HashMap<String, String>) -> SpanContext {
        propagation::from_header(headers)
    }

    pub(crate) async fn flush(&self) -> Result<()> {
        self.processor.force_flush().await
    }

    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.processor.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ApiResponse, Transport};
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn post(&self, _path: &str, _body: serde_json::Value) -> Result<ApiResponse> {
            Ok(ApiResponse::default())
        }

        async fn upload_file(
            &self,
            _path: &str,
            _tos_key: &str,
            _data: Vec<u8>,
            _form: HashMap<String, String>,
        ) -> Result<ApiResponse> {
            Ok(ApiResponse::default())
        }
    }

    fn provider(ultra_large_report: bool) -> Provider {
        Provider::new(
            Arc::new(NullTransport),
            ProviderOptions {
                workspace_id: "ws-1".to_string(),
                ultra_large_report,
            },
        )
    }

    #[tokio::test]
    async fn test_root_span_defaults() {
        let provider = provider(false);
        let (_, span) = provider.start_span(
            &Context::new(),
            "root",
            "custom",
            StartSpanOptions::default(),
        );
        assert_eq!(span.trace_id().len(), 32);
        assert_eq!(span.span_id().len(), 16);
        assert_eq!(span.parent_span_id(), "0");
    }

    #[tokio::test]
    async fn test_child_inherits_identity_and_baggage() {
        let provider = provider(false);
        let (ctx, root) = provider.start_span(
            &Context::new(),
            "root",
            "custom",
            StartSpanOptions::default(),
        );
        root.set_baggage([("user_id", "u-1")]);

        let (_, child) = provider.start_span(&ctx, "child", "custom", StartSpanOptions::default());
        assert_eq!(child.trace_id(), root.trace_id());
        assert_eq!(child.parent_span_id(), root.span_id());
        assert_ne!(child.span_id(), root.span_id());
        assert_eq!(child.baggage().get("user_id"), Some(&"u-1".to_string()));
    }

    #[tokio::test]
    async fn test_start_new_trace_ignores_parent() {
        let provider = provider(false);
        let (ctx, root) = provider.start_span(
            &Context::new(),
            "root",
            "custom",
            StartSpanOptions::default(),
        );
        let (_, detached) = provider.start_span(
            &ctx,
            "detached",
            "custom",
            StartSpanOptions {
                start_new_trace: true,
                ..Default::default()
            },
        );
        assert_ne!(detached.trace_id(), root.trace_id());
        assert_eq!(detached.parent_span_id(), "0");
    }

    #[tokio::test]
    async fn test_explicit_options_win_over_parent() {
        let provider = provider(false);
        let (ctx, _) = provider.start_span(
            &Context::new(),
            "root",
            "custom",
            StartSpanOptions::default(),
        );
        let (_, span) = provider.start_span(
            &ctx,
            "child",
            "custom",
            StartSpanOptions {
                trace_id: Some("0123456789abcdef0123456789abcdef".to_string()),
                parent_span_id: Some("00000000deadbeef".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(span.trace_id(), "0123456789abcdef0123456789abcdef");
        assert_eq!(span.parent_span_id(), "00000000deadbeef");
    }

    #[tokio::test]
    async fn test_long_name_truncated() {
        let provider = provider(false);
        let (_, span) = provider.start_span(
            &Context::new(),
            &"n".repeat(MAX_VALUE_BYTES + 5),
            "custom",
            StartSpanOptions::default(),
        );
        let inner = span.inner.as_ref().unwrap();
        assert_eq!(inner.name.len(), MAX_VALUE_BYTES);
    }

    #[tokio::test]
    async fn test_get_span_from_context_noop_fallback() {
        let provider = provider(false);
        let span = provider.get_span_from_context(&Context::new());
        assert!(!span.is_recording());
    }
}
