//! The span pipeline: data model, propagation, bounded batch queues, and
//! the two-stage export processor (spans, then their extracted
//! attachments).
//!
//! # Key Types
//!
//! - [`Span`] - mutable record of one unit of work, finished exactly once
//! - [`Context`] - explicit carrier of the currently bound span
//! - [`SpanContext`] - identity view used for cross-process propagation
//! - [`UploadSpan`] / [`UploadFile`] - the export projection

pub mod attribute;
pub(crate) mod exporter;
pub(crate) mod processor;
pub(crate) mod propagation;
pub(crate) mod provider;
pub(crate) mod queue;
pub(crate) mod span;

pub use attribute::{
    ModelChoice, ModelFileUrl, ModelImageUrl, ModelInput, ModelMessage, ModelMessagePart,
    ModelMessagePartType, ModelOutput, Runtime,
};
pub use exporter::{UploadFile, UploadSpan, UploadType};
pub use propagation::{from_header, HEADER_BAGGAGE, HEADER_TRACEPARENT};
pub use provider::{Context, StartSpanOptions};
pub use span::{Span, SpanContext, TagValue};
