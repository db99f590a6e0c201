//! Four-queue export pipeline.
//!
//! Finished spans enter the `span` queue. A span batch is converted to
//! upload records and posted; on success its extracted attachments are fed
//! to the `file` queue, on failure the source spans are re-enqueued to the
//! smaller-batched `span retry` queue. File uploads that fail land once on
//! the `file retry` queue. Neither retry queue has a further retry target,
//! so a persistently failing server degrades to drops instead of loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::trace::exporter::{transfer_to_upload, SpanExporter, UploadFile};
use crate::trace::queue::{BatchExporter, BatchQueue, QueueOptions};
use crate::trace::span::Span;
use crate::transport::Transport;

const SPAN_QUEUE_LENGTH: usize = 2048;
const SPAN_BATCH_LENGTH: usize = 512;
const SPAN_RETRY_BATCH_LENGTH: usize = 50;
const SPAN_BATCH_BYTES: i64 = 4 * 1024 * 1024;
const SPAN_SCHEDULE_DELAY: Duration = Duration::from_millis(1000);

const FILE_QUEUE_LENGTH: usize = 512;
const FILE_BATCH_LENGTH: usize = 5;
const FILE_BATCH_BYTES: i64 = 100 * 1024 * 1024;
const FILE_SCHEDULE_DELAY: Duration = Duration::from_millis(5000);

/// Owns the four queues and the exporter they share.
pub(crate) struct BatchSpanProcessor {
    span_queue: Arc<BatchQueue<Span>>,
    span_retry_queue: Arc<BatchQueue<Span>>,
    file_queue: Arc<BatchQueue<UploadFile>>,
    file_retry_queue: Arc<BatchQueue<UploadFile>>,
    stopped: AtomicBool,
}

impl BatchSpanProcessor {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let exporter = Arc::new(SpanExporter::new(transport));

        let file_retry_queue = BatchQueue::new(
            QueueOptions {
                name: "file retry",
                batch_timeout: FILE_SCHEDULE_DELAY,
                max_queue_length: FILE_QUEUE_LENGTH,
                max_export_batch_length: FILE_BATCH_LENGTH,
                max_export_batch_bytes: FILE_BATCH_BYTES,
            },
            Arc::new(FileExportStage {
                exporter: exporter.clone(),
                retry_queue: None,
            }),
        );
        let file_queue = BatchQueue::new(
            QueueOptions {
                name: "file",
                batch_timeout: FILE_SCHEDULE_DELAY,
                max_queue_length: FILE_QUEUE_LENGTH,
                max_export_batch_length: FILE_BATCH_LENGTH,
                max_export_batch_bytes: FILE_BATCH_BYTES,
            },
            Arc::new(FileExportStage {
                exporter: exporter.clone(),
                retry_queue: Some(file_retry_queue.clone()),
            }),
        );

        let span_retry_queue = BatchQueue::new(
            QueueOptions {
                name: "span retry",
                batch_timeout: SPAN_SCHEDULE_DELAY,
                max_queue_length: SPAN_QUEUE_LENGTH,
                max_export_batch_length: SPAN_RETRY_BATCH_LENGTH,
                max_export_batch_bytes: SPAN_BATCH_BYTES,
            },
            Arc::new(SpanExportStage {
                exporter: exporter.clone(),
                retry_queue: None,
                file_queue: file_queue.clone(),
            }),
        );
        let span_queue = BatchQueue::new(
            QueueOptions {
                name: "span",
                batch_timeout: SPAN_SCHEDULE_DELAY,
                max_queue_length: SPAN_QUEUE_LENGTH,
                max_export_batch_length: SPAN_BATCH_LENGTH,
                max_export_batch_bytes: SPAN_BATCH_BYTES,
            },
            Arc::new(SpanExportStage {
                exporter,
                retry_queue: Some(span_retry_queue.clone()),
                file_queue: file_queue.clone(),
            }),
        );

        Arc::new(Self {
            span_queue,
            span_retry_queue,
            file_queue,
            file_retry_queue,
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn on_span_end(&self, span: Span) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let byte_weight = span.bytes_size();
        self.span_queue.enqueue(span, byte_weight);
    }

    pub(crate) async fn force_flush(&self) -> Result<()> {
        self.span_queue.force_flush().await?;
        self.span_retry_queue.force_flush().await?;
        self.file_queue.force_flush().await?;
        self.file_retry_queue.force_flush().await?;
        Ok(())
    }

    /// Shut the queues down upstream-first so producers stop before their
    /// downstream closes.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        self.span_queue.shutdown().await?;
        self.span_retry_queue.shutdown().await?;
        self.file_queue.shutdown().await?;
        self.file_retry_queue.shutdown().await?;
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }
}

/// Span-batch stage: extract, post, then fan out attachments or retries.
struct SpanExportStage {
    exporter: Arc<SpanExporter>,
    retry_queue: Option<Arc<BatchQueue<Span>>>,
    file_queue: Arc<BatchQueue<UploadFile>>,
}

#[async_trait]
impl BatchExporter<Span> for SpanExportStage {
    async fn export(&self, batch: Vec<Span>) {
        let (upload_spans, upload_files) = transfer_to_upload(&batch);
        match self.exporter.export_spans(&upload_spans).await {
            Ok(()) => {
                for file in upload_files {
                    let byte_weight = file.data.len() as i64;
                    self.file_queue.enqueue(file, byte_weight);
                }
            }
            Err(e) => {
                warn!(error = %e, count = batch.len(), "span export failed");
                if let Some(retry_queue) = &self.retry_queue {
                    for span in batch {
                        let byte_weight = span.bytes_size();
                        retry_queue.enqueue(span, byte_weight);
                    }
                }
            }
        }
    }
}

/// File-batch stage: upload each attachment, re-enqueueing the batch on
/// failure when a retry target exists.
struct FileExportStage {
    exporter: Arc<SpanExporter>,
    retry_queue: Option<Arc<BatchQueue<UploadFile>>>,
}

#[async_trait]
impl BatchExporter<UploadFile> for FileExportStage {
    async fn export(&self, batch: Vec<UploadFile>) {
        if let Err(e) = self.exporter.export_files(&batch).await {
            warn!(error = %e, count = batch.len(), "file export failed");
            if let Some(retry_queue) = &self.retry_queue {
                for file in batch {
                    let byte_weight = file.data.len() as i64;
                    retry_queue.enqueue(file, byte_weight);
                }
            }
        }
    }
}
