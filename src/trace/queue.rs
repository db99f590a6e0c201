//! Generic bounded batch queue: the building block of the export pipeline.
//!
//! Each queue owns exactly one worker task. Producers enqueue without ever
//! blocking (an item that would overflow the queue is dropped with a
//! warning), the worker assembles batches and hands them to the exporter
//! when the batch reaches its count cap, its byte cap, or its timeout
//! counted from the batch's first item.
//!
//! `force_flush` and `shutdown` are in-band control messages: the worker
//! drains everything queued ahead of them, exports, and acknowledges, which
//! gives callers a real "everything submitted before this point has been
//! handed to the exporter" barrier without locking the batch itself.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

/// Receives assembled batches. Failure handling is entirely the exporter's
/// business, typically re-submission to a retry queue.
#[async_trait]
pub(crate) trait BatchExporter<T>: Send + Sync + 'static {
    async fn export(&self, batch: Vec<T>);
}

#[derive(Debug, Clone)]
pub(crate) struct QueueOptions {
    pub name: &'static str,
    pub batch_timeout: Duration,
    pub max_queue_length: usize,
    pub max_export_batch_length: usize,
    pub max_export_batch_bytes: i64,
}

enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Bounded producer/consumer queue with double bookkeeping of element count
/// and byte weight. Cheap to share; all methods take `&self`.
pub(crate) struct BatchQueue<T> {
    name: &'static str,
    data_tx: mpsc::Sender<(T, i64)>,
    ctrl_tx: mpsc::UnboundedSender<Control>,
    queued_bytes: Arc<AtomicI64>,
    dropped: AtomicUsize,
    is_shutdown: AtomicBool,
}

impl<T: Send + 'static> BatchQueue<T> {
    pub(crate) fn new(options: QueueOptions, exporter: Arc<dyn BatchExporter<T>>) -> Arc<Self> {
        let (data_tx, data_rx) = mpsc::channel(options.max_queue_length);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let queued_bytes = Arc::new(AtomicI64::new(0));

        let worker = Worker {
            options: options.clone(),
            data_rx,
            ctrl_rx,
            exporter,
            queued_bytes: queued_bytes.clone(),
            batch: Vec::new(),
            batch_bytes: 0,
            deadline: None,
        };
        tokio::spawn(worker.run());

        Arc::new(Self {
            name: options.name,
            data_tx,
            ctrl_tx,
            queued_bytes,
            dropped: AtomicUsize::new(0),
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Non-blocking enqueue. Returns false when the item was dropped
    /// (queue full or shut down).
    pub(crate) fn enqueue(&self, item: T, byte_weight: i64) -> bool {
        if self.is_shutdown.load(Ordering::Acquire) {
            debug!(queue = self.name, "enqueue after shutdown, item dropped");
            return false;
        }
        match self.data_tx.try_send((item, byte_weight)) {
            Ok(()) => {
                self.queued_bytes.fetch_add(byte_weight, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(queue = self.name, dropped, "queue is full, dropping item");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(queue = self.name, "queue worker stopped, item dropped");
                false
            }
        }
    }

    /// Block until everything queued before this call has been handed to the
    /// exporter. A no-op returning Ok after shutdown.
    pub(crate) async fn force_flush(&self) -> Result<()> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.ctrl_tx.send(Control::Flush(ack_tx)).is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }

    /// Drain like `force_flush`, then reject all further enqueues.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.ctrl_tx.send(Control::Shutdown(ack_tx)).is_err() {
            return Ok(());
        }
        let _ = ack_rx.await;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Worker<T> {
    options: QueueOptions,
    data_rx: mpsc::Receiver<(T, i64)>,
    ctrl_rx: mpsc::UnboundedReceiver<Control>,
    exporter: Arc<dyn BatchExporter<T>>,
    queued_bytes: Arc<AtomicI64>,
    batch: Vec<T>,
    batch_bytes: i64,
    deadline: Option<Instant>,
}

impl<T: Send + 'static> Worker<T> {
    async fn run(mut self) {
        loop {
            // the sleep arm is gated on deadline.is_some(); the fallback
            // instant is never awaited to completion
            let wake_at = self
                .deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(60));
            tokio::select! {
                biased;
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    Some(Control::Flush(ack)) => {
                        self.drain().await;
                        let _ = ack.send(());
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.data_rx.close();
                        self.drain().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.drain().await;
                        break;
                    }
                },
                item = self.data_rx.recv() => match item {
                    Some((item, weight)) => self.push(item, weight).await,
                    None => {
                        self.export_batch().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake_at), if self.deadline.is_some() => {
                    self.export_batch().await;
                }
            }
        }
    }

    async fn push(&mut self, item: T, weight: i64) {
        self.queued_bytes.fetch_sub(weight, Ordering::Relaxed);
        if self.batch.is_empty() {
            self.deadline = Some(Instant::now() + self.options.batch_timeout);
        }
        self.batch.push(item);
        self.batch_bytes += weight;
        if self.batch.len() >= self.options.max_export_batch_length
            || self.batch_bytes >= self.options.max_export_batch_bytes
        {
            self.export_batch().await;
        }
    }

    /// Pull everything currently buffered and export it, batch caps still
    /// applying. Items enqueued while an export is in flight are picked up
    /// by the next loop iteration.
    async fn drain(&mut self) {
        loop {
            match self.data_rx.try_recv() {
                Ok((item, weight)) => self.push(item, weight).await,
                Err(_) => break,
            }
        }
        self.export_batch().await;
    }

    async fn export_batch(&mut self) {
        self.deadline = None;
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        self.batch_bytes = 0;
        debug!(queue = self.options.name, count = batch.len(), "exporting batch");
        self.exporter.export(batch).await;
    }
}
