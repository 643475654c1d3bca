use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::buffers::RecordBuffer;
use crate::config::Config;
use crate::event::IncomingEvent;
use crate::exporter::{BulkExporter, ExportError, HttpExporter};
use crate::transform::{TransformError, transform};

/// Result of one flush cycle. Failures are reported here for observation
/// only; the batch is gone either way.
#[derive(Debug)]
pub enum FlushOutcome {
    /// Nothing was buffered, no request was made.
    Empty,
    /// The backend accepted the write. `failed` documents were refused
    /// individually inside an otherwise successful response.
    Sent { documents: usize, failed: usize },
    /// The write failed and the batch was dropped.
    Dropped {
        documents: usize,
        error: ExportError,
    },
}

/// Buffers accepted events and ships them to the backend on each tick.
///
/// `accept` and `on_tick` may be called from different tasks; they only meet
/// at the buffer swap, so an in-flight write never blocks `accept`.
pub struct BatchFlusher<E: BulkExporter = HttpExporter> {
    config: Arc<Config>,
    buffer: RecordBuffer,
    exporter: Arc<E>,
}

impl<E: BulkExporter> Clone for BatchFlusher<E> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            buffer: self.buffer.clone(),
            exporter: Arc::clone(&self.exporter),
        }
    }
}

impl BatchFlusher<HttpExporter> {
    pub fn new(config: Config) -> Result<Self, ExportError> {
        let exporter = HttpExporter::new(&config)?;
        Ok(Self::with_exporter(config, exporter))
    }
}

impl<E: BulkExporter> BatchFlusher<E> {
    pub fn with_exporter(config: Config, exporter: E) -> Self {
        Self {
            config: Arc::new(config),
            buffer: RecordBuffer::new(),
            exporter: Arc::new(exporter),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Wire records waiting for the next flush (two per event).
    pub fn buffered_records(&self) -> usize {
        self.buffer.len()
    }

    /// Transform `event` and buffer its records for the next flush.
    ///
    /// A rejected event is logged and returned to the caller; the buffer is
    /// left untouched.
    pub fn accept(&self, event: &IncomingEvent) -> Result<(), TransformError> {
        self.accept_at(event, Utc::now())
    }

    /// [`accept`](Self::accept) with an explicit clock reading for the index
    /// name.
    pub fn accept_at(&self, event: &IncomingEvent, now: DateTime<Utc>) -> Result<(), TransformError> {
        match transform(event, &self.config, now) {
            Ok((header, body)) => {
                self.buffer.push_pair(header, body);
                trace!(client = %event.client.name, "event buffered");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, client = %event.client.name, "dropping event");
                Err(e)
            }
        }
    }

    /// Run one flush cycle: drain the buffer, send it as a single bulk
    /// write, and drop it whatever the outcome.
    pub async fn on_tick(&self) -> FlushOutcome {
        let batch = self.buffer.take();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let documents = batch.documents();

        match self.exporter.export(&batch).await {
            Ok(summary) if summary.failed > 0 => {
                warn!(
                    documents,
                    failed = summary.failed,
                    first_error = summary.first_error.as_deref().unwrap_or_default(),
                    "backend refused some documents"
                );
                FlushOutcome::Sent {
                    documents,
                    failed: summary.failed,
                }
            }
            Ok(_) => {
                debug!(documents, "bulk write sent");
                FlushOutcome::Sent {
                    documents,
                    failed: 0,
                }
            }
            Err(error) => {
                log_dropped(&error, documents);
                FlushOutcome::Dropped { documents, error }
            }
        }
    }

    /// Spawn the recurring flush timer. The first tick fires one
    /// `flush_interval` after this call. Must be called within a tokio
    /// runtime.
    pub fn start(&self) -> FlushTimer {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_timer(self.clone(), cancel.clone()));
        FlushTimer {
            cancel,
            task: Some(task),
        }
    }
}

fn log_dropped(error: &ExportError, documents: usize) {
    match error {
        ExportError::Rejected { status, body } if status.is_client_error() => {
            warn!(%status, body = body.as_str(), documents, "bulk write rejected, batch dropped");
        }
        ExportError::Rejected { status, body } => {
            error!(%status, body = body.as_str(), documents, "bulk write rejected, batch dropped");
        }
        other => {
            error!(error = %other, documents, "bulk write failed, batch dropped");
        }
    }
}

/// Ticks until cancelled, then flushes whatever is left once more.
///
/// A tick that arrives while a write is in flight is delayed rather than
/// queued, so writes never overlap.
async fn run_timer<E: BulkExporter>(flusher: BatchFlusher<E>, cancel: CancellationToken) {
    let period = flusher.config.flush_interval;
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                flusher.on_tick().await;
            }
        }
    }

    if let FlushOutcome::Sent { documents, .. } = flusher.on_tick().await {
        debug!(documents, "final flush sent");
    }
}

/// Handle to a running flush timer.
///
/// Dropping it stops the timer; the final flush then runs in the background
/// for as long as the runtime lives. Use [`stop`](Self::stop) to wait for it.
pub struct FlushTimer {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FlushTimer {
    /// Stop ticking, wait for an in-flight write, and flush what is left.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(error = %e, "flush timer task panicked");
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
