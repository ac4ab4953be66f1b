use std::panic::{catch_unwind, AssertUnwindSafe};

use canvas_batch_types::ProgressEvent;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("progress consumer is gone")]
    Closed,
    #[error("progress sink failed: {0}")]
    Failed(String),
}

/// Receiver of progress updates from a running batch.
///
/// Implementations may fail or even panic; the engine logs and swallows both
/// so a broken consumer never disturbs batch accounting.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent) -> Result<(), ProgressError>;
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        self(event);
        Ok(())
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn report(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        self.send(event).map_err(|_| ProgressError::Closed)
    }
}

pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn report(&self, _event: ProgressEvent) -> Result<(), ProgressError> {
        Ok(())
    }
}

/// Fan-out sink: every subscriber sees every event. Having no subscribers is fine.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressBus {
    fn report(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        self.publish(event);
        Ok(())
    }
}

/// Pushes `event` to `sink`, swallowing errors and panics.
pub(crate) fn report_guarded(sink: &dyn ProgressSink, event: ProgressEvent) {
    match catch_unwind(AssertUnwindSafe(|| sink.report(event))) {
        Ok(Ok(())) => {}
        Ok(Err(ProgressError::Closed)) => {
            tracing::debug!("progress consumer closed; dropping update");
        }
        Ok(Err(e)) => tracing::warn!("progress sink error: {}", e),
        Err(_) => tracing::warn!("progress sink panicked; update dropped"),
    }
}
