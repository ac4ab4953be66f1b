// Per-window session lifecycle

use std::sync::Arc;

use crate::cancellation::{AbortHandle, CancellationRegistry, OperationGuard, OperationKey};
use crate::chunked::{ChunkOptions, ChunkedRunner};
use crate::executor::{BatchExecutor, ExecutorOptions};
use crate::progress::{ProgressBus, ProgressSink};
use crate::security::PathGate;

/// Owns the cancellation registry, path gate and progress bus shared by all
/// sessions of one host process.
#[derive(Clone, Default)]
pub struct SessionHost {
    registry: CancellationRegistry,
    gate: PathGate,
    progress: ProgressBus,
}

impl SessionHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn gate(&self) -> &PathGate {
        &self.gate
    }

    pub fn progress(&self) -> &ProgressBus {
        &self.progress
    }

    /// Starts `operation` for `session_id`: resets its cancel flag and
    /// registers an abort handle under `"{session}:{operation}"`.
    pub fn begin_operation(&self, session_id: &str, operation: &str) -> ActiveOperation {
        let key = OperationKey::new(session_id, operation);
        let abort = self.registry.create_abort_handle(&key.operation_id());
        let guard = self.registry.begin(key);
        tracing::debug!("operation {} started", guard.key());
        ActiveOperation {
            registry: self.registry.clone(),
            progress: Arc::new(self.progress.clone()),
            guard,
            abort,
        }
    }

    /// Sets the cancel flag and aborts the handle. Returns whether a live
    /// handle was found.
    pub fn cancel_operation(&self, session_id: &str, operation: &str) -> bool {
        let key = OperationKey::new(session_id, operation);
        self.registry.set_flag(&key, true);
        self.registry.abort(&key.operation_id(), "cancelled by user")
    }

    /// Releases everything the session holds: flags, abort handles and
    /// remembered paths.
    pub fn close_session(&self, session_id: &str) {
        let aborted = self.registry.release_scope(session_id);
        let forgotten = self.gate.release_scope(session_id);
        tracing::info!(
            "session {} closed (aborted {} operations, forgot {} paths)",
            session_id,
            aborted,
            forgotten
        );
    }
}

/// A running operation. Dropping it clears the cancel flag and deregisters
/// the abort handle.
pub struct ActiveOperation {
    registry: CancellationRegistry,
    progress: Arc<dyn ProgressSink>,
    guard: OperationGuard,
    abort: AbortHandle,
}

impl ActiveOperation {
    pub fn key(&self) -> &OperationKey {
        self.guard.key()
    }

    pub fn guard(&self) -> &OperationGuard {
        &self.guard
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub fn is_cancelled(&self) -> bool {
        self.guard.is_cancelled() || self.abort.is_aborted()
    }

    /// Executor wired to this operation's flag, abort handle and the host's progress bus.
    pub fn executor(&self, options: ExecutorOptions) -> BatchExecutor {
        BatchExecutor::new(options)
            .with_progress_arc(self.progress.clone())
            .with_cancel_check(self.guard.cancel_check())
            .with_abort(self.abort.clone())
            .with_operation(self.key().clone())
    }

    pub fn chunked(&self, options: ChunkOptions) -> ChunkedRunner {
        let flag = self.guard.cancel_check();
        let abort = self.abort.clone();
        ChunkedRunner::new(options)
            .with_progress_arc(self.progress.clone())
            .with_cancel_check(move || flag() || abort.is_aborted())
            .with_operation(self.key().clone())
    }
}

impl Drop for ActiveOperation {
    fn drop(&mut self) {
        self.registry.remove_abort_handle(&self.abort);
    }
}
