use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Identifies one logical operation (e.g. `delete_conversations`) within one
/// UI session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub session_id: String,
    pub operation: String,
}

impl OperationKey {
    pub fn new(session_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            operation: operation.into(),
        }
    }

    /// Namespaced id used for abort handles: `"{session}:{operation}"`.
    pub fn operation_id(&self) -> String {
        format!("{}:{}", self.session_id, self.operation)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session_id, self.operation)
    }
}

/// Abortable handle for one registered operation.
#[derive(Clone)]
pub struct AbortHandle {
    operation_id: String,
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl AbortHandle {
    fn new(operation_id: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Token a request thunk can watch to stop early.
    pub fn signal(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// First reason wins; later aborts are no-ops.
    pub fn abort(&self, reason: &str) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.token.cancel();
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("operation_id", &self.operation_id)
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Per-session cancellation state: boolean stop flags read by batch loops,
/// plus abort handles that can interrupt in-flight work.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    flags: Arc<RwLock<HashMap<OperationKey, FlagEntry>>>,
    handles: Arc<Mutex<HashMap<String, AbortHandle>>>,
    generations: Arc<AtomicU64>,
}

/// Flag value plus the run (`begin` call) that owns it; 0 means no run.
#[derive(Debug, Clone, Copy, Default)]
struct FlagEntry {
    cancelled: bool,
    generation: u64,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flag(&self, key: &OperationKey, value: bool) {
        self.flags
            .write()
            .entry(key.clone())
            .or_default()
            .cancelled = value;
    }

    pub fn get_flag(&self, key: &OperationKey) -> bool {
        self.flags
            .read()
            .get(key)
            .is_some_and(|entry| entry.cancelled)
    }

    pub fn clear_flag(&self, key: &OperationKey) {
        self.flags.write().remove(key);
    }

    /// Resets the flag for `key` and returns a guard that clears it on drop.
    ///
    /// A cancel request left over from an earlier run of the same operation
    /// is discarded here.
    pub fn begin(&self, key: OperationKey) -> OperationGuard {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        self.flags.write().insert(
            key.clone(),
            FlagEntry {
                cancelled: false,
                generation,
            },
        );
        OperationGuard {
            registry: self.clone(),
            key,
            generation,
        }
    }

    /// Clears the flag only while the run `generation` still owns it.
    fn end(&self, key: &OperationKey, generation: u64) {
        let mut flags = self.flags.write();
        if flags
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            flags.remove(key);
        }
    }

    /// Registers a fresh handle, aborting any previous one with the same id
    /// with reason `"superseded"`.
    pub fn create_abort_handle(&self, operation_id: &str) -> AbortHandle {
        let handle = AbortHandle::new(operation_id);
        let previous = self
            .handles
            .lock()
            .insert(operation_id.to_string(), handle.clone());
        if let Some(previous) = previous {
            tracing::debug!("superseding abort handle {}", operation_id);
            previous.abort("superseded");
        }
        handle
    }

    pub fn abort(&self, operation_id: &str, reason: &str) -> bool {
        let removed = self.handles.lock().remove(operation_id);
        match removed {
            Some(handle) => {
                handle.abort(reason);
                true
            }
            None => false,
        }
    }

    /// Deregisters without aborting. Only removes `handle` itself, so a
    /// finishing run cannot drop the handle of a newer run that superseded it.
    pub fn remove_abort_handle(&self, handle: &AbortHandle) {
        let mut handles = self.handles.lock();
        if handles
            .get(handle.operation_id())
            .is_some_and(|current| Arc::ptr_eq(&current.reason, &handle.reason))
        {
            handles.remove(handle.operation_id());
        }
    }

    pub fn has_abort_handle(&self, operation_id: &str) -> bool {
        self.handles.lock().contains_key(operation_id)
    }

    /// Drops every flag of `session_id` and aborts every handle namespaced
    /// under it. Returns the number of handles aborted.
    pub fn release_scope(&self, session_id: &str) -> usize {
        self.flags
            .write()
            .retain(|key, _| key.session_id != session_id);

        let prefix = format!("{}:", session_id);
        let released: Vec<AbortHandle> = {
            let mut handles = self.handles.lock();
            let ids: Vec<String> = handles
                .keys()
                .filter(|id| id.as_str() == session_id || id.starts_with(&prefix))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| handles.remove(&id))
                .collect()
        };
        for handle in &released {
            handle.abort("session closed");
        }
        released.len()
    }

    pub fn flag_count(&self) -> usize {
        self.flags.read().len()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Live cancellation scope of one batch run.
pub struct OperationGuard {
    registry: CancellationRegistry,
    key: OperationKey,
    generation: u64,
}

impl OperationGuard {
    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn is_cancelled(&self) -> bool {
        self.registry.get_flag(&self.key)
    }

    /// Predicate suitable for `with_cancel_check`.
    pub fn cancel_check(&self) -> impl Fn() -> bool + Send + Sync + 'static {
        let registry = self.registry.clone();
        let key = self.key.clone();
        move || registry.get_flag(&key)
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.registry.end(&self.key, self.generation);
    }
}
