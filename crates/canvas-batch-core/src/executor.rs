// Rate-limited batch executor
// Bounded-concurrency request runner with throttle-aware retry.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use canvas_batch_observability::{emit_event, ObservabilityEvent, ProcessKind};
use canvas_batch_types::{
    BatchResult, FailureRecord, ProgressEvent, RequestError, RequestId, SuccessRecord,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::Level;
use uuid::Uuid;

use crate::cancellation::{AbortHandle, OperationKey};
use crate::classify::{backoff_delay, classify_error, jitter};
use crate::progress::{report_guarded, NoopProgress, ProgressSink};

pub type RequestFuture<R> = BoxFuture<'static, Result<R, RequestError>>;

// ============================================================================
// Request descriptors
// ============================================================================

/// One unit of work: an id plus a re-invocable async thunk.
///
/// The thunk is called once per attempt; the executor never looks at what it
/// does.
pub struct RequestDescriptor<R> {
    pub id: RequestId,
    run: Arc<dyn Fn() -> RequestFuture<R> + Send + Sync>,
    timeout: Option<Duration>,
}

impl<R> Clone for RequestDescriptor<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            run: self.run.clone(),
            timeout: self.timeout,
        }
    }
}

impl<R: Send + 'static> RequestDescriptor<R> {
    pub fn new<F, Fut>(id: impl Into<RequestId>, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RequestError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            run: Arc::new(move || run().boxed()),
            timeout: None,
        }
    }

    /// Fails an attempt with a status-less (retryable) error once `timeout` elapses.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs the thunk once. Panics, whether raised while building the future
    /// or while polling it, come back as status-less errors.
    pub async fn attempt(&self) -> Result<R, RequestError> {
        let fut = match catch_unwind(AssertUnwindSafe(|| (self.run)())) {
            Ok(fut) => fut,
            Err(panic) => return Err(panic_error(panic)),
        };
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let settled = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(settled) => settled,
                Err(_) => {
                    return Err(RequestError::network(format!(
                        "request timed out after {}ms",
                        limit.as_millis()
                    )))
                }
            },
            None => guarded.await,
        };
        settled.unwrap_or_else(|panic| Err(panic_error(panic)))
    }
}

fn panic_error(panic: Box<dyn std::any::Any + Send>) -> RequestError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    RequestError::network(format!("request panicked: {}", detail))
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    /// Upper bound on requests with an attempt in flight.
    pub max_concurrent: usize,
    pub base_delay_ms: u64,
    /// Uniform random `[0, jitter_ms)` added to every backoff.
    pub jitter_ms: u64,
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    /// Per-attempt limit applied to descriptors without their own timeout.
    pub request_timeout_ms: Option<u64>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 35,
            base_delay_ms: 200,
            jitter_ms: 200,
            max_retries: 3,
            request_timeout_ms: None,
        }
    }
}

pub(crate) enum Outcome<R> {
    Success(SuccessRecord<R>),
    Failure(FailureRecord),
}

impl<R> Outcome<R> {
    pub(crate) fn record_into(self, result: &mut BatchResult<R>) {
        match self {
            Outcome::Success(s) => result.successful.push(s),
            Outcome::Failure(f) => result.failed.push(f),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct LogContext {
    batch_id: String,
    session_id: Option<String>,
    operation: Option<String>,
}

impl LogContext {
    fn emit(&self, level: Level, event: &str, request_id: Option<&str>, status: &str, detail: &str) {
        emit_event(
            level,
            ProcessKind::Host,
            ObservabilityEvent {
                event,
                component: "core.executor",
                session_id: self.session_id.as_deref(),
                operation: self.operation.as_deref(),
                batch_id: Some(&self.batch_id),
                request_id,
                status: Some(status),
                error_code: None,
                detail: Some(detail),
            },
        );
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs request descriptors with bounded concurrency, retrying throttled and
/// transient failures with exponential backoff.
///
/// `run` never fails: every request ends up in `successful` or `failed`
/// unless cancellation stopped it from being admitted.
pub struct BatchExecutor {
    options: ExecutorOptions,
    progress: Arc<dyn ProgressSink>,
    cancel_check: Arc<dyn Fn() -> bool + Send + Sync>,
    abort: Option<AbortHandle>,
    operation: Option<OperationKey>,
}

impl BatchExecutor {
    pub fn new(options: ExecutorOptions) -> Self {
        Self {
            options,
            progress: Arc::new(NoopProgress),
            cancel_check: Arc::new(|| false),
            abort: None,
            operation: None,
        }
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Arc::new(sink);
        self
    }

    pub fn with_progress_arc(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Polled before each admission; once true no new request starts.
    pub fn with_cancel_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.cancel_check = Arc::new(check);
        self
    }

    /// Aborting `handle` stops admission and cuts short pending backoff sleeps.
    pub fn with_abort(mut self, handle: AbortHandle) -> Self {
        self.abort = Some(handle);
        self
    }

    /// Tags log events with the owning session and operation.
    pub fn with_operation(mut self, key: OperationKey) -> Self {
        self.operation = Some(key);
        self
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    fn is_cancelled(&self) -> bool {
        (self.cancel_check)() || self.abort.as_ref().is_some_and(AbortHandle::is_aborted)
    }

    pub async fn run<R>(&self, requests: Vec<RequestDescriptor<R>>) -> BatchResult<R>
    where
        R: Send + 'static,
    {
        let mut result = BatchResult::empty();
        let total = requests.len();
        if total == 0 {
            return result;
        }

        let ctx = Arc::new(LogContext {
            batch_id: Uuid::new_v4().to_string(),
            session_id: self.operation.as_ref().map(|k| k.session_id.clone()),
            operation: self.operation.as_ref().map(|k| k.operation.clone()),
        });
        ctx.emit(
            Level::INFO,
            "batch.start",
            None,
            "start",
            &format!(
                "total={} max_concurrent={} max_retries={}",
                total, self.options.max_concurrent, self.options.max_retries
            ),
        );

        let limit = self.options.max_concurrent.max(1);
        let default_timeout = self.options.request_timeout_ms.map(Duration::from_millis);
        let mut queue: VecDeque<RequestDescriptor<R>> = requests.into();
        let mut in_flight: JoinSet<Outcome<R>> = JoinSet::new();
        let mut pending_ids: HashMap<tokio::task::Id, RequestId> = HashMap::new();
        let mut completed = 0usize;

        loop {
            while !result.cancelled && in_flight.len() < limit && !queue.is_empty() {
                if self.is_cancelled() {
                    result.cancelled = true;
                    ctx.emit(
                        Level::INFO,
                        "batch.cancelled",
                        None,
                        "cancelled",
                        &format!(
                            "not_started={} in_flight={}",
                            queue.len(),
                            in_flight.len()
                        ),
                    );
                    break;
                }
                let Some(mut request) = queue.pop_front() else {
                    break;
                };
                if request.timeout.is_none() {
                    request.timeout = default_timeout;
                }
                let id = request.id.clone();
                let handle = in_flight.spawn(execute_with_retry(
                    request,
                    self.options.clone(),
                    self.abort.clone(),
                    ctx.clone(),
                ));
                pending_ids.insert(handle.id(), id);
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };
            let outcome = match joined {
                Ok((task_id, outcome)) => {
                    pending_ids.remove(&task_id);
                    outcome
                }
                Err(err) => {
                    let id = pending_ids
                        .remove(&err.id())
                        .unwrap_or_else(|| RequestId::from("unknown"));
                    tracing::error!("request task {} did not complete: {}", id, err);
                    Outcome::Failure(FailureRecord {
                        id,
                        status: 0,
                        reason: format!("request task failed: {}", err),
                    })
                }
            };
            outcome.record_into(&mut result);

            completed += 1;
            report_guarded(
                self.progress.as_ref(),
                ProgressEvent::percent(completed, total),
            );
        }

        ctx.emit(
            Level::INFO,
            "batch.complete",
            None,
            if result.cancelled { "cancelled" } else { "ok" },
            &format!(
                "successful={} failed={} not_started={}",
                result.successful.len(),
                result.failed.len(),
                total - completed
            ),
        );
        result
    }
}

async fn execute_with_retry<R>(
    request: RequestDescriptor<R>,
    options: ExecutorOptions,
    abort: Option<AbortHandle>,
    ctx: Arc<LogContext>,
) -> Outcome<R>
where
    R: Send + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match request.attempt().await {
            Ok(value) => {
                return Outcome::Success(SuccessRecord {
                    id: request.id,
                    value,
                })
            }
            Err(err) => err,
        };

        let shape = classify_error(&err);
        if !shape.is_retryable() || attempt >= options.max_retries {
            ctx.emit(
                Level::DEBUG,
                "batch.request.failed",
                Some(request.id.as_str()),
                &shape.status.to_string(),
                &shape.message,
            );
            return Outcome::Failure(FailureRecord {
                id: request.id,
                status: shape.status,
                reason: shape.message,
            });
        }

        let delay = backoff_delay(&shape, attempt, options.base_delay_ms) + jitter(options.jitter_ms);
        ctx.emit(
            Level::DEBUG,
            "batch.request.retry",
            Some(request.id.as_str()),
            &shape.status.to_string(),
            &format!(
                "attempt={} delay_ms={} reason={}",
                attempt + 1,
                delay.as_millis(),
                shape.message
            ),
        );

        match &abort {
            Some(handle) => {
                let signal = handle.signal();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = signal.cancelled() => {
                        let reason = handle.reason().unwrap_or_else(|| "aborted".to_string());
                        return Outcome::Failure(FailureRecord {
                            id: request.id,
                            status: 0,
                            reason: format!("aborted: {}", reason),
                        });
                    }
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        attempt += 1;
    }
}

// ============================================================================
// Tests
// ============================================================================
