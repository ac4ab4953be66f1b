// Fixed-window batch loop
// Sequential chunks, concurrent items inside a chunk, fixed cool-down between chunks.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use canvas_batch_observability::{emit_event, ObservabilityEvent, ProcessKind};
use canvas_batch_types::{BatchResult, FailureRecord, ProgressEvent, RequestError, RequestId, SuccessRecord};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::cancellation::OperationKey;
use crate::classify::classify_error;
use crate::executor::Outcome;
use crate::progress::{report_guarded, NoopProgress, ProgressSink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkOptions {
    /// Items per chunk; 0 is treated as 1.
    pub chunk_size: usize,
    /// Pause between consecutive chunks.
    pub delay_ms: u64,
    /// Label carried by determinate progress events.
    pub label: String,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 10,
            delay_ms: 1000,
            label: "Processing".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem<T> {
    pub id: RequestId,
    pub payload: T,
}

impl<T> WorkItem<T> {
    pub fn new(id: impl Into<RequestId>, payload: T) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }

    /// Wraps `items` with 1-based sequence ids.
    pub fn sequence(items: impl IntoIterator<Item = T>) -> Vec<Self> {
        items
            .into_iter()
            .enumerate()
            .map(|(idx, payload)| Self::new(idx + 1, payload))
            .collect()
    }
}

/// Runs work in fixed-size chunks with a mandatory delay between them.
///
/// Meant for destructive bulk operations: nothing is retried, and the
/// request cadence is set by `chunk_size` / `delay_ms` rather than by
/// server feedback.
pub struct ChunkedRunner {
    options: ChunkOptions,
    progress: Arc<dyn ProgressSink>,
    cancel_check: Arc<dyn Fn() -> bool + Send + Sync>,
    operation: Option<OperationKey>,
}

impl ChunkedRunner {
    pub fn new(options: ChunkOptions) -> Self {
        Self {
            options,
            progress: Arc::new(NoopProgress),
            cancel_check: Arc::new(|| false),
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

    /// Checked at every chunk boundary.
    pub fn with_cancel_check<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.cancel_check = Arc::new(check);
        self
    }

    pub fn with_operation(mut self, key: OperationKey) -> Self {
        self.operation = Some(key);
        self
    }

    pub async fn run<T, R, F, Fut>(&self, items: Vec<WorkItem<T>>, per_item: F) -> BatchResult<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, RequestError>>,
    {
        let total = items.len();
        let chunk_size = self.options.chunk_size.max(1);
        let delay = Duration::from_millis(self.options.delay_ms);
        let mut result = BatchResult::empty();
        let mut processed = 0usize;
        let mut chunks_run = 0usize;

        self.emit(
            Level::INFO,
            "chunked.start",
            "start",
            &format!(
                "total={} chunk_size={} delay_ms={}",
                total, chunk_size, self.options.delay_ms
            ),
        );

        let mut remaining = items.into_iter().peekable();
        while remaining.peek().is_some() {
            if (self.cancel_check)() {
                result.cancelled = true;
                break;
            }

            let mut pending: FuturesUnordered<_> = remaining
                .by_ref()
                .take(chunk_size)
                .map(|item| {
                    let started = catch_unwind(AssertUnwindSafe(|| per_item(item.payload)));
                    settle(item.id, started)
                })
                .collect();

            while let Some(outcome) = pending.next().await {
                outcome.record_into(&mut result);
                processed += 1;
                report_guarded(
                    self.progress.as_ref(),
                    ProgressEvent::determinate(&self.options.label, processed, total),
                );
            }
            chunks_run += 1;

            if remaining.peek().is_some() && !(self.cancel_check)() {
                tokio::time::sleep(delay).await;
            }
        }

        self.emit(
            Level::INFO,
            "chunked.complete",
            if result.cancelled { "cancelled" } else { "ok" },
            &format!(
                "chunks={} successful={} failed={} not_started={}",
                chunks_run,
                result.successful.len(),
                result.failed.len(),
                total - processed
            ),
        );
        result
    }

    fn emit(&self, level: Level, event: &str, status: &str, detail: &str) {
        emit_event(
            level,
            ProcessKind::Host,
            ObservabilityEvent {
                event,
                component: "core.chunked",
                session_id: self.operation.as_ref().map(|k| k.session_id.as_str()),
                operation: self.operation.as_ref().map(|k| k.operation.as_str()),
                status: Some(status),
                detail: Some(detail),
                ..ObservabilityEvent::default()
            },
        );
    }
}

async fn settle<R, Fut>(
    id: RequestId,
    started: std::thread::Result<Fut>,
) -> Outcome<R>
where
    Fut: Future<Output = Result<R, RequestError>>,
{
    let settled = match started {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(panic) => Err(panic),
    };
    match settled {
        Ok(Ok(value)) => Outcome::Success(SuccessRecord { id, value }),
        Ok(Err(err)) => {
            let shape = classify_error(&err);
            Outcome::Failure(FailureRecord {
                id,
                status: shape.status,
                reason: shape.message,
            })
        }
        Err(_) => Outcome::Failure(FailureRecord {
            id,
            status: 0,
            reason: "item panicked".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationRegistry;
    use canvas_batch_types::DeterminateProgress;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn options(chunk_size: usize, delay_ms: u64) -> ChunkOptions {
        ChunkOptions {
            chunk_size,
            delay_ms,
            label: "Deleting conversations".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_run_in_order_with_delay_between() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let completions = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let completions = completions.clone();
            move |e: ProgressEvent| {
                if let ProgressEvent::Determinate(d) = e {
                    completions.lock().unwrap().push((d.processed, Instant::now()));
                }
            }
        };

        let begin = Instant::now();
        let result = ChunkedRunner::new(options(2, 100))
            .with_progress(sink)
            .run(WorkItem::sequence(vec!["a", "b", "c", "d", "e"]), |name| {
                let starts = starts.clone();
                async move {
                    starts.lock().unwrap().push((name, Instant::now()));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(name.to_uppercase())
                }
            })
            .await;
        let elapsed = begin.elapsed();

        assert_eq!(result.successful.len(), 5);
        assert!(!result.cancelled);

        let starts = starts.lock().unwrap();
        let mut chunk_sizes: Vec<usize> = Vec::new();
        let mut last_start: Option<Instant> = None;
        for (_, at) in starts.iter() {
            match last_start {
                Some(prev) if prev == *at => *chunk_sizes.last_mut().unwrap() += 1,
                _ => chunk_sizes.push(1),
            }
            last_start = Some(*at);
        }
        assert_eq!(chunk_sizes, vec![2, 2, 1]);

        let completions = completions.lock().unwrap();
        let chunk_ends: Vec<Instant> = completions
            .iter()
            .filter(|(processed, _)| [2, 4, 5].contains(processed))
            .map(|(_, at)| *at)
            .collect();
        assert!(chunk_ends[1] - chunk_ends[0] >= Duration::from_millis(100));
        assert!(chunk_ends[2] - chunk_ends[1] >= Duration::from_millis(100));
        // No trailing delay after the last chunk.
        assert!(elapsed < Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_reports_every_item() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            move |e: ProgressEvent| events.lock().unwrap().push(e)
        };

        ChunkedRunner::new(options(3, 50))
            .with_progress(sink)
            .run(WorkItem::sequence(1..=4), |n: u32| async move { Ok(n) })
            .await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 4);
        match &events[3] {
            ProgressEvent::Determinate(DeterminateProgress {
                label,
                processed,
                total,
                value,
                ..
            }) => {
                assert_eq!(label, "Deleting conversations");
                assert_eq!((*processed, *total), (4, 4));
                assert!((value - 1.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_settle_alongside_successes() {
        let result = ChunkedRunner::new(options(4, 10))
            .run(
                vec![
                    WorkItem::new("c-101", 101u64),
                    WorkItem::new("c-102", 102),
                    WorkItem::new("c-103", 103),
                ],
                |conversation| async move {
                    match conversation {
                        102 => Err(RequestError::http(404, "conversation not found")),
                        103 => Err(RequestError::http(500, "Internal Server Error")),
                        other => Ok(other),
                    }
                },
            )
            .await;

        assert_eq!(result.successful.len(), 1);
        assert_eq!(result.failed.len(), 2);
        let mut failed = result.failed.clone();
        failed.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(failed[0].id.as_str(), "c-102");
        assert_eq!(failed[0].status, 404);
        assert_eq!(failed[0].reason, "conversation not found");
        // No retries, even for retryable statuses.
        assert_eq!(failed[1].status, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_at_chunk_boundary() {
        let registry = CancellationRegistry::new();
        let key = OperationKey::new("win-2", "delete_conversations");
        let guard = registry.begin(key.clone());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let begin = Instant::now();
        let result = ChunkedRunner::new(options(2, 5_000))
            .with_cancel_check(guard.cancel_check())
            .run(WorkItem::sequence(1..=6), |n: u32| {
                let calls = calls.clone();
                let registry = registry.clone();
                let key = key.clone();
                async move {
                    calls.lock().unwrap().push(n);
                    if n == 1 {
                        registry.set_flag(&key, true);
                    }
                    Ok(n)
                }
            })
            .await;

        assert!(result.cancelled);
        assert_eq!(result.successful.len(), 2);
        assert_eq!(calls.lock().unwrap().len(), 2);
        // Cancelled runs skip the inter-chunk delay.
        assert!(begin.elapsed() < Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn empty_input_does_nothing() {
        let result = ChunkedRunner::new(ChunkOptions::default())
            .run(Vec::<WorkItem<()>>::new(), |_| async { Ok(()) })
            .await;
        assert_eq!(result.total(), 0);
        assert!(!result.cancelled);
    }

    #[test]
    fn sequence_assigns_one_based_ids() {
        let items = WorkItem::sequence(["x", "y"]);
        assert_eq!(items[0].id, RequestId::from(1usize));
        assert_eq!(items[1].id, RequestId::from(2usize));
        assert_eq!(items[1].payload, "y");
    }
}
