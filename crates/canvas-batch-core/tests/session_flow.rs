use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canvas_batch_core::{
    export_failures, ChunkOptions, ExecutorOptions, ExportFormat, OperationKey, PathScope,
    ProgressEvent, RequestDescriptor, RequestError, SessionHost, WorkItem,
};

fn quick_options(max_concurrent: usize) -> ExecutorOptions {
    ExecutorOptions {
        max_concurrent,
        base_delay_ms: 1,
        jitter_ms: 1,
        max_retries: 2,
        request_timeout_ms: None,
    }
}

#[tokio::test]
async fn stale_cancel_flag_does_not_leak_into_new_run() {
    let host = SessionHost::new();
    let key = OperationKey::new("win-1", "fetch_courses");
    host.registry().set_flag(&key, true);

    let op = host.begin_operation("win-1", "fetch_courses");
    let requests = (1..=12u64)
        .map(|i| RequestDescriptor::new(i, move || async move { Ok::<_, RequestError>(i) }))
        .collect();
    let result = op.executor(quick_options(4)).run(requests).await;

    assert!(!result.cancelled);
    assert_eq!(result.successful.len(), 12);
    drop(op);
    assert!(!host.registry().get_flag(&key));
    assert_eq!(host.registry().flag_count(), 0);
}

#[tokio::test]
async fn cancel_from_another_task_stops_admission() {
    let host = SessionHost::new();
    let op = host.begin_operation("win-1", "delete_conversations");
    let started = Arc::new(AtomicUsize::new(0));

    let requests = (1..=50u64)
        .map(|i| {
            let started = started.clone();
            RequestDescriptor::new(i, move || {
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, RequestError>(())
                }
            })
        })
        .collect();

    let canceller = {
        let host = host.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            host.cancel_operation("win-1", "delete_conversations")
        })
    };

    let result = op.executor(quick_options(2)).run(requests).await;
    assert!(canceller.await.unwrap());
    assert!(result.cancelled);
    assert!(result.successful.len() < 50);
    assert_eq!(result.successful.len(), started.load(Ordering::SeqCst));
    assert!(result.failed.is_empty());
}

#[tokio::test]
async fn progress_reaches_bus_subscribers() {
    let host = SessionHost::new();
    let mut rx = host.progress().subscribe();
    let op = host.begin_operation("win-3", "create_assignments");

    let result = op
        .chunked(ChunkOptions {
            chunk_size: 2,
            delay_ms: 1,
            label: "Creating assignments".to_string(),
        })
        .run(WorkItem::sequence(["hw1", "hw2", "hw3"]), |name| async move {
            if name == "hw2" {
                Err(RequestError::http(400, "name is too long"))
            } else {
                Ok(name.len())
            }
        })
        .await;

    assert_eq!(result.successful.len(), 2);
    assert_eq!(result.failed[0].status, 400);

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    match last {
        Some(ProgressEvent::Determinate(d)) => {
            assert_eq!(d.label, "Creating assignments");
            assert_eq!((d.processed, d.total), (3, 3));
        }
        other => panic!("unexpected last event {:?}", other),
    }
}

#[tokio::test]
async fn failures_export_only_to_picked_paths() {
    let host = SessionHost::new();
    let dir = tempfile::tempdir().unwrap();
    let picked = dir.path().join("failed.csv");
    host.gate().remember(PathScope::Write, "win-1", &picked);

    let op = host.begin_operation("win-1", "fetch_courses");
    let requests = vec![
        RequestDescriptor::new(1u64, || async { Ok::<_, RequestError>(()) }),
        RequestDescriptor::new(2u64, || async {
            Err::<(), _>(RequestError::http(401, "Invalid access token."))
        }),
    ];
    let result = op.executor(quick_options(2)).run(requests).await;
    assert_eq!(result.failed.len(), 1);

    let written = export_failures(host.gate(), "win-1", &picked, &result.failed, ExportFormat::Csv)
        .await
        .unwrap();
    let text = std::fs::read_to_string(written).unwrap();
    assert_eq!(text, "id,status,reason\n2,401,Invalid access token.\n");

    let elsewhere = dir.path().join("elsewhere.csv");
    assert!(export_failures(host.gate(), "win-1", &elsewhere, &result.failed, ExportFormat::Csv)
        .await
        .is_err());

    host.close_session("win-1");
    assert!(export_failures(host.gate(), "win-1", &picked, &result.failed, ExportFormat::Csv)
        .await
        .is_err());
}
