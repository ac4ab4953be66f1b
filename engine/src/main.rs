use std::path::{Path, PathBuf};

use anyhow::Context;
use canvas_batch_core::{
    export_failures, preview_failures, validate_url, ConfigStore, EngineConfig, ExportFormat,
    PathScope, ProgressEvent, RequestDescriptor, SessionHost, WorkItem,
};
use canvas_batch_http::{HttpBatchClient, HttpRequestSpec};
use canvas_batch_observability::{
    emit_event, init_process_logging, logs_dir_for, redact_header, ObservabilityEvent,
    ProcessKind,
};
use canvas_batch_types::{BatchResult, RequestId};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tracing::info;
use uuid::Uuid;

const RUN_OPERATION: &str = "run";
const PREVIEW_LIMIT: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "canvas-batch-engine")]
#[command(about = "Runs rate-limited batches of Canvas API requests")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Bounded concurrency with retry and backoff.
    RateLimited,
    /// Fixed-size chunks with a pause between them, no retries.
    Chunked,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every request in a JSON request file.
    Run {
        #[arg(long)]
        requests: PathBuf,
        #[arg(long, env = "CANVAS_BATCH_BASE_URL")]
        base_url: String,
        /// Extra header as `Name: value`; repeatable.
        #[arg(long = "header")]
        headers: Vec<String>,
        #[arg(long, env = "CANVAS_BATCH_TOKEN", hide_env_values = true)]
        token: Option<String>,
        #[arg(long, value_enum, default_value_t = Mode::RateLimited)]
        mode: Mode,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_delay_ms: Option<u64>,
        #[arg(long)]
        export_failures: Option<PathBuf>,
        #[arg(long, default_value = "csv")]
        export_format: ExportFormat,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Show each layer instead of the merged result.
        #[arg(long, default_value_t = false)]
        layers: bool,
    },
    /// Check a URL against the scheme gate.
    CheckUrl { url: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            requests,
            base_url,
            headers,
            token,
            mode,
            config,
            max_concurrent,
            max_retries,
            chunk_size,
            chunk_delay_ms,
            export_failures,
            export_format,
            state_dir,
        } => {
            let overrides =
                build_cli_overrides(max_concurrent, max_retries, chunk_size, chunk_delay_ms);
            let store = ConfigStore::new(config.as_deref(), overrides).await?;
            let engine_config = store.get().await?;

            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = engine_config
                .logging
                .logs_dir
                .clone()
                .unwrap_or_else(|| logs_dir_for(&state_dir));
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Cli,
                &logs_dir,
                engine_config.logging.retention_days,
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Cli,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("cli jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let specs = load_requests(&requests)?;
            let mut header_pairs = headers
                .iter()
                .map(|raw| parse_header(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
                header_pairs.push(("Authorization".to_string(), format!("Bearer {}", token.trim())));
            }
            for (name, value) in &header_pairs {
                tracing::debug!("default header {}: {}", name, redact_header(name, value));
            }

            let options = RunOptions {
                base_url,
                headers: header_pairs,
                mode,
                export: export_failures.map(|path| (path, export_format)),
            };
            run_batch(&engine_config, specs, options).await?;
        }
        Command::Config { config, layers } => {
            let store = ConfigStore::new(config.as_deref(), None).await?;
            let value = if layers {
                store.get_layers_value().await
            } else {
                store.get().await?;
                store.get_effective_value().await
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::CheckUrl { url } => {
            let normalized = validate_url(&url)?;
            println!("{normalized}");
        }
    }

    Ok(())
}

struct RunOptions {
    base_url: String,
    headers: Vec<(String, String)>,
    mode: Mode,
    export: Option<(PathBuf, ExportFormat)>,
}

async fn run_batch(
    config: &EngineConfig,
    specs: Vec<HttpRequestSpec>,
    options: RunOptions,
) -> anyhow::Result<()> {
    let host = SessionHost::new();
    let session_id = Uuid::new_v4().to_string();
    if let Some((path, _)) = &options.export {
        // A path named on the command line counts as picked by the user.
        host.gate().remember(PathScope::Write, &session_id, path);
    }

    let (progress_done, progress_done_rx) = oneshot::channel();
    let progress_task = tokio::spawn(log_progress(host.progress().subscribe(), progress_done_rx));
    let operation = host.begin_operation(&session_id, RUN_OPERATION);

    let cancel_task = {
        let host = host.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; finishing in-flight requests");
                host.cancel_operation(&session_id, RUN_OPERATION);
            }
        })
    };

    let client = HttpBatchClient::new(&options.base_url, options.headers.clone())?
        .with_abort_token(operation.abort_handle().signal());
    let descriptors = client.descriptors(specs)?;
    let expected: Vec<RequestId> = descriptors.iter().map(|d| d.id.clone()).collect();

    info!(
        "session {} running {} requests ({:?})",
        session_id,
        descriptors.len(),
        options.mode
    );
    let result: BatchResult<Value> = match options.mode {
        Mode::RateLimited => {
            operation
                .executor(config.executor.clone())
                .run(descriptors)
                .await
        }
        Mode::Chunked => {
            let items = descriptors
                .into_iter()
                .map(|d| WorkItem::new(d.id.clone(), d))
                .collect();
            operation
                .chunked(config.chunked.clone())
                .run(items, |descriptor: RequestDescriptor<Value>| async move {
                    descriptor.attempt().await
                })
                .await
        }
    };

    cancel_task.abort();
    drop(operation);
    let _ = progress_done.send(());
    if let Err(err) = progress_task.await {
        tracing::debug!("progress logger ended abnormally: {}", err);
    }

    let reconciliation = result.reconcile(expected);
    let preview = preview_failures(&result.failed, PREVIEW_LIMIT);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "session_id": session_id,
            "summary": result.summary(),
            "unaccounted": reconciliation.unaccounted,
            "failures": preview.lines,
            "more_failures": preview.remaining,
        }))?
    );

    if let Some((path, format)) = &options.export {
        if result.failed.is_empty() {
            info!("no failures to export");
        } else {
            let written =
                export_failures(host.gate(), &session_id, path, &result.failed, *format).await?;
            eprintln!("failures written to {}", written.display());
        }
    }

    host.close_session(&session_id);
    Ok(())
}

/// Logs progress until `done` fires, then drains whatever is still queued.
/// Returns the last percentage logged.
async fn log_progress(
    mut rx: broadcast::Receiver<ProgressEvent>,
    mut done: oneshot::Receiver<()>,
) -> Option<u8> {
    let mut last_percent = None;
    loop {
        tokio::select! {
            biased;
            received = rx.recv() => match received {
                Ok(event) => log_progress_event(event, &mut last_percent),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("progress logger skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return last_percent,
            },
            _ = &mut done => break,
        }
    }
    loop {
        match rx.try_recv() {
            Ok(event) => log_progress_event(event, &mut last_percent),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::debug!("progress logger skipped {} events", skipped);
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    last_percent
}

fn log_progress_event(event: ProgressEvent, last_percent: &mut Option<u8>) {
    let percent = event.as_percent();
    if *last_percent == Some(percent) {
        return;
    }
    *last_percent = Some(percent);
    match event {
        ProgressEvent::Determinate(d) => {
            info!("{}: {}/{} ({}%)", d.label, d.processed, d.total, percent)
        }
        ProgressEvent::Percent(_) => info!("progress: {}%", percent),
    }
}

fn build_cli_overrides(
    max_concurrent: Option<usize>,
    max_retries: Option<u32>,
    chunk_size: Option<usize>,
    chunk_delay_ms: Option<u64>,
) -> Option<Value> {
    if max_concurrent.is_none()
        && max_retries.is_none()
        && chunk_size.is_none()
        && chunk_delay_ms.is_none()
    {
        return None;
    }
    Some(json!({
        "executor": {
            "max_concurrent": max_concurrent,
            "max_retries": max_retries,
        },
        "chunked": {
            "chunk_size": chunk_size,
            "delay_ms": chunk_delay_ms,
        }
    }))
}

fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("header `{}` must look like `Name: value`", raw))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("header `{}` has an empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Accepts either a bare array of requests or `{"requests": [...]}`.
fn load_requests(path: &Path) -> anyhow::Result<Vec<HttpRequestSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading request file {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing request file {}", path.display()))?;
    let list = match value {
        Value::Object(mut map) => map
            .remove("requests")
            .context("request file object has no `requests` array")?,
        other => other,
    };
    serde_json::from_value(list).context("request entries are malformed")
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("CANVAS_BATCH_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".canvas-batch")
}
