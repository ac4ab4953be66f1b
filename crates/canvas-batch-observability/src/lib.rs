//! Structured logging for canvas-batch processes.
//!
//! Every process logs to stderr and to a daily-rotated JSON-lines file. Batch
//! lifecycle milestones go through [`emit_event`] so they share one target and
//! one field set regardless of which component raised them.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target of structured observability events.
pub const OBS_TARGET: &str = "canvas_batch.obs";

const LOG_FILE_SUFFIX: &str = "jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// The `canvas-batch-engine` command line process.
    Cli,
    /// A host application embedding the engine as a library.
    Host,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Cli => "cli",
            ProcessKind::Host => "host",
        }
    }

    /// Rolling file prefix, e.g. `canvas-batch.cli`.
    pub fn file_prefix(self) -> String {
        format!("canvas-batch.{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: ProcessKind,
    pub logs_dir: PathBuf,
    pub file_prefix: String,
    pub retention_days: u64,
    pub expired_files_removed: usize,
    pub started_at: DateTime<Utc>,
}

/// Fields of one observability event. Unset fields are logged as empty strings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub session_id: Option<&'a str>,
    pub operation: Option<&'a str>,
    pub batch_id: Option<&'a str>,
    pub request_id: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

macro_rules! obs_event {
    ($log:ident, $process:expr, $e:expr) => {
        tracing::$log!(
            target: OBS_TARGET,
            process = $process.as_str(),
            component = $e.component,
            event = $e.event,
            session_id = $e.session_id.unwrap_or(""),
            operation = $e.operation.unwrap_or(""),
            batch_id = $e.batch_id.unwrap_or(""),
            request_id = $e.request_id.unwrap_or(""),
            status = $e.status.unwrap_or(""),
            error_code = $e.error_code.unwrap_or(""),
            detail = $e.detail.unwrap_or(""),
            "observability_event"
        )
    };
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => obs_event!(error, process, event),
        Level::WARN => obs_event!(warn, process, event),
        Level::DEBUG | Level::TRACE => obs_event!(debug, process, event),
        _ => obs_event!(info, process, event),
    }
}

/// Replaces a secret with its length and a short fingerprint.
pub fn redact_text(input: &str) -> String {
    let secret = input.trim();
    if secret.is_empty() {
        return String::new();
    }
    format!("[redacted len={} hash={}]", secret.len(), short_hash(secret))
}

/// Header value safe for logs: credentials are redacted, other values pass through.
pub fn redact_header(name: &str, value: &str) -> String {
    const SENSITIVE: [&str; 4] = ["authorization", "cookie", "proxy-authorization", "x-api-key"];
    if SENSITIVE.contains(&name.trim().to_ascii_lowercase().as_str()) {
        redact_text(value)
    } else {
        value.to_string()
    }
}

pub fn short_hash(input: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Installs the global subscriber: `RUST_LOG`-style filter (default `info`),
/// compact stderr output and a daily JSONL file under `logs_dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process. Installing twice is not an error, the second call
/// only prepares the directory.
pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let expired_files_removed = cleanup_old_jsonl(logs_dir, process, retention_days)?;

    let file_prefix = process.file_prefix();
    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_prefix.clone())
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(logs_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true);
    let jsonl_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(jsonl_layer)
        .try_init();

    Ok((
        guard,
        LoggingInitInfo {
            process,
            logs_dir: logs_dir.to_path_buf(),
            file_prefix,
            retention_days,
            expired_files_removed,
            started_at: Utc::now(),
        },
    ))
}

/// Date stamped into a rolled file name `<prefix>.YYYY-MM-DD.jsonl`.
fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(LOG_FILE_SUFFIX)?
        .strip_suffix('.')?;
    NaiveDate::parse_from_str(stamp, "%Y-%m-%d").ok()
}

/// Removes this process's log files older than `retention_days`. Returns how many went.
fn cleanup_old_jsonl(
    logs_dir: &Path,
    process: ProcessKind,
    retention_days: u64,
) -> anyhow::Result<usize> {
    // A window reaching before the representable calendar keeps everything.
    let Some(cutoff) = i64::try_from(retention_days)
        .ok()
        .and_then(chrono::Duration::try_days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .map(|at| at.date_naive())
    else {
        return Ok(0);
    };
    let prefix = process.file_prefix();

    let expired: Vec<PathBuf> = fs::read_dir(logs_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| log_file_date(n, &prefix))
                .is_some_and(|date| date < cutoff)
        })
        .collect();

    let mut removed = 0;
    for path in expired {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// `<state_dir>/logs`.
pub fn logs_dir_for(state_dir: &Path) -> PathBuf {
    state_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_text_masks_content() {
        let redacted = redact_text("Bearer 7~abcdefghijklmnop");
        assert!(redacted.starts_with("[redacted len=25 hash="));
        assert!(!redacted.contains("abcdefghijklmnop"));
        assert_eq!(redact_text("   "), "");
    }

    #[test]
    fn only_credential_headers_are_redacted() {
        assert!(redact_header("Authorization", "Bearer abc").starts_with("[redacted"));
        assert_eq!(redact_header("Accept", "application/json"), "application/json");
    }

    #[test]
    fn file_dates_parse_only_for_matching_prefix() {
        let date = log_file_date("canvas-batch.cli.2026-03-04.jsonl", "canvas-batch.cli");
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 3, 4));
        assert_eq!(log_file_date("canvas-batch.host.2026-03-04.jsonl", "canvas-batch.cli"), None);
        assert_eq!(log_file_date("canvas-batch.cli.latest.jsonl", "canvas-batch.cli"), None);
    }

    #[test]
    fn cleanup_removes_only_expired_files_for_process() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("canvas-batch.cli.2001-01-01.jsonl");
        let fresh = dir
            .path()
            .join(format!("canvas-batch.cli.{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let other = dir.path().join("canvas-batch.host.2001-01-01.jsonl");
        for path in [&old, &fresh, &other] {
            fs::write(path, b"{}\n").unwrap();
        }

        let removed = cleanup_old_jsonl(dir.path(), ProcessKind::Cli, 14).unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[test]
    fn huge_retention_keeps_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("canvas-batch.cli.2001-01-01.jsonl");
        fs::write(&old, b"{}\n").unwrap();

        for days in [u64::MAX / 2, u64::MAX, 10_000_000_000] {
            assert_eq!(cleanup_old_jsonl(dir.path(), ProcessKind::Cli, days).unwrap(), 0);
        }
        assert!(old.exists());
    }

    #[test]
    fn logs_live_under_state_dir() {
        assert_eq!(
            logs_dir_for(Path::new("/var/lib/canvas-batch")),
            PathBuf::from("/var/lib/canvas-batch/logs")
        );
    }
}
