// Failure export and preview

use std::path::{Path, PathBuf};

use canvas_batch_types::FailureRecord;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::security::{PathGate, PathScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Jsonl,
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

/// Writes every failure to `path`, which must be in the session's Write scope.
///
/// Returns the normalized path that was written.
pub async fn export_failures(
    gate: &PathGate,
    session_id: &str,
    path: impl AsRef<Path>,
    failures: &[FailureRecord],
    format: ExportFormat,
) -> Result<PathBuf> {
    let target = gate.check(PathScope::Write, session_id, path.as_ref())?;
    let body = match format {
        ExportFormat::Csv => render_csv(failures),
        ExportFormat::Jsonl => render_jsonl(failures)?,
    };
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&target).await?;
    file.write_all(body.as_bytes()).await?;
    file.flush().await?;
    tracing::info!(
        "Exported {} failures to {}",
        failures.len(),
        target.display()
    );
    Ok(target)
}

fn render_csv(failures: &[FailureRecord]) -> String {
    let mut out = String::from("id,status,reason\n");
    for failure in failures {
        out.push_str(&csv_field(failure.id.as_str()));
        out.push(',');
        out.push_str(&failure.status.to_string());
        out.push(',');
        out.push_str(&csv_field(&failure.reason));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_jsonl(failures: &[FailureRecord]) -> Result<String> {
    let mut out = String::new();
    for failure in failures {
        out.push_str(&serde_json::to_string(failure)?);
        out.push('\n');
    }
    Ok(out)
}

/// Display-ready slice of a failure list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailurePreview {
    pub lines: Vec<String>,
    pub remaining: usize,
}

pub fn preview_failures(failures: &[FailureRecord], limit: usize) -> FailurePreview {
    let lines = failures
        .iter()
        .take(limit)
        .map(|f| {
            if f.status == 0 {
                format!("{}: {}", f.id, f.reason)
            } else {
                format!("{} (HTTP {}): {}", f.id, f.status, f.reason)
            }
        })
        .collect::<Vec<_>>();
    FailurePreview {
        remaining: failures.len().saturating_sub(lines.len()),
        lines,
    }
}
