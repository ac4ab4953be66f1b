// Path allowlists and URL scheme gating

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use canvas_batch_observability::{emit_event, ObservabilityEvent, ProcessKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::Level;
use url::Url;

use crate::error::{BatchError, Result};

/// Entries kept per `(scope, session)` before trimming.
pub const MAX_REMEMBERED_PATHS: usize = 100;
/// Entries left after a trim (most recent first to survive).
pub const TRIMMED_REMEMBERED_PATHS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathScope {
    Read,
    Write,
    Directory,
}

impl PathScope {
    pub const ALL: [PathScope; 3] = [PathScope::Read, PathScope::Write, PathScope::Directory];

    pub fn as_str(&self) -> &'static str {
        match self {
            PathScope::Read => "read",
            PathScope::Write => "write",
            PathScope::Directory => "directory",
        }
    }
}

/// Per-session allowlist of paths the user picked through a trusted dialog.
///
/// Only paths passed to [`PathGate::remember`] are allowed; everything else,
/// including any path for a session that never remembered one, is denied.
#[derive(Clone, Default)]
pub struct PathGate {
    entries: Arc<RwLock<HashMap<(PathScope, String), Vec<PathBuf>>>>,
}

impl PathGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, scope: PathScope, session_id: &str, path: impl AsRef<Path>) {
        let normalized = normalize_path(path.as_ref());
        let mut entries = self.entries.write();
        let list = entries
            .entry((scope, session_id.to_string()))
            .or_default();
        list.retain(|existing| existing != &normalized);
        list.push(normalized);
        if list.len() > MAX_REMEMBERED_PATHS {
            let excess = list.len() - TRIMMED_REMEMBERED_PATHS;
            list.drain(..excess);
        }
    }

    pub fn is_allowed(&self, scope: PathScope, session_id: &str, path: impl AsRef<Path>) -> bool {
        let normalized = normalize_path(path.as_ref());
        self.entries
            .read()
            .get(&(scope, session_id.to_string()))
            .map(|list| list.contains(&normalized))
            .unwrap_or(false)
    }

    /// Like [`PathGate::is_allowed`], but logs the denial and returns an error.
    pub fn check(&self, scope: PathScope, session_id: &str, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        if self.is_allowed(scope, session_id, path) {
            return Ok(normalize_path(path));
        }
        let shown = path.display().to_string();
        emit_event(
            Level::WARN,
            ProcessKind::Host,
            ObservabilityEvent {
                event: "security.path.denied",
                component: "core.security",
                session_id: Some(session_id),
                status: Some("denied"),
                error_code: Some(scope.as_str()),
                detail: Some(&shown),
                ..ObservabilityEvent::default()
            },
        );
        Err(BatchError::PathNotAllowed(shown))
    }

    /// Drops every scope held by `session_id`. Returns the number of paths forgotten.
    pub fn release_scope(&self, session_id: &str) -> usize {
        let mut entries = self.entries.write();
        PathScope::ALL
            .iter()
            .filter_map(|scope| entries.remove(&(*scope, session_id.to_string())))
            .map(|list| list.len())
            .sum()
    }

    pub fn remembered(&self, scope: PathScope, session_id: &str) -> Vec<PathBuf> {
        self.entries
            .read()
            .get(&(scope, session_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

/// Absolute, lexically resolved form of `path`, canonicalized when it exists.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let resolved = resolve_dots(&absolute);
    let resolved = std::fs::canonicalize(&resolved).unwrap_or(resolved);
    normalize_for_compare(resolved)
}

fn resolve_dots(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn normalize_for_compare(path: PathBuf) -> PathBuf {
    #[cfg(windows)]
    {
        // canonicalize() hands back verbatim (\\?\) paths; dialogs do not.
        let mut text = path.to_string_lossy().replace('/', "\\");
        if let Some(rest) = text.strip_prefix(r"\\?\UNC\") {
            text = format!(r"\\{}", rest);
        } else if let Some(rest) = text.strip_prefix(r"\\?\") {
            text = rest.to_string();
        }
        PathBuf::from(text.to_ascii_lowercase())
    }

    #[cfg(not(windows))]
    {
        path
    }
}

/// Accepts only `http` and `https` URLs and returns their normalized form.
pub fn validate_url(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw.trim()).map_err(|err| {
        deny_url("invalid", raw);
        BatchError::InvalidUrl(format!("{}: {}", raw, err))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => {
            let protocol = format!("{}:", other);
            deny_url(&protocol, raw);
            Err(BatchError::ProtocolNotAllowed(protocol))
        }
    }
}

fn deny_url(code: &str, raw: &str) {
    let shown: String = raw.chars().take(200).collect();
    emit_event(
        Level::WARN,
        ProcessKind::Host,
        ObservabilityEvent {
            event: "security.url.denied",
            component: "core.security",
            status: Some("denied"),
            error_code: Some(code),
            detail: Some(&shown),
            ..ObservabilityEvent::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_is_denied() {
        let gate = PathGate::new();
        gate.remember(PathScope::Read, "win-1", "/tmp/roster.csv");
        assert!(gate.is_allowed(PathScope::Read, "win-1", "/tmp/roster.csv"));
        assert!(!gate.is_allowed(PathScope::Read, "win-2", "/tmp/roster.csv"));
        assert!(!gate.is_allowed(PathScope::Read, "win-1", "/tmp/other.csv"));
    }

    #[test]
    fn scopes_are_independent() {
        let gate = PathGate::new();
        gate.remember(PathScope::Read, "win-1", "/tmp/report.csv");
        assert!(!gate.is_allowed(PathScope::Write, "win-1", "/tmp/report.csv"));
        assert!(!gate.is_allowed(PathScope::Directory, "win-1", "/tmp/report.csv"));
        assert!(matches!(
            gate.check(PathScope::Write, "win-1", "/tmp/report.csv"),
            Err(BatchError::PathNotAllowed(_))
        ));
    }

    #[test]
    fn dot_segments_resolve_before_comparison() {
        let gate = PathGate::new();
        gate.remember(PathScope::Write, "win-1", "/var/exports/out.csv");
        assert!(gate.is_allowed(PathScope::Write, "win-1", "/var/exports/./nested/../out.csv"));
    }

    #[test]
    fn overflow_keeps_most_recent_fifty() {
        let gate = PathGate::new();
        for i in 0..=MAX_REMEMBERED_PATHS {
            gate.remember(PathScope::Read, "win-1", format!("/data/file-{}.csv", i));
        }
        let kept = gate.remembered(PathScope::Read, "win-1");
        assert_eq!(kept.len(), TRIMMED_REMEMBERED_PATHS);
        assert!(!gate.is_allowed(PathScope::Read, "win-1", "/data/file-0.csv"));
        assert!(!gate.is_allowed(PathScope::Read, "win-1", "/data/file-50.csv"));
        assert!(gate.is_allowed(PathScope::Read, "win-1", "/data/file-51.csv"));
        assert!(gate.is_allowed(PathScope::Read, "win-1", "/data/file-100.csv"));
    }

    #[test]
    fn remembering_again_refreshes_recency() {
        let gate = PathGate::new();
        gate.remember(PathScope::Read, "win-1", "/data/keep.csv");
        for i in 0..MAX_REMEMBERED_PATHS - 1 {
            gate.remember(PathScope::Read, "win-1", format!("/data/f-{}.csv", i));
        }
        gate.remember(PathScope::Read, "win-1", "/data/keep.csv");
        gate.remember(PathScope::Read, "win-1", "/data/trigger.csv");
        assert!(gate.is_allowed(PathScope::Read, "win-1", "/data/keep.csv"));
    }

    #[test]
    fn release_scope_clears_every_scope() {
        let gate = PathGate::new();
        gate.remember(PathScope::Read, "win-1", "/a.csv");
        gate.remember(PathScope::Write, "win-1", "/b.csv");
        gate.remember(PathScope::Directory, "win-1", "/exports");
        gate.remember(PathScope::Read, "win-2", "/a.csv");
        assert_eq!(gate.release_scope("win-1"), 3);
        assert!(!gate.is_allowed(PathScope::Directory, "win-1", "/exports"));
        assert!(gate.is_allowed(PathScope::Read, "win-2", "/a.csv"));
    }

    #[test]
    fn canonicalizes_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("picked.csv");
        std::fs::write(&file, "id\n").unwrap();
        let gate = PathGate::new();
        gate.remember(PathScope::Read, "win-1", &file);
        let roundabout = dir.path().join("sub").join("..").join("picked.csv");
        assert!(gate.is_allowed(PathScope::Read, "win-1", roundabout));
    }

    #[test]
    fn url_gate_accepts_http_and_https() {
        assert_eq!(
            validate_url("https://canvas.example.edu/courses/1").unwrap(),
            "https://canvas.example.edu/courses/1"
        );
        assert_eq!(
            validate_url("HTTP://Canvas.Example.edu").unwrap(),
            "http://canvas.example.edu/"
        );
        assert_eq!(validate_url("http://x.com/y?z=1").unwrap(), "http://x.com/y?z=1");
    }

    #[test]
    fn url_gate_rejects_other_schemes() {
        for (raw, protocol) in [
            ("file:///etc/passwd", "file:"),
            ("javascript:alert(1)", "javascript:"),
            ("ftp://files.example.edu/x", "ftp:"),
            ("data:text/html,x", "data:"),
        ] {
            let err = validate_url(raw).unwrap_err();
            assert!(matches!(err, BatchError::ProtocolNotAllowed(ref p) if p == protocol));
            assert_eq!(err.to_string(), format!("protocol not allowed: {}", protocol));
        }
    }

    #[test]
    fn url_gate_rejects_garbage() {
        assert!(matches!(validate_url("not a url"), Err(BatchError::InvalidUrl(_))));
    }
}
