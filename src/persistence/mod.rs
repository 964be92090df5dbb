//! Durable storage for scope graphs and their ingest audit trail.
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::AtlasGraphError;
use crate::graph::builder::IngestResult;
use crate::graph::CicdGraph;

/// Storage backend for scope graphs.
pub trait GraphRepository: Send + Sync {
    /// Load the last flushed graph for `scope`, if any.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` when the stored graph cannot be read or decoded.
    fn load(&self, scope: &str) -> Result<Option<CicdGraph>, AtlasGraphError>;

    /// Replace the stored graph for `scope`.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` when the write fails.
    fn flush(&self, scope: &str, graph: &CicdGraph) -> Result<(), AtlasGraphError>;

    /// Append one batch summary to the scope's audit trail.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` when the write fails.
    fn append_audit(&self, scope: &str, result: &IngestResult) -> Result<(), AtlasGraphError>;

    /// Scopes with a stored graph, sorted.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` when the backend cannot be listed.
    fn list_scopes(&self) -> Result<Vec<String>, AtlasGraphError>;

    /// Remove a scope's graph and audit trail. Returns whether anything was removed.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` when removal fails.
    fn delete(&self, scope: &str) -> Result<bool, AtlasGraphError>;
}

/// Map a scope name to a filesystem-safe file stem.
///
/// ASCII alphanumerics, `-` and non-leading `.` are kept; every other byte becomes `_XX` (hex),
/// so distinct scopes never share a file. The empty scope maps to `_`.
#[must_use]
pub fn scope_file_stem(scope: &str) -> String {
    if scope.is_empty() {
        return "_".to_string();
    }
    let mut stem = String::with_capacity(scope.len());
    for (i, b) in scope.bytes().enumerate() {
        if b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && i > 0) {
            stem.push(char::from(b));
        } else {
            stem.push_str(&format!("_{b:02X}"));
        }
    }
    stem
}

/// Inverse of [`scope_file_stem`]; `None` for stems it could not have produced.
#[must_use]
pub fn scope_from_file_stem(stem: &str) -> Option<String> {
    if stem == "_" {
        return Some(String::new());
    }
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    let scope = String::from_utf8(out).ok()?;
    (scope_file_stem(&scope) == stem).then_some(scope)
}

const GRAPH_SUFFIX: &str = ".graph.json";
const AUDIT_SUFFIX: &str = ".audit.jsonl";

/// Stores `<scope>.graph.json` and `<scope>.audit.jsonl` in a state directory.
#[derive(Debug, Clone)]
pub struct JsonFileRepository {
    root: PathBuf,
}

impl JsonFileRepository {
    /// # Errors
    /// Returns `AtlasGraphError::Io` if the state directory cannot be created.
    pub fn new(root: &Path) -> Result<Self, AtlasGraphError> {
        fs::create_dir_all(root)?;
        Ok(Self { root: root.to_path_buf() })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn graph_path(&self, scope: &str) -> PathBuf {
        self.root.join(format!("{}{GRAPH_SUFFIX}", scope_file_stem(scope)))
    }

    #[must_use]
    pub fn audit_path(&self, scope: &str) -> PathBuf {
        self.root.join(format!("{}{AUDIT_SUFFIX}", scope_file_stem(scope)))
    }
}

impl GraphRepository for JsonFileRepository {
    fn load(&self, scope: &str) -> Result<Option<CicdGraph>, AtlasGraphError> {
        let path = self.graph_path(scope);
        if !path.exists() {
            return Ok(None);
        }
        let graph = CicdGraph::load_json(&path)?;
        debug!(scope, nodes = graph.node_count(), "graph loaded");
        Ok(Some(graph))
    }

    fn flush(&self, scope: &str, graph: &CicdGraph) -> Result<(), AtlasGraphError> {
        let path = self.graph_path(scope);
        // Write-then-rename keeps the previous file intact if the write fails
        let tmp = path.with_extension("json.tmp");
        graph.save_json(&tmp)?;
        fs::rename(&tmp, &path)?;
        debug!(scope, path = %path.display(), "graph flushed");
        Ok(())
    }

    fn append_audit(&self, scope: &str, result: &IngestResult) -> Result<(), AtlasGraphError> {
        let mut line = serde_json::to_string(result)?;
        line.push('\n');
        let mut f = OpenOptions::new().create(true).append(true).open(self.audit_path(scope))?;
        f.write_all(line.as_bytes())?;
        Ok(())
    }

    fn list_scopes(&self) -> Result<Vec<String>, AtlasGraphError> {
        let mut scopes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(GRAPH_SUFFIX) else { continue };
            match scope_from_file_stem(stem) {
                Some(scope) => scopes.push(scope),
                None => warn!(file = %name, "graph file with an unrecognized name, skipping"),
            }
        }
        scopes.sort();
        Ok(scopes)
    }

    fn delete(&self, scope: &str) -> Result<bool, AtlasGraphError> {
        let mut removed = false;
        for path in [self.graph_path(scope), self.audit_path(scope)] {
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }
        Ok(removed)
    }
}

/// In-process repository, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    graphs: RwLock<HashMap<String, CicdGraph>>,
    audits: RwLock<HashMap<String, Vec<IngestResult>>>,
    failing_flushes: AtomicU32,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` flushes fail.
    pub fn fail_next_flushes(&self, n: u32) {
        self.failing_flushes.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn audit(&self, scope: &str) -> Vec<IngestResult> {
        self.audits.read().get(scope).cloned().unwrap_or_default()
    }
}

impl GraphRepository for MemoryRepository {
    fn load(&self, scope: &str) -> Result<Option<CicdGraph>, AtlasGraphError> {
        Ok(self.graphs.read().get(scope).cloned())
    }

    fn flush(&self, scope: &str, graph: &CicdGraph) -> Result<(), AtlasGraphError> {
        let failing = self
            .failing_flushes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AtlasGraphError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected flush failure",
            )));
        }
        self.graphs.write().insert(scope.to_string(), graph.clone());
        Ok(())
    }

    fn append_audit(&self, scope: &str, result: &IngestResult) -> Result<(), AtlasGraphError> {
        self.audits.write().entry(scope.to_string()).or_default().push(result.clone());
        Ok(())
    }

    fn list_scopes(&self) -> Result<Vec<String>, AtlasGraphError> {
        let mut scopes: Vec<String> = self.graphs.read().keys().cloned().collect();
        scopes.sort();
        Ok(scopes)
    }

    fn delete(&self, scope: &str) -> Result<bool, AtlasGraphError> {
        let g = self.graphs.write().remove(scope).is_some();
        let a = self.audits.write().remove(scope).is_some();
        Ok(g || a)
    }
}

/// Exponential backoff for persistence writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// # Errors
    /// Returns `AtlasGraphError::Persistence` carrying the last failure.
    pub fn run<T, F>(&self, scope: &str, what: &str, mut op: F) -> Result<T, AtlasGraphError>
    where
        F: FnMut() -> Result<T, AtlasGraphError>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last = String::new();
        for attempt in 1..=attempts {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last = e.to_string();
                    if attempt < attempts {
                        let delay = self.delay_for(attempt);
                        warn!(scope, what, attempt, error = %e, ?delay, "persistence attempt failed, retrying");
                        std::thread::sleep(delay);
                    }
                }
            }
        }
        Err(AtlasGraphError::Persistence { scope: scope.to_string(), attempts, message: last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(300));
        assert_eq!(p.delay_for(9), Duration::from_millis(300));
    }

    #[test]
    fn retry_recovers_from_transient_failure() {
        let repo = MemoryRepository::new();
        repo.fail_next_flushes(1);
        let p = RetryPolicy { initial_backoff: Duration::ZERO, ..Default::default() };
        let g = CicdGraph::new("s");
        p.run("s", "flush", || repo.flush("s", &g)).unwrap();
        assert_eq!(repo.list_scopes().unwrap(), vec!["s".to_string()]);
    }

    #[test]
    fn retry_exhaustion_reports_attempts() {
        let repo = MemoryRepository::new();
        repo.fail_next_flushes(10);
        let p = RetryPolicy { max_attempts: 2, initial_backoff: Duration::ZERO, ..Default::default() };
        let err = p.run("s", "flush", || repo.flush("s", &CicdGraph::new("s"))).unwrap_err();
        assert!(matches!(err, AtlasGraphError::Persistence { attempts: 2, .. }));
    }

    #[test]
    fn file_repository_roundtrip_and_listing() {
        let td = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(td.path()).unwrap();
        assert!(repo.load("team/app").unwrap().is_none());
        let g = CicdGraph::new("team/app");
        repo.flush("team/app", &g).unwrap();
        assert_eq!(repo.load("team/app").unwrap(), Some(g));
        assert_eq!(repo.list_scopes().unwrap(), vec!["team/app".to_string()]);
        assert!(repo.delete("team/app").unwrap());
        assert!(!repo.delete("team/app").unwrap());
    }

    #[test]
    fn scope_stems_are_safe_and_reversible() {
        assert_eq!(scope_file_stem("a b/c"), "a_20b_2Fc");
        assert_eq!(scope_file_stem(".hidden"), "_2Ehidden");
        assert_eq!(scope_file_stem("team_app"), "team_5Fapp");
        assert_eq!(scope_file_stem(""), "_");
        for scope in ["a b/c", ".hidden", "team_app", "", "équipe/app", "v1.2"] {
            assert_eq!(scope_from_file_stem(&scope_file_stem(scope)).as_deref(), Some(scope));
        }
        assert_eq!(scope_from_file_stem("bad_zz"), None);
        assert_eq!(scope_from_file_stem("lower_2f"), None);
    }

    #[test]
    fn lookalike_scopes_keep_separate_graphs() {
        let td = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(td.path()).unwrap();
        repo.flush("team/app", &CicdGraph::new("team/app")).unwrap();
        repo.flush("team_app", &CicdGraph::new("team_app")).unwrap();
        assert_ne!(repo.graph_path("team/app"), repo.graph_path("team_app"));
        assert_eq!(repo.load("team/app").unwrap().unwrap().scope(), "team/app");
        assert_eq!(repo.load("team_app").unwrap().unwrap().scope(), "team_app");
        assert_eq!(repo.list_scopes().unwrap(), vec!["team/app".to_string(), "team_app".to_string()]);
    }
}
