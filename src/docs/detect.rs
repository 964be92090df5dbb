//! Repository-level documentation detection.
//!
//! Classifies repository paths into documentation kinds and checks a project against the
//! categories a well documented pipeline is expected to have.
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use ignore::WalkBuilder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::AtlasGraphError;
use crate::graph::{CicdGraph, DocKind, NodeKind};

/// Categories every project should document, with their display labels.
pub const EXPECTED_DOCS: [(DocKind, &str); 5] = [
    (DocKind::ReadmeSection, "README file"),
    (DocKind::Architecture, "Architecture documentation"),
    (DocKind::RunbookLink, "Runbook / operations guide"),
    (DocKind::SecurityPolicy, "Security policy"),
    (DocKind::CodeOwners, "Code ownership file"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedDoc {
    pub path: String,
    pub kind: DocKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDocReport {
    pub found: Vec<String>,
    pub missing: Vec<String>,
    pub coverage_pct: f64,
    pub drift_warnings: Vec<String>,
    /// 0 means no drift, 1 severe.
    pub drift_score: f64,
    pub files: Vec<DetectedDoc>,
}

fn adr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|[/_.-])(adrs?|decisions)([/_.-]|\d|$)").expect("ADR pattern is valid")
    })
}

fn docs_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|/)docs?/").expect("docs dir pattern is valid"))
}

/// Classify one repository path, or `None` if it is not documentation.
#[must_use]
pub fn classify_doc_path(path: &str) -> Option<DocKind> {
    let lower = path.replace('\\', "/").to_lowercase();
    let basename = lower.rsplit('/').next().unwrap_or(&lower);
    match basename {
        "readme.md" | "readme.rst" | "readme.txt" | "readme" => Some(DocKind::ReadmeSection),
        "architecture.md" | "arch.md" => Some(DocKind::Architecture),
        "runbook.md" | "playbook.md" => Some(DocKind::RunbookLink),
        "security.md" | "security_policy.md" => Some(DocKind::SecurityPolicy),
        "codeowners" => Some(DocKind::CodeOwners),
        _ if basename.ends_with(".md") && adr_re().is_match(&lower) => Some(DocKind::Adr),
        _ if docs_dir_re().is_match(&lower) => Some(DocKind::DocsDir),
        _ => None,
    }
}

/// Classify a list of paths, keeping only documentation.
pub fn detect_doc_files<I, S>(paths: I) -> Vec<DetectedDoc>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .filter_map(|p| {
            let p = p.as_ref();
            classify_doc_path(p).map(|kind| DetectedDoc { path: p.to_string(), kind })
        })
        .collect()
}

/// Walk a repository (respecting .gitignore) and classify its documentation files.
///
/// # Errors
/// Returns `AtlasGraphError::Io` if `root` is not a readable directory.
pub fn discover_doc_files(root: &Path) -> Result<Vec<DetectedDoc>, AtlasGraphError> {
    if !root.is_dir() {
        return Err(AtlasGraphError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("not a directory: {}", root.display()),
        )));
    }
    let mut builder = WalkBuilder::new(root);
    // .github/CODEOWNERS lives in a hidden directory
    builder.hidden(false).git_ignore(true).git_exclude(true).follow_links(false);
    builder.filter_entry(|e| e.file_name() != ".git");
    let mut rel_paths: Vec<String> = Vec::new();
    for dent in builder.build().flatten() {
        if !dent.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if let Ok(rel) = dent.path().strip_prefix(root) {
            rel_paths.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    rel_paths.sort();
    Ok(detect_doc_files(rel_paths))
}

/// Evaluate a project's documentation against the expected categories and its graph.
#[must_use]
pub fn evaluate_project_docs(graph: Option<&CicdGraph>, files: &[DetectedDoc]) -> ProjectDocReport {
    let mut kinds: BTreeSet<DocKind> = files.iter().map(|f| f.kind).collect();
    if let Some(g) = graph {
        kinds.extend(g.artifacts().map(|a| a.kind));
        for node in g.nodes().filter(|n| n.kind == NodeKind::DocFile) {
            let path = node.attributes.get("path").and_then(|v| v.as_str()).unwrap_or(&node.name);
            kinds.extend(classify_doc_path(path));
        }
    }

    let mut report = ProjectDocReport { files: files.to_vec(), ..Default::default() };
    for (kind, label) in EXPECTED_DOCS {
        if kinds.contains(&kind) {
            report.found.push(label.to_string());
        } else {
            report.missing.push(label.to_string());
        }
    }
    let pct = report.found.len() as f64 / EXPECTED_DOCS.len() as f64 * 100.0;
    report.coverage_pct = (pct * 10.0).round() / 10.0;

    if let Some(g) = graph {
        let deploys = g.nodes().any(|n| {
            matches!(n.kind, NodeKind::Environment | NodeKind::Stage)
                && n.name.to_lowercase().contains("deploy")
        });
        if deploys && !kinds.contains(&DocKind::RunbookLink) {
            report
                .drift_warnings
                .push("Pipeline deploys to environments but no runbook documentation found".into());
            report.drift_score = report.drift_score.max(0.5);
        }
        let secrets = g.nodes().any(|n| n.kind == NodeKind::SecretRef);
        if secrets && !kinds.contains(&DocKind::SecurityPolicy) {
            report
                .drift_warnings
                .push("Pipeline uses secrets but no security policy documentation found".into());
            report.drift_score = report.drift_score.max(0.3);
        }
    }

    info!(
        coverage_pct = report.coverage_pct,
        drift = report.drift_score,
        warnings = report.drift_warnings.len(),
        "project documentation evaluated"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::fixture;

    #[test]
    fn classifies_known_paths() {
        assert_eq!(classify_doc_path("README.md"), Some(DocKind::ReadmeSection));
        assert_eq!(classify_doc_path(".github/CODEOWNERS"), Some(DocKind::CodeOwners));
        assert_eq!(classify_doc_path("ops/RUNBOOK.md"), Some(DocKind::RunbookLink));
        assert_eq!(classify_doc_path("docs/adr/0001-use-rust.md"), Some(DocKind::Adr));
        assert_eq!(classify_doc_path("docs/guide.md"), Some(DocKind::DocsDir));
        assert_eq!(classify_doc_path("src/padre.md"), None);
        assert_eq!(classify_doc_path("src/main.rs"), None);
    }

    #[test]
    fn deploy_without_runbook_warns() {
        let g = fixture(
            &[("deploy-prod", NodeKind::Stage), ("token", NodeKind::SecretRef)],
            &[],
        );
        let files = detect_doc_files(["README.md", "SECURITY.md"]);
        let r = evaluate_project_docs(Some(&g), &files);
        assert_eq!(r.found.len(), 2);
        assert_eq!(r.coverage_pct, 40.0);
        assert_eq!(r.drift_warnings.len(), 1);
        assert_eq!(r.drift_score, 0.5);
    }

    #[test]
    fn discovers_hidden_codeowners() {
        let td = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(td.path().join(".github")).unwrap();
        std::fs::write(td.path().join(".github/CODEOWNERS"), "* @team\n").unwrap();
        std::fs::write(td.path().join("README.md"), "# x\n").unwrap();
        std::fs::write(td.path().join("main.rs"), "fn main() {}\n").unwrap();
        let found = discover_doc_files(td.path()).unwrap();
        let kinds: Vec<DocKind> = found.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DocKind::CodeOwners, DocKind::ReadmeSection]);
    }
}
