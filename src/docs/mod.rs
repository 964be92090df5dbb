//! Documentation intelligence: coverage classification, scoring and drift detection.
//!
//! Scoring never mutates the graph. Scores are derived from the node's attributes, its attached
//! artifacts and its degree; drift compares each artifact's captured neighborhood fingerprint with
//! the current one.
use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::graph::builder::IngestResult;
use crate::graph::{ArtifactId, CicdGraph, Direction, DocumentationArtifact, Node, NodeId, NodeKind};
use crate::traversal::neighborhood;

pub mod detect;

/// SHA-256 of the empty string, reported by producers for empty documents.
pub const EMPTY_CONTENT_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Undocumented,
    Partial,
    Documented,
    Stale,
}

impl Classification {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Undocumented => "undocumented",
            Classification::Partial => "partial",
            Classification::Documented => "documented",
            Classification::Stale => "stale",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageScore {
    pub node_id: NodeId,
    pub score: f64,
    pub classification: Classification,
    /// Importance weight in `[1, 2]`.
    pub weight: f64,
    pub covered_fraction: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub scope: String,
    pub revision: u64,
    pub scores: BTreeMap<NodeId, CoverageScore>,
    /// Weighted mean of node scores.
    pub aggregate: f64,
}

impl CoverageReport {
    #[must_use]
    pub fn count(&self, c: Classification) -> usize {
        self.scores.values().filter(|s| s.classification == c).count()
    }

    /// Lowest scoring nodes first; heavier nodes first among equal scores.
    #[must_use]
    pub fn worst(&self, limit: usize) -> Vec<&CoverageScore> {
        let mut v: Vec<&CoverageScore> = self.scores.values().collect();
        v.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then(b.weight.total_cmp(&a.weight))
                .then(a.node_id.cmp(&b.node_id))
        });
        v.truncate(limit);
        v
    }

    fn recompute_aggregate(&mut self) {
        let (num, den) = self
            .scores
            .values()
            .fold((0.0, 0.0), |(n, d), s| (n + s.score * s.weight, d + s.weight));
        self.aggregate = if den > 0.0 { num / den } else { 0.0 };
    }
}

#[derive(Debug, Clone)]
pub struct DocConfig {
    /// Covered fractions below this are Partial, checked before freshness. Within `(0, 1]`.
    pub partial_threshold: f64,
    pub centrality_cap: usize,
    pub placeholder_hashes: BTreeSet<String>,
    /// Attribute keys worth documenting, per node kind.
    pub documentable: BTreeMap<NodeKind, Vec<String>>,
}

impl Default for DocConfig {
    fn default() -> Self {
        let documentable = [
            (NodeKind::Pipeline, &["triggers", "schedule", "owner"][..]),
            (NodeKind::Stage, &["environment", "when"][..]),
            (NodeKind::Job, &["script", "image", "environment", "artifacts", "when"][..]),
            (NodeKind::Step, &["run", "uses"][..]),
            (NodeKind::Artifact, &["path", "retention"][..]),
            (NodeKind::ContainerImage, &["registry", "tag"][..]),
            (NodeKind::Runner, &["tags", "executor"][..]),
            (NodeKind::SecretRef, &["provider", "rotation"][..]),
            (NodeKind::Environment, &["url", "approval", "protected"][..]),
            (NodeKind::ExternalService, &["url", "owner"][..]),
        ]
        .into_iter()
        .map(|(k, keys)| (k, keys.iter().map(|s| (*s).to_string()).collect()))
        .collect();
        Self {
            partial_threshold: 0.5,
            centrality_cap: 10,
            placeholder_hashes: [String::new(), EMPTY_CONTENT_SHA256.to_string()].into(),
            documentable,
        }
    }
}

impl DocConfig {
    /// Configuration rejects values outside `(0, 1)`; this only guards hand-built configs.
    fn threshold(&self) -> f64 {
        self.partial_threshold.clamp(f64::EPSILON, 1.0)
    }

    fn is_placeholder(&self, hash: &str) -> bool {
        hash.is_empty() || self.placeholder_hashes.contains(hash)
    }
}

/// Why an artifact no longer matches its node's structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriftReason {
    NeighborhoodChanged { added: Vec<NodeId>, removed: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftFinding {
    pub node_id: NodeId,
    pub artifact_id: ArtifactId,
    pub reason: DriftReason,
}

/// Stateless scorer over graph snapshots.
#[derive(Debug, Clone, Default)]
pub struct DocScorer {
    config: DocConfig,
}

impl DocScorer {
    #[must_use]
    pub fn new(config: DocConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &DocConfig {
        &self.config
    }

    fn valid_artifacts<'g>(
        &'g self,
        graph: &'g CicdGraph,
        id: &NodeId,
    ) -> impl Iterator<Item = &'g DocumentationArtifact> + 'g {
        graph.artifacts_for(id).filter(move |a| !self.config.is_placeholder(&a.content_hash))
    }

    fn weight(&self, graph: &CicdGraph, id: &NodeId) -> f64 {
        let cap = self.config.centrality_cap.max(1);
        let (indeg, outdeg) = graph.degree(id);
        1.0 + (indeg + outdeg).min(cap) as f64 / cap as f64
    }

    fn covered_fraction(&self, node: &Node, artifacts: &[&DocumentationArtifact]) -> f64 {
        let documentable: BTreeSet<&str> = self
            .config
            .documentable
            .get(&node.kind)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .filter(|k| node.attributes.contains_key(*k))
            .collect();
        if documentable.is_empty() {
            return 1.0;
        }
        let covered = documentable
            .iter()
            .filter(|k| artifacts.iter().any(|a| a.covers.contains(**k)))
            .count();
        covered as f64 / documentable.len() as f64
    }

    /// Score one node, or `None` if it is not in the graph.
    #[must_use]
    pub fn score_node(&self, graph: &CicdGraph, id: &NodeId) -> Option<CoverageScore> {
        let node = graph.node(id)?;
        let weight = self.weight(graph, id);
        let artifacts: Vec<&DocumentationArtifact> = self.valid_artifacts(graph, id).collect();
        let (classification, fraction) = if artifacts.is_empty() {
            (Classification::Undocumented, 0.0)
        } else {
            let fraction = self.covered_fraction(node, &artifacts);
            let newest = artifacts.iter().map(|a| a.last_seen_at).max();
            let fresh = newest.is_some_and(|t| t >= node.structure_changed_at);
            let c = if fraction < self.config.threshold() {
                Classification::Partial
            } else if !fresh {
                Classification::Stale
            } else if fraction >= 1.0 {
                Classification::Documented
            } else {
                Classification::Partial
            };
            (c, fraction)
        };
        let base = match classification {
            Classification::Undocumented => 0.0,
            Classification::Partial => 0.25 + 0.5 * fraction,
            Classification::Stale => 0.5,
            Classification::Documented => 1.0,
        };
        Some(CoverageScore {
            node_id: id.clone(),
            score: f64::powf(base, weight),
            classification,
            weight,
            covered_fraction: fraction,
        })
    }

    /// Score every node of the graph.
    #[must_use]
    pub fn score(&self, graph: &CicdGraph) -> CoverageReport {
        let ids: Vec<&NodeId> = graph.node_ids().collect();
        let scores: BTreeMap<NodeId, CoverageScore> = ids
            .par_iter()
            .filter_map(|id| self.score_node(graph, id))
            .map(|s| (s.node_id.clone(), s))
            .collect();
        let mut report = CoverageReport {
            scope: graph.scope().to_string(),
            revision: graph.metadata.revision,
            scores,
            aggregate: 0.0,
        };
        report.recompute_aggregate();
        info!(
            scope = %report.scope,
            nodes = report.scores.len(),
            aggregate = report.aggregate,
            "coverage scored"
        );
        report
    }

    /// Artifacts whose captured neighborhood no longer matches the graph.
    #[must_use]
    pub fn detect_drift(&self, graph: &CicdGraph) -> Vec<DriftFinding> {
        let nodes: Vec<&Node> = graph.nodes().collect();
        let findings: Vec<DriftFinding> = nodes
            .par_iter()
            .flat_map_iter(|node| {
                let artifacts: Vec<&DocumentationArtifact> =
                    self.valid_artifacts(graph, &node.id).collect();
                let mut out = Vec::new();
                if artifacts.is_empty() {
                    return out;
                }
                let hood = neighborhood(graph, &node.id);
                let current: BTreeSet<&NodeId> = hood.members.iter().map(|(id, _)| id).collect();
                for art in artifacts {
                    if art.fingerprint == hood.fingerprint {
                        continue;
                    }
                    let captured: BTreeSet<&NodeId> = art.neighborhood.iter().collect();
                    out.push(DriftFinding {
                        node_id: node.id.clone(),
                        artifact_id: art.id.clone(),
                        reason: DriftReason::NeighborhoodChanged {
                            added: current.difference(&captured).map(|id| (*id).clone()).collect(),
                            removed: captured.difference(&current).map(|id| (*id).clone()).collect(),
                        },
                    });
                }
                out
            })
            .collect();
        if !findings.is_empty() {
            info!(scope = %graph.scope(), drifted = findings.len(), "documentation drift detected");
        }
        findings
    }
}

/// Which cached scores must be recomputed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Invalidation {
    #[default]
    Clean,
    Nodes(BTreeSet<NodeId>),
    Full,
}

impl Invalidation {
    #[must_use]
    pub fn from_result(result: &IngestResult) -> Self {
        if result.bulk {
            Invalidation::Full
        } else if result.touched.is_empty() {
            Invalidation::Clean
        } else {
            Invalidation::Nodes(result.touched.clone())
        }
    }

    pub fn merge(&mut self, other: Invalidation) {
        let merged = match (std::mem::take(self), other) {
            (Invalidation::Full, _) | (_, Invalidation::Full) => Invalidation::Full,
            (Invalidation::Clean, x) | (x, Invalidation::Clean) => x,
            (Invalidation::Nodes(mut a), Invalidation::Nodes(b)) => {
                a.extend(b);
                Invalidation::Nodes(a)
            }
        };
        *self = merged;
    }
}

/// Last computed scores plus pending invalidations for one scope.
#[derive(Debug, Default)]
pub struct CoverageIndex {
    report: Option<CoverageReport>,
    dirty: Invalidation,
    last_recomputed: usize,
}

impl CoverageIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&mut self, inv: Invalidation) {
        self.dirty.merge(inv);
    }

    /// Nodes rescored by the last `refresh`.
    #[must_use]
    pub fn last_recomputed(&self) -> usize {
        self.last_recomputed
    }

    /// Bring the cached report up to date with `graph` and return it.
    pub fn refresh(&mut self, scorer: &DocScorer, graph: &CicdGraph) -> &CoverageReport {
        let dirty = std::mem::take(&mut self.dirty);
        let report = match (self.report.take(), dirty) {
            (Some(mut report), Invalidation::Nodes(touched)) if report.scope == graph.scope() => {
                let mut affected: BTreeSet<NodeId> = BTreeSet::new();
                for id in &touched {
                    affected.insert(id.clone());
                    affected.extend(graph.neighbors(id, Direction::Both, None));
                }
                for id in &affected {
                    match scorer.score_node(graph, id) {
                        Some(s) => {
                            report.scores.insert(id.clone(), s);
                        }
                        None => {
                            report.scores.remove(id);
                        }
                    }
                }
                report.revision = graph.metadata.revision;
                report.recompute_aggregate();
                debug!(scope = %report.scope, rescored = affected.len(), "coverage refreshed");
                self.last_recomputed = affected.len();
                report
            }
            (Some(report), Invalidation::Clean) if report.revision == graph.metadata.revision => {
                self.last_recomputed = 0;
                report
            }
            _ => {
                let report = scorer.score(graph);
                self.last_recomputed = report.scores.len();
                report
            }
        };
        self.report.insert(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{fixture, ts};
    use crate::graph::{DocKind, EdgeKind, NodeKind::Job};

    fn attach(g: &mut CicdGraph, node: &str, id: &str, hash: &str, seen: i64, covers: &[&str]) {
        let node_id = NodeId(node.to_string());
        let hood = neighborhood(g, &node_id);
        g.upsert_artifact(DocumentationArtifact {
            id: ArtifactId(id.to_string()),
            node_id,
            kind: DocKind::ReadmeSection,
            content_hash: hash.to_string(),
            last_seen_at: ts(seen),
            covers: covers.iter().map(|s| (*s).to_string()).collect(),
            fingerprint: hood.fingerprint,
            neighborhood: hood.members.into_iter().map(|(id, _)| id).collect(),
        });
    }

    fn with_attrs(g: &mut CicdGraph, node: &str, keys: &[&str]) {
        let mut n = g.node(&NodeId(node.into())).unwrap().clone();
        for k in keys {
            n.attributes.insert((*k).to_string(), serde_json::json!("x"));
        }
        g.upsert_node(n, ts(0));
    }

    #[test]
    fn placeholder_hash_is_undocumented() {
        let mut g = fixture(&[("a", Job)], &[]);
        attach(&mut g, "a", "d1", EMPTY_CONTENT_SHA256, 1, &[]);
        let s = DocScorer::default().score_node(&g, &NodeId("a".into())).unwrap();
        assert_eq!(s.classification, Classification::Undocumented);
        assert_eq!(s.score, 0.0);
    }

    #[test]
    fn classification_ladder() {
        let mut g = fixture(&[("a", Job)], &[]);
        with_attrs(&mut g, "a", &["script", "image", "environment", "artifacts"]);
        let scorer = DocScorer::default();
        let id = NodeId("a".into());

        attach(&mut g, "a", "d1", "h1", 1, &["script"]);
        let s = scorer.score_node(&g, &id).unwrap();
        assert_eq!(s.classification, Classification::Partial);
        assert!((s.covered_fraction - 0.25).abs() < 1e-9);

        attach(&mut g, "a", "d1", "h2", 1, &["script", "image", "environment"]);
        assert_eq!(scorer.score_node(&g, &id).unwrap().classification, Classification::Partial);

        attach(&mut g, "a", "d1", "h3", 1, &["script", "image", "environment", "artifacts"]);
        let s = scorer.score_node(&g, &id).unwrap();
        assert_eq!(s.classification, Classification::Documented);
        assert_eq!(s.score, 1.0);

        // Structural change after the docs were written
        let mut n = g.node(&id).unwrap().clone();
        n.attributes.insert("when".into(), serde_json::json!("manual"));
        g.upsert_node(n, ts(10));
        let s = scorer.score_node(&g, &id).unwrap();
        assert_eq!(s.classification, Classification::Stale);
    }

    #[test]
    fn configured_threshold_is_applied_before_staleness() {
        let mut g = fixture(&[("a", Job)], &[]);
        with_attrs(&mut g, "a", &["script", "image", "environment", "artifacts"]);
        attach(&mut g, "a", "d1", "h1", 1, &["script", "image", "environment"]);
        let mut n = g.node(&NodeId("a".into())).unwrap().clone();
        n.attributes.insert("artifacts".into(), serde_json::json!("dist/"));
        g.upsert_node(n, ts(10));
        let id = NodeId("a".into());

        let strict = DocScorer::new(DocConfig { partial_threshold: 0.8, ..Default::default() });
        let s = strict.score_node(&g, &id).unwrap();
        assert!((s.covered_fraction - 0.75).abs() < 1e-9);
        assert_eq!(s.classification, Classification::Partial);

        let lenient = DocScorer::new(DocConfig { partial_threshold: 0.5, ..Default::default() });
        assert_eq!(lenient.score_node(&g, &id).unwrap().classification, Classification::Stale);
    }

    #[test]
    fn hubs_weigh_more() {
        let g = fixture(
            &[("hub", Job), ("a", Job), ("b", Job), ("leaf", Job)],
            &[("a", "hub", EdgeKind::Needs), ("b", "hub", EdgeKind::Needs)],
        );
        let scorer = DocScorer::new(DocConfig { centrality_cap: 2, ..Default::default() });
        let hub = scorer.score_node(&g, &NodeId("hub".into())).unwrap();
        let leaf = scorer.score_node(&g, &NodeId("leaf".into())).unwrap();
        assert_eq!(hub.weight, 2.0);
        assert_eq!(leaf.weight, 1.0);
    }

    #[test]
    fn aggregate_is_weighted_mean_and_zero_when_empty() {
        let scorer = DocScorer::default();
        assert_eq!(scorer.score(&CicdGraph::new("empty")).aggregate, 0.0);

        let mut g = fixture(&[("a", Job), ("b", Job)], &[]);
        attach(&mut g, "a", "d1", "h", 1, &[]);
        let r = scorer.score(&g);
        assert!((r.aggregate - 0.5).abs() < 1e-9);
        assert_eq!(r.count(Classification::Documented), 1);
        assert_eq!(r.worst(1)[0].node_id, NodeId("b".into()));
    }

    #[test]
    fn drift_reports_added_neighbor() {
        let mut g = fixture(&[("a", Job), ("b", Job), ("c", Job)], &[("a", "b", EdgeKind::Needs)]);
        attach(&mut g, "a", "d1", "h", 1, &[]);
        let scorer = DocScorer::default();
        assert!(scorer.detect_drift(&g).is_empty());

        g.insert_edge(crate::graph::tests::edge("a", "c", EdgeKind::Needs), ts(5));
        let findings = scorer.detect_drift(&g);
        assert_eq!(findings.len(), 1);
        assert_eq!(
            findings[0].reason,
            DriftReason::NeighborhoodChanged { added: vec![NodeId("c".into())], removed: vec![] }
        );
        assert_eq!(findings, scorer.detect_drift(&g));
    }

    #[test]
    fn index_rescores_touched_and_neighbors_only() {
        let mut g = fixture(
            &[("a", Job), ("b", Job), ("c", Job), ("d", Job)],
            &[("a", "b", EdgeKind::Needs)],
        );
        let scorer = DocScorer::default();
        let mut index = CoverageIndex::new();
        index.refresh(&scorer, &g);
        assert_eq!(index.last_recomputed(), 4);

        attach(&mut g, "a", "d1", "h", 1, &[]);
        g.metadata.revision += 1;
        index.invalidate(Invalidation::Nodes([NodeId("a".into())].into()));
        let report = index.refresh(&scorer, &g).clone();
        assert_eq!(index.last_recomputed(), 2);
        assert_eq!(report, scorer.score(&g));
    }

    #[test]
    fn invalidations_merge() {
        let mut inv = Invalidation::Nodes([NodeId("a".into())].into());
        inv.merge(Invalidation::Nodes([NodeId("b".into())].into()));
        assert_eq!(inv, Invalidation::Nodes([NodeId("a".into()), NodeId("b".into())].into()));
        inv.merge(Invalidation::Full);
        assert_eq!(inv, Invalidation::Full);
    }
}
