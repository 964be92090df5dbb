//! Links between independent scope graphs.
//!
//! Scopes never share nodes, but the same artifact, image, secret, environment or external
//! service often appears in several of them under slightly different names. The linker matches
//! those by normalized name and also picks up `triggers` edges that point at another scope's
//! pipeline.
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::graph::{CicdGraph, EdgeKind, NodeId, NodeKind};

const TRIGGER_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    SharedArtifact,
    SharedImage,
    SharedSecret,
    SharedEnv,
    SharedService,
    CrossTrigger,
}

impl LinkType {
    fn for_kind(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Artifact => Some(LinkType::SharedArtifact),
            NodeKind::ContainerImage => Some(LinkType::SharedImage),
            NodeKind::SecretRef => Some(LinkType::SharedSecret),
            NodeKind::Environment => Some(LinkType::SharedEnv),
            NodeKind::ExternalService => Some(LinkType::SharedService),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::SharedArtifact => "shared_artifact",
            LinkType::SharedImage => "shared_image",
            LinkType::SharedSecret => "shared_secret",
            LinkType::SharedEnv => "shared_env",
            LinkType::SharedService => "shared_service",
            LinkType::CrossTrigger => "cross_trigger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossScopeLink {
    pub source_scope: String,
    pub source_node: NodeId,
    pub target_scope: String,
    pub target_node: NodeId,
    pub link_type: LinkType,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiScopeView {
    pub scopes: Vec<String>,
    pub links: Vec<CrossScopeLink>,
}

impl MultiScopeView {
    /// Links touching `scope` on either side.
    pub fn links_for<'a>(&'a self, scope: &'a str) -> impl Iterator<Item = &'a CrossScopeLink> + 'a {
        self.links.iter().filter(move |l| l.source_scope == scope || l.target_scope == scope)
    }
}

/// Lowercase, trim and drop `secret:`, `env:` or `image:` prefixes.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    for prefix in ["secret:", "env:", "image:"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return rest.trim().to_string();
        }
    }
    lower
}

/// Detect cross-scope links among `graphs`. The first scope (in input order) to mention a shared
/// resource becomes the source of its links.
#[must_use]
pub fn link_scopes(graphs: &[&CicdGraph]) -> MultiScopeView {
    let mut view = MultiScopeView {
        scopes: graphs.iter().map(|g| g.scope().to_string()).collect(),
        links: Vec::new(),
    };

    let mut index: BTreeMap<(NodeKind, String), Vec<(&str, &NodeId)>> = BTreeMap::new();
    for g in graphs {
        for n in g.nodes().filter(|n| LinkType::for_kind(n.kind).is_some()) {
            index.entry((n.kind, normalize_name(&n.name))).or_default().push((g.scope(), &n.id));
        }
    }
    for ((kind, _), locations) in &index {
        let Some(link_type) = LinkType::for_kind(*kind) else { continue };
        let Some(((src_scope, src_node), rest)) = locations.split_first() else { continue };
        for (scope, node) in rest {
            if scope == src_scope {
                continue;
            }
            view.links.push(CrossScopeLink {
                source_scope: src_scope.to_string(),
                source_node: (*src_node).clone(),
                target_scope: scope.to_string(),
                target_node: (*node).clone(),
                link_type,
                confidence: 1.0,
            });
        }
    }

    let mut pipelines: HashMap<String, (&str, &NodeId)> = HashMap::new();
    for g in graphs {
        for n in g.nodes().filter(|n| n.kind == NodeKind::Pipeline) {
            pipelines.insert(normalize_name(&n.name), (g.scope(), &n.id));
        }
    }
    for g in graphs {
        for e in g.edges().filter(|e| e.kind == EdgeKind::Triggers) {
            let Some(target) = g.node(&e.to) else { continue };
            if let Some((scope, node)) = pipelines.get(&normalize_name(&target.name)) {
                if *scope != g.scope() {
                    view.links.push(CrossScopeLink {
                        source_scope: g.scope().to_string(),
                        source_node: e.from.clone(),
                        target_scope: scope.to_string(),
                        target_node: (*node).clone(),
                        link_type: LinkType::CrossTrigger,
                        confidence: TRIGGER_CONFIDENCE,
                    });
                }
            }
        }
    }

    info!(scopes = graphs.len(), links = view.links.len(), "scopes linked");
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{edge, node, ts};

    fn scope_graph(scope: &str, nodes: &[(&str, &str, NodeKind)], edges: &[(&str, &str)]) -> CicdGraph {
        let mut g = CicdGraph::new(scope);
        for (id, name, kind) in nodes {
            let mut n = node(id, *kind);
            n.name = (*name).to_string();
            g.upsert_node(n, ts(0));
        }
        for (from, to) in edges {
            g.insert_edge(edge(from, to, EdgeKind::Triggers), ts(0));
        }
        g
    }

    #[test]
    fn normalizes_prefixes_and_case() {
        assert_eq!(normalize_name("  Secret:DB_PASS "), "db_pass");
        assert_eq!(normalize_name("image:rust:1.80"), "rust:1.80");
        assert_eq!(normalize_name("Prod"), "prod");
    }

    #[test]
    fn links_shared_secret_and_trigger() {
        let a = scope_graph(
            "frontend",
            &[
                ("a-secret", "secret:DB_PASS", NodeKind::SecretRef),
                ("a-job", "deploy", NodeKind::Job),
                ("a-ext", "backend-ci", NodeKind::Pipeline),
            ],
            &[("a-job", "a-ext")],
        );
        let b = scope_graph(
            "backend",
            &[("b-secret", "db_pass", NodeKind::SecretRef), ("b-pipe", "Backend-CI", NodeKind::Pipeline)],
            &[],
        );
        let view = link_scopes(&[&a, &b]);
        let shared: Vec<&CrossScopeLink> =
            view.links.iter().filter(|l| l.link_type == LinkType::SharedSecret).collect();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].source_scope, "frontend");
        assert_eq!(shared[0].target_node, NodeId("b-secret".into()));

        let trig: Vec<&CrossScopeLink> =
            view.links.iter().filter(|l| l.link_type == LinkType::CrossTrigger).collect();
        assert_eq!(trig.len(), 1);
        assert_eq!(trig[0].source_node, NodeId("a-job".into()));
        assert_eq!(trig[0].target_scope, "backend");
        assert!((trig[0].confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(view.links_for("backend").count(), 2);
    }

    #[test]
    fn same_scope_duplicates_do_not_link() {
        let a = scope_graph(
            "solo",
            &[("x", "prod", NodeKind::Environment), ("y", "PROD", NodeKind::Environment)],
            &[],
        );
        assert!(link_scopes(&[&a]).links.is_empty());
    }
}
