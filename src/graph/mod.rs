//! Graph model for a single scope.
//!
//! This module defines the canonical data structures (`CicdGraph`, `Node`, `Edge`,
//! `DocumentationArtifact`) together with the adjacency indices used by traversal and
//! documentation scoring. Relationships are stored by key (`NodeId`) in ordered maps, so the
//! graph can hold arbitrary cycles without owning references.
//!
//! Graphs are mutated only through `builder::GraphBuilder`; everything else reads snapshots.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub mod builder;
pub mod identity;

/// Arbitrary per-kind attributes attached to a node.
pub type Attributes = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Pipeline,
    Stage,
    Job,
    Step,
    Artifact,
    ContainerImage,
    Runner,
    SecretRef,
    Environment,
    ExternalService,
    Repository,
    DocFile,
}

impl NodeKind {
    pub const ALL: [NodeKind; 12] = [
        NodeKind::Pipeline,
        NodeKind::Stage,
        NodeKind::Job,
        NodeKind::Step,
        NodeKind::Artifact,
        NodeKind::ContainerImage,
        NodeKind::Runner,
        NodeKind::SecretRef,
        NodeKind::Environment,
        NodeKind::ExternalService,
        NodeKind::Repository,
        NodeKind::DocFile,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Pipeline => "pipeline",
            NodeKind::Stage => "stage",
            NodeKind::Job => "job",
            NodeKind::Step => "step",
            NodeKind::Artifact => "artifact",
            NodeKind::ContainerImage => "container_image",
            NodeKind::Runner => "runner",
            NodeKind::SecretRef => "secret_ref",
            NodeKind::Environment => "environment",
            NodeKind::ExternalService => "external_service",
            NodeKind::Repository => "repository",
            NodeKind::DocFile => "doc_file",
        }
    }

    /// Parse the snake_case name used in configuration and on the command line.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|k| k.as_str() == wanted)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    DependsOn,
    Triggers,
    Contains,
    Needs,
    Produces,
    Consumes,
    Uses,
    Calls,
}

impl EdgeKind {
    pub const ALL: [EdgeKind; 8] = [
        EdgeKind::DependsOn,
        EdgeKind::Triggers,
        EdgeKind::Contains,
        EdgeKind::Needs,
        EdgeKind::Produces,
        EdgeKind::Consumes,
        EdgeKind::Uses,
        EdgeKind::Calls,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::DependsOn => "depends_on",
            EdgeKind::Triggers => "triggers",
            EdgeKind::Contains => "contains",
            EdgeKind::Needs => "needs",
            EdgeKind::Produces => "produces",
            EdgeKind::Consumes => "consumes",
            EdgeKind::Uses => "uses",
            EdgeKind::Calls => "calls",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|k| k.as_str() == wanted)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way edges are followed when walking the graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Follow `from -> to`.
    #[default]
    Outgoing,
    /// Follow `to -> from`.
    Incoming,
    /// Follow edges regardless of orientation.
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub source_system: String,
    pub external_key: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub doc_refs: BTreeSet<ArtifactId>,
    pub structure_changed_at: DateTime<Utc>,
}

/// A directed relationship. Edges are a set keyed by `(from, to, kind)`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DocKind {
    ReadmeSection,
    InlineComment,
    Adr,
    RunbookLink,
    Architecture,
    SecurityPolicy,
    CodeOwners,
    DocsDir,
}

impl DocKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::ReadmeSection => "readme_section",
            DocKind::InlineComment => "inline_comment",
            DocKind::Adr => "adr",
            DocKind::RunbookLink => "runbook_link",
            DocKind::Architecture => "architecture",
            DocKind::SecurityPolicy => "security_policy",
            DocKind::CodeOwners => "code_owners",
            DocKind::DocsDir => "docs_dir",
        }
    }
}

impl fmt::Display for DocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentationArtifact {
    pub id: ArtifactId,
    pub node_id: NodeId,
    pub kind: DocKind,
    pub content_hash: String,
    pub last_seen_at: DateTime<Utc>,
    /// Attribute keys of the documented node this artifact describes.
    #[serde(default)]
    pub covers: BTreeSet<String>,
    /// Structural fingerprint of the node's one-hop neighborhood when the content was recorded.
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub neighborhood: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GraphMetadata {
    pub scope: String,
    /// Incremented once per batch that changed the graph.
    pub revision: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Outcome of upserting a node into the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChange {
    Created,
    Updated,
    Unchanged,
}

/// The canonical graph for one scope.
///
/// Serialized as flat node/edge/artifact lists; adjacency indices are rebuilt on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphDocument", into = "GraphDocument")]
pub struct CicdGraph {
    pub metadata: GraphMetadata,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeSet<Edge>,
    artifacts: BTreeMap<ArtifactId, DocumentationArtifact>,
    // Adjacency: node -> (neighbor, kind), kept in sync with `edges`
    outgoing: BTreeMap<NodeId, BTreeSet<(NodeId, EdgeKind)>>,
    incoming: BTreeMap<NodeId, BTreeSet<(NodeId, EdgeKind)>>,
}

impl PartialEq for CicdGraph {
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata
            && self.nodes == other.nodes
            && self.edges == other.edges
            && self.artifacts == other.artifacts
    }
}

#[derive(Serialize, Deserialize)]
struct GraphDocument {
    #[serde(default)]
    metadata: GraphMetadata,
    #[serde(default)]
    nodes: Vec<Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    artifacts: Vec<DocumentationArtifact>,
}

impl From<CicdGraph> for GraphDocument {
    fn from(g: CicdGraph) -> Self {
        GraphDocument {
            metadata: g.metadata,
            nodes: g.nodes.into_values().collect(),
            edges: g.edges.into_iter().collect(),
            artifacts: g.artifacts.into_values().collect(),
        }
    }
}

impl From<GraphDocument> for CicdGraph {
    fn from(doc: GraphDocument) -> Self {
        let mut g = CicdGraph { metadata: doc.metadata, ..Default::default() };
        for node in doc.nodes {
            g.nodes.insert(node.id.clone(), node);
        }
        // Edges whose endpoints are missing cannot be represented; drop them on load
        for edge in doc.edges {
            if g.nodes.contains_key(&edge.from) && g.nodes.contains_key(&edge.to) {
                g.index_edge(&edge);
                g.edges.insert(edge);
            }
        }
        for art in doc.artifacts {
            if let Some(node) = g.nodes.get_mut(&art.node_id) {
                node.doc_refs.insert(art.id.clone());
                g.artifacts.insert(art.id.clone(), art);
            }
        }
        g
    }
}

impl CicdGraph {
    #[must_use]
    pub fn new(scope: &str) -> Self {
        Self {
            metadata: GraphMetadata { scope: scope.to_string(), ..Default::default() },
            ..Default::default()
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.metadata.scope
    }

    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Edges in `(from, to, kind)` order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    #[must_use]
    pub fn contains_edge(&self, edge: &Edge) -> bool {
        self.edges.contains(edge)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &DocumentationArtifact> {
        self.artifacts.values()
    }

    #[must_use]
    pub fn artifact(&self, id: &ArtifactId) -> Option<&DocumentationArtifact> {
        self.artifacts.get(id)
    }

    /// Artifacts attached to a node, in artifact id order.
    pub fn artifacts_for<'a>(
        &'a self,
        id: &NodeId,
    ) -> impl Iterator<Item = &'a DocumentationArtifact> + 'a {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|n| n.doc_refs.iter())
            .filter_map(|a| self.artifacts.get(a))
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    /// Outgoing `(neighbor, kind)` pairs, ordered by neighbor id then kind.
    pub fn outgoing(&self, id: &NodeId) -> impl Iterator<Item = &(NodeId, EdgeKind)> {
        self.outgoing.get(id).into_iter().flatten()
    }

    /// Incoming `(neighbor, kind)` pairs, ordered by neighbor id then kind.
    pub fn incoming(&self, id: &NodeId) -> impl Iterator<Item = &(NodeId, EdgeKind)> {
        self.incoming.get(id).into_iter().flatten()
    }

    /// `(in_degree, out_degree)` counting every edge kind separately.
    #[must_use]
    pub fn degree(&self, id: &NodeId) -> (usize, usize) {
        let indeg = self.incoming.get(id).map_or(0, BTreeSet::len);
        let outdeg = self.outgoing.get(id).map_or(0, BTreeSet::len);
        (indeg, outdeg)
    }

    /// Distinct neighbor ids in the given direction, sorted, optionally restricted to edge kinds.
    #[must_use]
    pub fn neighbors(
        &self,
        id: &NodeId,
        direction: Direction,
        kinds: Option<&BTreeSet<EdgeKind>>,
    ) -> Vec<NodeId> {
        let keep = |k: &EdgeKind| kinds.map_or(true, |ks| ks.contains(k));
        let mut out: Vec<NodeId> = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            out.extend(self.outgoing(id).filter(|(_, k)| keep(k)).map(|(n, _)| n.clone()));
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            out.extend(self.incoming(id).filter(|(_, k)| keep(k)).map(|(n, _)| n.clone()));
        }
        out.sort();
        out.dedup();
        out
    }

    /// Nodes whose name matches exactly, in id order.
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.values().filter(move |n| n.name == name)
    }

    // ----- mutation (builder only) -----

    /// Insert or merge a node. Attributes merge last-write-wins per key; `kind` must already
    /// have been checked by the caller.
    pub(crate) fn upsert_node(&mut self, incoming: Node, now: DateTime<Utc>) -> NodeChange {
        match self.nodes.get_mut(&incoming.id) {
            None => {
                let mut node = incoming;
                node.structure_changed_at = now;
                node.doc_refs.clear();
                self.nodes.insert(node.id.clone(), node);
                NodeChange::Created
            }
            Some(existing) => {
                let mut changed = false;
                if existing.name != incoming.name {
                    existing.name = incoming.name;
                    changed = true;
                }
                for (k, v) in incoming.attributes {
                    if existing.attributes.get(&k) != Some(&v) {
                        existing.attributes.insert(k, v);
                        changed = true;
                    }
                }
                if changed {
                    existing.structure_changed_at = now;
                    NodeChange::Updated
                } else {
                    NodeChange::Unchanged
                }
            }
        }
    }

    /// Remove a node with its incident edges and artifacts. Returns the former neighbors.
    pub(crate) fn remove_node(&mut self, id: &NodeId, now: DateTime<Utc>) -> Option<Vec<NodeId>> {
        let node = self.nodes.get(id)?;
        let doc_refs: Vec<ArtifactId> = node.doc_refs.iter().cloned().collect();
        let mut incident: Vec<Edge> = Vec::new();
        for (n, k) in self.outgoing(id) {
            incident.push(Edge { from: id.clone(), to: n.clone(), kind: *k });
        }
        for (n, k) in self.incoming(id) {
            incident.push(Edge { from: n.clone(), to: id.clone(), kind: *k });
        }
        let mut neighbors: Vec<NodeId> = Vec::new();
        for e in incident {
            if self.remove_edge(&e, now) {
                let other = if e.from == *id { e.to } else { e.from };
                if other != *id {
                    neighbors.push(other);
                }
            }
        }
        for a in doc_refs {
            self.artifacts.remove(&a);
        }
        self.nodes.remove(id);
        self.outgoing.remove(id);
        self.incoming.remove(id);
        neighbors.sort();
        neighbors.dedup();
        Some(neighbors)
    }

    /// Insert an edge whose endpoints both exist. Returns false when it was already present.
    pub(crate) fn insert_edge(&mut self, edge: Edge, now: DateTime<Utc>) -> bool {
        debug_assert!(self.nodes.contains_key(&edge.from) && self.nodes.contains_key(&edge.to));
        if self.edges.contains(&edge) {
            return false;
        }
        self.index_edge(&edge);
        self.touch_structure(&edge.from, now);
        self.touch_structure(&edge.to, now);
        self.edges.insert(edge);
        true
    }

    pub(crate) fn remove_edge(&mut self, edge: &Edge, now: DateTime<Utc>) -> bool {
        if !self.edges.remove(edge) {
            return false;
        }
        if let Some(set) = self.outgoing.get_mut(&edge.from) {
            set.remove(&(edge.to.clone(), edge.kind));
        }
        if let Some(set) = self.incoming.get_mut(&edge.to) {
            set.remove(&(edge.from.clone(), edge.kind));
        }
        self.touch_structure(&edge.from, now);
        self.touch_structure(&edge.to, now);
        true
    }

    /// Attach or replace an artifact. The documented node must exist.
    pub(crate) fn upsert_artifact(&mut self, artifact: DocumentationArtifact) {
        if let Some(previous) = self.artifacts.get(&artifact.id) {
            if previous.node_id != artifact.node_id {
                let old_node = previous.node_id.clone();
                if let Some(n) = self.nodes.get_mut(&old_node) {
                    n.doc_refs.remove(&artifact.id);
                }
            }
        }
        if let Some(n) = self.nodes.get_mut(&artifact.node_id) {
            n.doc_refs.insert(artifact.id.clone());
            self.artifacts.insert(artifact.id.clone(), artifact);
        }
    }

    pub(crate) fn artifact_mut(&mut self, id: &ArtifactId) -> Option<&mut DocumentationArtifact> {
        self.artifacts.get_mut(id)
    }

    pub(crate) fn remove_artifact(&mut self, id: &ArtifactId) -> Option<DocumentationArtifact> {
        let art = self.artifacts.remove(id)?;
        if let Some(n) = self.nodes.get_mut(&art.node_id) {
            n.doc_refs.remove(id);
        }
        Some(art)
    }

    fn index_edge(&mut self, edge: &Edge) {
        self.outgoing.entry(edge.from.clone()).or_default().insert((edge.to.clone(), edge.kind));
        self.incoming.entry(edge.to.clone()).or_default().insert((edge.from.clone(), edge.kind));
    }

    fn touch_structure(&mut self, id: &NodeId, now: DateTime<Utc>) {
        if let Some(n) = self.nodes.get_mut(id) {
            if n.structure_changed_at < now {
                n.structure_changed_at = now;
            }
        }
    }

    /// Save the graph as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` if serialization or writing the file fails.
    pub fn save_json(&self, path: &std::path::Path) -> Result<(), crate::errors::AtlasGraphError> {
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Load a graph from a JSON file.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` if reading the file fails or the JSON is invalid.
    pub fn load_json(path: &std::path::Path) -> Result<Self, crate::errors::AtlasGraphError> {
        let data = std::fs::read_to_string(path)?;
        let graph: CicdGraph = serde_json::from_str(&data)?;
        Ok(graph)
    }
}
