use serde::Serialize;
use std::collections::BTreeSet;

use crate::errors::AtlasGraphError;
use crate::graph::{CicdGraph, Direction, EdgeKind, NodeId, NodeKind};
use crate::traversal::{find_cycles, shortest_path, CycleReport};

/// Query trait implemented by all read-only graph queries.
///
/// Given an immutable reference to a `CicdGraph` snapshot, returns a result of type `R`.
pub trait Query<R> {
    fn run(&self, graph: &CicdGraph) -> R;
}

/// Resolve a command-line node argument: an exact node id, else a unique node name.
///
/// # Errors
/// Returns `AtlasGraphError::Query` if nothing matches or the name is ambiguous.
pub fn resolve_node(graph: &CicdGraph, arg: &str) -> Result<NodeId, AtlasGraphError> {
    let id = NodeId(arg.to_string());
    if graph.contains_node(&id) {
        return Ok(id);
    }
    let mut matches: Vec<&NodeId> = graph.find_by_name(arg).map(|n| &n.id).collect();
    match matches.len() {
        0 => Err(AtlasGraphError::Query(format!("no node with id or name '{arg}'"))),
        1 => Ok(matches.remove(0).clone()),
        n => Err(AtlasGraphError::Query(format!(
            "name '{arg}' matches {n} nodes; pass a node id instead"
        ))),
    }
}

/// Cycles in the whole scope graph, each with its member names.
pub struct CycleDetectionQuery;

impl CycleDetectionQuery {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for CycleDetectionQuery {
    fn default() -> Self {
        Self
    }
}

#[derive(Debug, Serialize)]
pub struct CycleRow {
    pub ids: Vec<NodeId>,
    pub names: Vec<String>,
}

impl Query<(CycleReport, Vec<CycleRow>)> for CycleDetectionQuery {
    fn run(&self, graph: &CicdGraph) -> (CycleReport, Vec<CycleRow>) {
        let report = find_cycles(graph);
        let rows = report
            .cycles
            .iter()
            .map(|cyc| CycleRow {
                ids: cyc.clone(),
                names: cyc.iter().map(|id| display_name(graph, id)).collect(),
            })
            .collect();
        (report, rows)
    }
}

/// Shortest path between two nodes, optionally restricted to some edge kinds.
pub struct ShortestPathQuery {
    pub from: NodeId,
    pub to: NodeId,
    pub direction: Direction,
    pub kinds: Option<Vec<EdgeKind>>,
}

impl ShortestPathQuery {
    #[must_use]
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self { from, to, direction: Direction::Outgoing, kinds: None }
    }
}

impl Query<Vec<NodeId>> for ShortestPathQuery {
    fn run(&self, graph: &CicdGraph) -> Vec<NodeId> {
        let kinds: Option<BTreeSet<EdgeKind>> = self.kinds.as_ref().map(|k| k.iter().copied().collect());
        shortest_path(graph, &self.from, &self.to, self.direction, kinds.as_ref()).unwrap_or_default()
    }
}

/// Metric for degree centrality used by `HubsQuery`.
#[derive(Debug, Clone, Copy)]
pub enum CentralityMetric {
    In,
    Out,
    Total,
}

/// Top-N nodes by degree centrality.
pub struct HubsQuery {
    pub metric: CentralityMetric,
    pub top: usize,
    pub kind: Option<NodeKind>,
}

impl HubsQuery {
    #[must_use]
    pub fn new(metric: CentralityMetric, top: usize) -> Self {
        Self { metric, top, kind: None }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: Option<NodeKind>) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HubRow {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub in_degree: usize,
    pub out_degree: usize,
}

impl Query<Vec<HubRow>> for HubsQuery {
    fn run(&self, graph: &CicdGraph) -> Vec<HubRow> {
        let mut rows: Vec<HubRow> = graph
            .nodes()
            .filter(|n| self.kind.map_or(true, |k| n.kind == k))
            .map(|n| {
                let (i, o) = graph.degree(&n.id);
                HubRow { id: n.id.clone(), name: n.name.clone(), kind: n.kind, in_degree: i, out_degree: o }
            })
            .collect();
        let key = |r: &HubRow| match self.metric {
            CentralityMetric::In => r.in_degree,
            CentralityMetric::Out => r.out_degree,
            CentralityMetric::Total => r.in_degree + r.out_degree,
        };
        // Metric descending, then name and id for stable output
        rows.sort_by(|a, b| key(b).cmp(&key(a)).then_with(|| a.name.cmp(&b.name)).then_with(|| a.id.cmp(&b.id)));
        rows.truncate(self.top);
        rows
    }
}

#[derive(Debug, Serialize)]
pub struct NodeInfoRelationEntry {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub relation: String,
}

#[derive(Debug, Serialize)]
pub struct NodeInfoDoc {
    pub id: String,
    pub kind: String,
    pub last_seen_at: String,
    pub covers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeInfoResult {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub source_system: String,
    pub external_key: String,
    pub attributes: serde_json::Value,
    pub structure_changed_at: String,
    pub inbound: Vec<NodeInfoRelationEntry>,
    pub outbound: Vec<NodeInfoRelationEntry>,
    pub docs: Vec<NodeInfoDoc>,
}

/// Everything known about one node: attributes, neighbors and attached documentation.
pub struct NodeInfoQuery {
    pub node_id: NodeId,
}

impl NodeInfoQuery {
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self { node_id }
    }
}

impl Query<Option<NodeInfoResult>> for NodeInfoQuery {
    fn run(&self, graph: &CicdGraph) -> Option<NodeInfoResult> {
        let node = graph.node(&self.node_id)?;
        let entry = |id: &NodeId, kind: EdgeKind| NodeInfoRelationEntry {
            id: id.0.clone(),
            name: display_name(graph, id),
            kind: graph.node(id).map(|n| n.kind.to_string()).unwrap_or_default(),
            relation: kind.to_string(),
        };
        let inbound = graph.incoming(&node.id).map(|(id, k)| entry(id, *k)).collect();
        let outbound = graph.outgoing(&node.id).map(|(id, k)| entry(id, *k)).collect();
        let docs = graph
            .artifacts_for(&node.id)
            .map(|a| NodeInfoDoc {
                id: a.id.0.clone(),
                kind: a.kind.to_string(),
                last_seen_at: a.last_seen_at.to_rfc3339(),
                covers: a.covers.iter().cloned().collect(),
            })
            .collect();
        Some(NodeInfoResult {
            id: node.id.0.clone(),
            name: node.name.clone(),
            kind: node.kind.to_string(),
            source_system: node.source_system.clone(),
            external_key: node.external_key.clone(),
            attributes: serde_json::to_value(&node.attributes).unwrap_or(serde_json::Value::Null),
            structure_changed_at: node.structure_changed_at.to_rfc3339(),
            inbound,
            outbound,
            docs,
        })
    }
}

fn display_name(graph: &CicdGraph, id: &NodeId) -> String {
    graph.node(id).map_or_else(|| id.0.clone(), |n| n.name.clone())
}
