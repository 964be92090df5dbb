//! Structural diff between two revisions of a scope graph.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::graph::{CicdGraph, Edge, EdgeKind, Node, NodeId, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChange {
    pub change: ChangeType,
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    /// Attribute keys whose values differ, for modified nodes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeChange {
    pub change: ChangeType,
    pub kind: EdgeKind,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDiff {
    pub node_changes: Vec<NodeChange>,
    pub edge_changes: Vec<EdgeChange>,
}

impl GraphDiff {
    #[must_use]
    pub fn total_changes(&self) -> usize {
        self.node_changes.len() + self.edge_changes.len()
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    pub fn nodes_with(&self, change: ChangeType) -> impl Iterator<Item = &NodeChange> {
        self.node_changes.iter().filter(move |c| c.change == change)
    }

    pub fn edges_with(&self, change: ChangeType) -> impl Iterator<Item = &EdgeChange> {
        self.edge_changes.iter().filter(move |c| c.change == change)
    }
}

fn changed_fields(before: &Node, after: &Node) -> Vec<String> {
    let mut fields = Vec::new();
    if before.source_system != after.source_system {
        fields.push("source_system".to_string());
    }
    let keys: BTreeSet<&String> = before.attributes.keys().chain(after.attributes.keys()).collect();
    for k in keys {
        if before.attributes.get(k) != after.attributes.get(k) {
            fields.push(k.clone());
        }
    }
    fields
}

fn endpoint_name(graph: &CicdGraph, id: &NodeId) -> String {
    graph.node(id).map_or_else(|| id.to_string(), |n| n.name.clone())
}

type NodeKey<'a> = (NodeKind, &'a str);
type EdgeKey = (EdgeKind, String, String);

fn node_index(graph: &CicdGraph) -> BTreeMap<NodeKey<'_>, &Node> {
    graph.nodes().map(|n| ((n.kind, n.name.as_str()), n)).collect()
}

fn edge_index(graph: &CicdGraph) -> BTreeSet<EdgeKey> {
    graph
        .edges()
        .map(|e: &Edge| (e.kind, endpoint_name(graph, &e.from), endpoint_name(graph, &e.to)))
        .collect()
}

fn removed_or_added(change: ChangeType, node: &Node) -> NodeChange {
    NodeChange { change, id: node.id.clone(), kind: node.kind, name: node.name.clone(), fields: Vec::new() }
}

/// Compare two snapshots, matching nodes by kind and name so graphs from different sources line up.
#[must_use]
pub fn diff_graphs(before: &CicdGraph, after: &CicdGraph) -> GraphDiff {
    let mut out = GraphDiff::default();
    let old = node_index(before);
    let new = node_index(after);

    for (key, node) in &old {
        match new.get(key) {
            None => out.node_changes.push(removed_or_added(ChangeType::Removed, node)),
            Some(updated) => {
                let fields = changed_fields(node, updated);
                if !fields.is_empty() {
                    out.node_changes.push(NodeChange {
                        change: ChangeType::Modified,
                        id: updated.id.clone(),
                        kind: updated.kind,
                        name: updated.name.clone(),
                        fields,
                    });
                }
            }
        }
    }
    for (key, node) in &new {
        if !old.contains_key(key) {
            out.node_changes.push(removed_or_added(ChangeType::Added, node));
        }
    }
    out.node_changes.sort_by(|a, b| (a.kind, &a.name, a.change as u8).cmp(&(b.kind, &b.name, b.change as u8)));

    let old_edges = edge_index(before);
    let new_edges = edge_index(after);
    for (kind, from, to) in old_edges.difference(&new_edges) {
        out.edge_changes.push(EdgeChange { change: ChangeType::Removed, kind: *kind, from: from.clone(), to: to.clone() });
    }
    for (kind, from, to) in new_edges.difference(&old_edges) {
        out.edge_changes.push(EdgeChange { change: ChangeType::Added, kind: *kind, from: from.clone(), to: to.clone() });
    }
    out
}

/// Per-kind counts of added and removed nodes, for summaries.
#[must_use]
pub fn summarize(diff: &GraphDiff) -> BTreeMap<NodeKind, (usize, usize)> {
    let mut m: BTreeMap<NodeKind, (usize, usize)> = BTreeMap::new();
    for c in &diff.node_changes {
        let e = m.entry(c.kind).or_default();
        match c.change {
            ChangeType::Added => e.0 += 1,
            ChangeType::Removed => e.1 += 1,
            ChangeType::Modified => {}
        }
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::{fixture, node, ts};

    #[test]
    fn identical_graphs_have_no_changes() {
        let g = fixture(&[("a", NodeKind::Job)], &[]);
        let d = diff_graphs(&g, &g.clone());
        assert!(!d.has_changes());
    }

    #[test]
    fn detects_added_removed_and_modified() {
        let before = fixture(
            &[("build", NodeKind::Job), ("lint", NodeKind::Job)],
            &[("lint", "build", EdgeKind::Needs)],
        );
        let mut after = fixture(
            &[("build", NodeKind::Job), ("test", NodeKind::Job)],
            &[("test", "build", EdgeKind::Needs)],
        );
        let mut b = node("build", NodeKind::Job);
        b.attributes.insert("image".into(), serde_json::json!("rust:1.80"));
        after.upsert_node(b, ts(1));

        let d = diff_graphs(&before, &after);
        let added: Vec<&str> = d.nodes_with(ChangeType::Added).map(|c| c.name.as_str()).collect();
        let removed: Vec<&str> = d.nodes_with(ChangeType::Removed).map(|c| c.name.as_str()).collect();
        assert_eq!(added, vec!["test"]);
        assert_eq!(removed, vec!["lint"]);
        let modified: Vec<&NodeChange> = d.nodes_with(ChangeType::Modified).collect();
        assert_eq!(modified.len(), 1);
        assert_eq!(modified[0].fields, vec!["image".to_string()]);

        assert_eq!(d.edges_with(ChangeType::Added).count(), 1);
        let gone = d.edges_with(ChangeType::Removed).next().unwrap();
        assert_eq!((gone.from.as_str(), gone.to.as_str()), ("lint", "build"));
        assert_eq!(d.total_changes(), 5);
        assert_eq!(summarize(&d)[&NodeKind::Job], (1, 1));
    }
}
