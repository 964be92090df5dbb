//! Batch ingestion: identity resolution, merge rules, pending edges and snapshot publication.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::RecordRejection;
use crate::graph::identity::{artifact_id_for, default_external_key, ExternalRef, IdentityResolver};
use crate::graph::{
    ArtifactId, Attributes, CicdGraph, DocKind, DocumentationArtifact, Edge, EdgeKind, Node,
    NodeChange, NodeId, NodeKind,
};
use crate::traversal::neighborhood;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawNode {
    pub source_system: String,
    /// Falls back to `kind:name` when the producer has no key of its own.
    #[serde(default)]
    pub external_key: Option<String>,
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl RawNode {
    #[must_use]
    pub fn external_ref(&self) -> ExternalRef {
        let key = match &self.external_key {
            Some(k) if !k.trim().is_empty() => k.clone(),
            _ => default_external_key(self.kind, &self.name),
        };
        ExternalRef { source_system: self.source_system.clone(), external_key: key }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEdge {
    pub from: ExternalRef,
    pub to: ExternalRef,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDocRef {
    pub source_system: String,
    pub external_key: String,
    /// The documented node.
    pub node: ExternalRef,
    pub kind: DocKind,
    pub content_hash: String,
    #[serde(default)]
    pub covers: BTreeSet<String>,
    #[serde(default)]
    pub seen_at: Option<DateTime<Utc>>,
}

/// One decoded producer record.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    UpsertNode(RawNode),
    UpsertEdge(RawEdge),
    UpsertDoc(RawDocRef),
    DeleteNode(ExternalRef),
    DeleteEdge(RawEdge),
    DeleteDoc(ExternalRef),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Accepted,
    /// Staged until a referenced node arrives.
    Pending,
    Rejected { reason: RecordRejection },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordOutcome {
    pub index: usize,
    pub status: RecordStatus,
}

/// Summary of one ingested batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestResult {
    pub scope: String,
    /// Graph revision after the batch.
    pub revision: u64,
    pub processed_at: DateTime<Utc>,
    pub accepted: usize,
    pub rejected: usize,
    pub pending: usize,
    /// Previously staged edges and docs attached during this batch.
    pub promoted: usize,
    pub outcomes: Vec<RecordOutcome>,
    /// Staged records that outlived the retention window.
    pub dropped_pending: Vec<RecordRejection>,
    /// Nodes whose coverage score may have changed.
    pub touched: BTreeSet<NodeId>,
    pub bulk: bool,
    pub changed: bool,
}

impl IngestResult {
    /// Recount `accepted`/`rejected`/`pending` from `outcomes`.
    pub fn recount(&mut self) {
        self.accepted = 0;
        self.rejected = 0;
        self.pending = 0;
        for o in &self.outcomes {
            match o.status {
                RecordStatus::Accepted => self.accepted += 1,
                RecordStatus::Pending => self.pending += 1,
                RecordStatus::Rejected { .. } => self.rejected += 1,
            }
        }
    }

    pub fn rejections(&self) -> impl Iterator<Item = (usize, &RecordRejection)> {
        self.outcomes.iter().filter_map(|o| match &o.status {
            RecordStatus::Rejected { reason } => Some((o.index, reason)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// How long a staged edge or doc waits for its missing node.
    pub pending_retention: Duration,
    /// A batch touching more than this share of the graph is flagged as bulk.
    pub bulk_ratio: f64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self { pending_retention: Duration::seconds(3600), bulk_ratio: 0.25 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Staged {
    Edge(Edge),
    Doc(ArtifactId),
}

#[derive(Debug, Clone, Default)]
struct PendingArea {
    edges: BTreeMap<Edge, DateTime<Utc>>,
    docs: BTreeMap<ArtifactId, (DocumentationArtifact, DateTime<Utc>)>,
    // missing node id -> staged records waiting on it
    waiting: BTreeMap<NodeId, BTreeSet<Staged>>,
}

impl PendingArea {
    fn contains(&self, s: &Staged) -> bool {
        match s {
            Staged::Edge(e) => self.edges.contains_key(e),
            Staged::Doc(a) => self.docs.contains_key(a),
        }
    }

    fn unindex(&mut self, id: &NodeId, s: &Staged) {
        if let Some(set) = self.waiting.get_mut(id) {
            set.remove(s);
            if set.is_empty() {
                self.waiting.remove(id);
            }
        }
    }

    fn stage_edge(&mut self, edge: Edge, missing: &[NodeId], now: DateTime<Utc>) {
        for m in missing {
            self.waiting.entry(m.clone()).or_default().insert(Staged::Edge(edge.clone()));
        }
        self.edges.entry(edge).or_insert(now);
    }

    fn unstage_edge(&mut self, edge: &Edge) -> bool {
        if self.edges.remove(edge).is_none() {
            return false;
        }
        let s = Staged::Edge(edge.clone());
        self.unindex(&edge.from, &s);
        self.unindex(&edge.to, &s);
        true
    }

    fn stage_doc(&mut self, art: DocumentationArtifact, now: DateTime<Utc>) {
        let missing = art.node_id.clone();
        let id = art.id.clone();
        // Keep the original staging time so redelivery cannot extend retention
        let staged_at = self.docs.get(&id).map_or(now, |(_, t)| *t);
        if let Some((prev, _)) = self.docs.get(&id) {
            if prev.node_id != missing {
                let old = prev.node_id.clone();
                self.unindex(&old, &Staged::Doc(id.clone()));
            }
        }
        self.waiting.entry(missing).or_default().insert(Staged::Doc(id.clone()));
        self.docs.insert(id, (art, staged_at));
    }

    fn unstage_doc(&mut self, id: &ArtifactId) -> bool {
        match self.docs.remove(id) {
            Some((art, _)) => {
                self.unindex(&art.node_id, &Staged::Doc(id.clone()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.edges.len() + self.docs.len()
    }
}

struct BatchState {
    now: DateTime<Utc>,
    touched: BTreeSet<NodeId>,
    refresh_docs: BTreeSet<ArtifactId>,
    promoted: usize,
    changed: bool,
}

/// Owns all mutation of one scope's graph.
///
/// Each batch is applied to a private copy; the copy replaces the published snapshot only when
/// the whole batch has been processed, so readers holding `snapshot()` never see partial state.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    graph: Arc<CicdGraph>,
    resolver: IdentityResolver,
    pending: PendingArea,
    config: BuilderConfig,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(scope: &str, config: BuilderConfig) -> Self {
        Self::from_graph(CicdGraph::new(scope), config)
    }

    /// Continue building on a previously persisted graph.
    #[must_use]
    pub fn from_graph(graph: CicdGraph, config: BuilderConfig) -> Self {
        Self {
            graph: Arc::new(graph),
            resolver: IdentityResolver::new(),
            pending: PendingArea::default(),
            config,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<CicdGraph> {
        Arc::clone(&self.graph)
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        self.graph.scope()
    }

    /// Staged edges plus staged documentation references.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn ingest(&mut self, batch: &[Record]) -> IngestResult {
        self.ingest_at(batch, Utc::now())
    }

    /// Apply a batch as of `now`. Later records in the batch win over earlier ones.
    pub fn ingest_at(&mut self, batch: &[Record], now: DateTime<Utc>) -> IngestResult {
        let mut working: CicdGraph = (*self.graph).clone();
        let mut st = BatchState {
            now,
            touched: BTreeSet::new(),
            refresh_docs: BTreeSet::new(),
            promoted: 0,
            changed: false,
        };
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut staged_by: Vec<(usize, Staged)> = Vec::new();

        for (index, record) in batch.iter().enumerate() {
            let status = match self.apply(&mut working, &mut st, record) {
                Ok(None) => RecordStatus::Accepted,
                Ok(Some(staged)) => {
                    staged_by.push((index, staged));
                    RecordStatus::Pending
                }
                Err(reason) => {
                    debug!(index, %reason, "record rejected");
                    RecordStatus::Rejected { reason }
                }
            };
            outcomes.push(RecordOutcome { index, status });
        }

        // Records staged earlier in this batch may have been promoted by later ones
        for (index, staged) in staged_by {
            if !self.pending.contains(&staged) {
                outcomes[index].status = RecordStatus::Accepted;
            }
        }

        let dropped_pending = self.expire(&working, now);

        for art_id in std::mem::take(&mut st.refresh_docs) {
            let Some(node_id) = working.artifact(&art_id).map(|a| a.node_id.clone()) else {
                continue;
            };
            let hood = neighborhood(&working, &node_id);
            if let Some(art) = working.artifact_mut(&art_id) {
                art.fingerprint = hood.fingerprint;
                art.neighborhood = hood.members.into_iter().map(|(id, _)| id).collect();
            }
        }

        if st.changed {
            working.metadata.revision += 1;
            working.metadata.updated_at = Some(now);
        }

        let node_count = working.node_count();
        let bulk = !st.touched.is_empty()
            && (st.touched.len() as f64) > self.config.bulk_ratio * node_count as f64;

        let mut result = IngestResult {
            scope: working.scope().to_string(),
            revision: working.metadata.revision,
            processed_at: now,
            accepted: 0,
            rejected: 0,
            pending: 0,
            promoted: st.promoted,
            outcomes,
            dropped_pending,
            touched: st.touched,
            bulk,
            changed: st.changed,
        };
        result.recount();

        if st.changed {
            self.graph = Arc::new(working);
        }

        info!(
            scope = %result.scope,
            revision = result.revision,
            accepted = result.accepted,
            rejected = result.rejected,
            pending = result.pending,
            promoted = result.promoted,
            dropped = result.dropped_pending.len(),
            touched = result.touched.len(),
            bulk = result.bulk,
            "batch ingested"
        );
        result
    }

    fn apply(
        &mut self,
        g: &mut CicdGraph,
        st: &mut BatchState,
        record: &Record,
    ) -> Result<Option<Staged>, RecordRejection> {
        match record {
            Record::UpsertNode(raw) => self.upsert_node(g, st, raw).map(|()| None),
            Record::UpsertEdge(raw) => self.upsert_edge(g, st, raw),
            Record::UpsertDoc(raw) => self.upsert_doc(g, st, raw),
            Record::DeleteNode(r) => {
                check_ref(r)?;
                let id = self.resolver.forget(r);
                if let Some(neighbors) = g.remove_node(&id, st.now) {
                    debug!(node = %id, "node deleted");
                    st.touched.insert(id);
                    st.touched.extend(neighbors);
                    st.changed = true;
                }
                Ok(None)
            }
            Record::DeleteEdge(raw) => {
                let edge = self.resolve_edge(raw)?;
                if g.remove_edge(&edge, st.now) {
                    st.touched.insert(edge.from.clone());
                    st.touched.insert(edge.to.clone());
                    st.changed = true;
                } else {
                    self.pending.unstage_edge(&edge);
                }
                Ok(None)
            }
            Record::DeleteDoc(r) => {
                check_ref(r)?;
                let art_id = artifact_id_for(&r.source_system, &r.external_key);
                if let Some(art) = g.remove_artifact(&art_id) {
                    st.touched.insert(art.node_id);
                    st.changed = true;
                } else {
                    self.pending.unstage_doc(&art_id);
                }
                Ok(None)
            }
        }
    }

    fn upsert_node(
        &mut self,
        g: &mut CicdGraph,
        st: &mut BatchState,
        raw: &RawNode,
    ) -> Result<(), RecordRejection> {
        if raw.name.trim().is_empty() {
            return Err(RecordRejection::Malformed("node without a name".to_string()));
        }
        let r = raw.external_ref();
        check_ref(&r)?;
        let id = self.resolver.resolve(&r);
        if let Some(existing) = g.node(&id) {
            if existing.kind != raw.kind {
                return Err(RecordRejection::IdentityConflict {
                    node: id,
                    existing: existing.kind.to_string(),
                    incoming: raw.kind.to_string(),
                });
            }
        }
        let node = Node {
            id: id.clone(),
            kind: raw.kind,
            name: raw.name.trim().to_string(),
            source_system: r.source_system.trim().to_string(),
            external_key: r.external_key.trim().to_string(),
            attributes: raw.attributes.clone(),
            doc_refs: BTreeSet::new(),
            structure_changed_at: st.now,
        };
        match g.upsert_node(node, st.now) {
            NodeChange::Created => {
                st.touched.insert(id.clone());
                st.changed = true;
                self.promote(g, st, &id);
            }
            NodeChange::Updated => {
                st.touched.insert(id);
                st.changed = true;
            }
            NodeChange::Unchanged => {
                debug!(node = %id, "duplicate node record skipped");
            }
        }
        Ok(())
    }

    fn resolve_edge(&mut self, raw: &RawEdge) -> Result<Edge, RecordRejection> {
        check_ref(&raw.from)?;
        check_ref(&raw.to)?;
        Ok(Edge {
            from: self.resolver.resolve(&raw.from),
            to: self.resolver.resolve(&raw.to),
            kind: raw.kind,
        })
    }

    fn upsert_edge(
        &mut self,
        g: &mut CicdGraph,
        st: &mut BatchState,
        raw: &RawEdge,
    ) -> Result<Option<Staged>, RecordRejection> {
        let edge = self.resolve_edge(raw)?;
        let mut missing: Vec<NodeId> = Vec::new();
        if !g.contains_node(&edge.from) {
            missing.push(edge.from.clone());
        }
        if !g.contains_node(&edge.to) && edge.to != edge.from {
            missing.push(edge.to.clone());
        }
        if missing.is_empty() {
            self.insert_edge(g, st, edge);
            return Ok(None);
        }
        debug!(from = %edge.from, to = %edge.to, kind = %edge.kind, "edge staged until endpoints arrive");
        self.pending.stage_edge(edge.clone(), &missing, st.now);
        Ok(Some(Staged::Edge(edge)))
    }

    fn insert_edge(&mut self, g: &mut CicdGraph, st: &mut BatchState, edge: Edge) {
        let (from, to) = (edge.from.clone(), edge.to.clone());
        if g.insert_edge(edge, st.now) {
            st.touched.insert(from);
            st.touched.insert(to);
            st.changed = true;
        }
    }

    fn upsert_doc(
        &mut self,
        g: &mut CicdGraph,
        st: &mut BatchState,
        raw: &RawDocRef,
    ) -> Result<Option<Staged>, RecordRejection> {
        if raw.source_system.trim().is_empty() || raw.external_key.trim().is_empty() {
            return Err(RecordRejection::Malformed(
                "documentation reference without source_system/external_key".to_string(),
            ));
        }
        check_ref(&raw.node)?;
        let node_id = self.resolver.resolve(&raw.node);
        let art = DocumentationArtifact {
            id: artifact_id_for(&raw.source_system, &raw.external_key),
            node_id: node_id.clone(),
            kind: raw.kind,
            content_hash: raw.content_hash.trim().to_string(),
            last_seen_at: raw.seen_at.unwrap_or(st.now),
            covers: raw.covers.clone(),
            fingerprint: String::new(),
            neighborhood: Vec::new(),
        };
        if !g.contains_node(&node_id) {
            let id = art.id.clone();
            self.pending.stage_doc(art, st.now);
            return Ok(Some(Staged::Doc(id)));
        }
        Self::attach_doc(g, st, art);
        Ok(None)
    }

    fn attach_doc(g: &mut CicdGraph, st: &mut BatchState, art: DocumentationArtifact) {
        let unchanged = g.artifact(&art.id).is_some_and(|prev| {
            prev.content_hash == art.content_hash
                && prev.node_id == art.node_id
                && prev.kind == art.kind
                && prev.covers == art.covers
        });
        if unchanged {
            debug!(artifact = %art.id, "documentation reference unchanged");
            return;
        }
        if let Some(prev) = g.artifact(&art.id) {
            st.touched.insert(prev.node_id.clone());
        }
        st.touched.insert(art.node_id.clone());
        st.refresh_docs.insert(art.id.clone());
        st.changed = true;
        g.upsert_artifact(art);
    }

    /// Attach everything that was waiting on `id` and is now complete.
    fn promote(&mut self, g: &mut CicdGraph, st: &mut BatchState, id: &NodeId) {
        let Some(staged) = self.pending.waiting.remove(id) else {
            return;
        };
        for s in staged {
            match s {
                Staged::Edge(edge) => {
                    if !(g.contains_node(&edge.from) && g.contains_node(&edge.to)) {
                        // Still indexed under the other missing endpoint
                        continue;
                    }
                    self.pending.unstage_edge(&edge);
                    debug!(from = %edge.from, to = %edge.to, "pending edge promoted");
                    st.promoted += 1;
                    self.insert_edge(g, st, edge);
                }
                Staged::Doc(art_id) => {
                    if let Some((mut art, _)) = self.pending.docs.remove(&art_id) {
                        // Attached from this batch on
                        art.last_seen_at = art.last_seen_at.max(st.now);
                        st.promoted += 1;
                        Self::attach_doc(g, st, art);
                    }
                }
            }
        }
    }

    /// Drop staged records older than the retention window.
    fn expire(&mut self, graph: &CicdGraph, now: DateTime<Utc>) -> Vec<RecordRejection> {
        let cutoff = now - self.config.pending_retention;
        let mut dropped = Vec::new();

        let stale_edges: Vec<Edge> =
            self.pending.edges.iter().filter(|(_, t)| **t < cutoff).map(|(e, _)| e.clone()).collect();
        for edge in stale_edges {
            self.pending.unstage_edge(&edge);
            let missing = if graph.contains_node(&edge.from) { edge.to.clone() } else { edge.from.clone() };
            warn!(from = %edge.from, to = %edge.to, kind = %edge.kind, "dropping dangling edge");
            dropped.push(RecordRejection::DanglingEdge {
                from: edge.from,
                to: edge.to,
                kind: edge.kind.to_string(),
                missing,
            });
        }

        let stale_docs: Vec<ArtifactId> = self
            .pending
            .docs
            .iter()
            .filter(|(_, (_, t))| *t < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_docs {
            if let Some((art, _)) = self.pending.docs.get(&id) {
                let missing = art.node_id.clone();
                warn!(artifact = %id, node = %missing, "dropping documentation for missing node");
                self.pending.unstage_doc(&id);
                dropped.push(RecordRejection::DanglingDoc { artifact: id, missing });
            }
        }
        dropped
    }
}

fn check_ref(r: &ExternalRef) -> Result<(), RecordRejection> {
    if r.source_system.trim().is_empty() || r.external_key.trim().is_empty() {
        return Err(RecordRejection::Malformed(
            "reference without source_system/external_key".to_string(),
        ));
    }
    Ok(())
}
