//! Cycle-safe walks over a `CicdGraph`.
//!
//! All walks use explicit stacks and queues, so arbitrarily deep chains and cyclic input
//! terminate without growing the call stack. Neighbors are visited in node id order, which makes
//! every walk deterministic for a given graph.
//!
//! A `Traversal` is a lazy iterator: nodes are produced one by one and the `CycleReport` becomes
//! available only once the walk has run to completion. Dropping the iterator early has no side
//! effects. Walks can be cancelled through a `CancelToken` or bounded by a time budget; a
//! cancelled walk never exposes its partial report.
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::AtlasGraphError;
pub use crate::graph::Direction;
use crate::graph::{CicdGraph, EdgeKind, Node, NodeId, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    /// Pre-order depth-first.
    #[default]
    DepthFirst,
    BreadthFirst,
    /// Kahn's algorithm over the cycle-free part of the reachable subgraph.
    Topological,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraversalRequest {
    pub start: Vec<NodeId>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub order: Order,
    /// Only follow these edge kinds; `None` follows all.
    #[serde(default)]
    pub edge_kinds: Option<BTreeSet<EdgeKind>>,
    #[serde(default)]
    pub max_depth: Option<usize>,
}

impl TraversalRequest {
    #[must_use]
    pub fn from_nodes<I: IntoIterator<Item = NodeId>>(start: I) -> Self {
        Self { start: start.into_iter().collect(), ..Default::default() }
    }

    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn edge_kinds<I: IntoIterator<Item = EdgeKind>>(mut self, kinds: I) -> Self {
        self.edge_kinds = Some(kinds.into_iter().collect());
        self
    }

    #[must_use]
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// Cycles found during a completed walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Each cycle lists node ids from the revisited node along the walk path.
    pub cycles: Vec<Vec<NodeId>>,
    /// Nodes in a non-trivial strongly connected component or carrying a self-loop.
    pub excluded: Vec<NodeId>,
}

impl CycleReport {
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalResult {
    pub order: Vec<NodeId>,
    pub report: CycleReport,
}

/// Shared flag checked by walks at every step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
struct Budget {
    cancel: Option<CancelToken>,
    limit: Option<Duration>,
    deadline: Option<Instant>,
}

impl Budget {
    fn arm(&mut self) {
        if self.deadline.is_none() {
            self.deadline = self.limit.map(|l| Instant::now() + l);
        }
    }

    fn exhausted(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

struct Cancelled;

/// Neighbor expansion rules shared by every walk.
#[derive(Clone)]
struct Walker<'g> {
    graph: &'g CicdGraph,
    direction: Direction,
    kinds: Option<BTreeSet<EdgeKind>>,
    max_depth: Option<usize>,
    within: Option<Arc<HashSet<NodeId>>>,
}

impl<'g> Walker<'g> {
    fn hops(&self, id: &NodeId, depth: usize) -> Vec<NodeId> {
        if self.max_depth.is_some_and(|m| depth >= m) {
            return Vec::new();
        }
        let mut hops = self.graph.neighbors(id, self.direction, self.kinds.as_ref());
        if let Some(within) = &self.within {
            hops.retain(|n| within.contains(n));
        }
        hops
    }

    /// Orientation used for cycle analysis: `Both` is analysed along `Outgoing` edges.
    fn oriented(&self, within: Option<Arc<HashSet<NodeId>>>) -> Walker<'g> {
        let direction = match self.direction {
            Direction::Both => Direction::Outgoing,
            d => d,
        };
        // `within` already bounds the analysis to what the walk reached
        Walker { direction, within, max_depth: None, ..self.clone() }
    }
}

struct Frame {
    node: NodeId,
    depth: usize,
    hops: Vec<NodeId>,
    next: usize,
    // re-expansion of a node reached again at a shallower depth; not part of SCC bookkeeping
    revisit: bool,
}

enum Step {
    NextRoot,
    Edge { from: NodeId, depth: usize, to: NodeId, revisit: bool },
    Pop,
}

/// Iterative depth-first walk that records path cycles and Tarjan SCCs as it goes.
struct Dfs {
    roots: Vec<NodeId>,
    next_root: usize,
    frames: Vec<Frame>,
    path_pos: HashMap<NodeId, usize>,
    visited: HashSet<NodeId>,
    depth_of: HashMap<NodeId, usize>,
    index: HashMap<NodeId, usize>,
    low: HashMap<NodeId, usize>,
    scc_stack: Vec<NodeId>,
    on_stack: HashSet<NodeId>,
    self_loops: HashSet<NodeId>,
    cyclic: BTreeSet<NodeId>,
    cycles: Vec<Vec<NodeId>>,
    seen_cycles: HashSet<Vec<NodeId>>,
}

impl Dfs {
    fn new(roots: Vec<NodeId>) -> Self {
        Self {
            roots,
            next_root: 0,
            frames: Vec::new(),
            path_pos: HashMap::new(),
            visited: HashSet::new(),
            depth_of: HashMap::new(),
            index: HashMap::new(),
            low: HashMap::new(),
            scc_stack: Vec::new(),
            on_stack: HashSet::new(),
            self_loops: HashSet::new(),
            cyclic: BTreeSet::new(),
            cycles: Vec::new(),
            seen_cycles: HashSet::new(),
        }
    }

    fn enter(&mut self, walker: &Walker<'_>, node: NodeId, depth: usize) {
        let idx = self.index.len();
        self.visited.insert(node.clone());
        self.depth_of.insert(node.clone(), depth);
        self.index.insert(node.clone(), idx);
        self.low.insert(node.clone(), idx);
        self.scc_stack.push(node.clone());
        self.on_stack.insert(node.clone());
        self.path_pos.insert(node.clone(), self.frames.len());
        let hops = walker.hops(&node, depth);
        self.frames.push(Frame { node, depth, hops, next: 0, revisit: false });
    }

    /// Expand an already yielded node again from a shorter path so the depth limit
    /// covers everything within `max_depth` hops.
    fn revisit(&mut self, walker: &Walker<'_>, node: NodeId, depth: usize) {
        self.depth_of.insert(node.clone(), depth);
        self.path_pos.insert(node.clone(), self.frames.len());
        let hops = walker.hops(&node, depth);
        self.frames.push(Frame { node, depth, hops, next: 0, revisit: true });
    }

    /// Advance until the next newly visited node, or `None` when every root is exhausted.
    fn step(&mut self, walker: &Walker<'_>) -> Option<NodeId> {
        loop {
            let step = match self.frames.last_mut() {
                None => Step::NextRoot,
                Some(top) if top.next < top.hops.len() => {
                    let to = top.hops[top.next].clone();
                    top.next += 1;
                    Step::Edge { from: top.node.clone(), depth: top.depth, to, revisit: top.revisit }
                }
                Some(_) => Step::Pop,
            };
            match step {
                Step::NextRoot => {
                    while self.next_root < self.roots.len() {
                        let root = self.roots[self.next_root].clone();
                        self.next_root += 1;
                        if !self.visited.contains(&root) {
                            self.enter(walker, root.clone(), 0);
                            return Some(root);
                        }
                    }
                    return None;
                }
                Step::Edge { from, depth, to, revisit } => {
                    if !self.visited.contains(&to) {
                        self.enter(walker, to.clone(), depth + 1);
                        return Some(to);
                    }
                    if walker.max_depth.is_some()
                        && !self.path_pos.contains_key(&to)
                        && self.depth_of.get(&to).is_some_and(|d| depth + 1 < *d)
                    {
                        self.revisit(walker, to, depth + 1);
                        continue;
                    }
                    if let Some(&pos) = self.path_pos.get(&to) {
                        if to == from {
                            self.self_loops.insert(to.clone());
                        }
                        self.record_cycle(pos);
                    }
                    if !revisit && self.on_stack.contains(&to) {
                        let to_idx = self.index[&to];
                        if let Some(low) = self.low.get_mut(&from) {
                            *low = (*low).min(to_idx);
                        }
                    }
                }
                Step::Pop => {
                    if let Some(frame) = self.frames.pop() {
                        self.path_pos.remove(&frame.node);
                        if frame.revisit {
                            continue;
                        }
                        self.close_component(&frame.node);
                        let child_low = self.low[&frame.node];
                        if let Some(parent) = self.frames.last().filter(|p| !p.revisit) {
                            if let Some(low) = self.low.get_mut(&parent.node) {
                                *low = (*low).min(child_low);
                            }
                        }
                    }
                }
            }
        }
    }

    fn record_cycle(&mut self, pos: usize) {
        let cycle: Vec<NodeId> = self.frames[pos..].iter().map(|f| f.node.clone()).collect();
        // Same cycle entered at a different node is the same rotation
        let mut canonical = cycle.clone();
        if let Some(min_at) =
            canonical.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)).map(|(i, _)| i)
        {
            canonical.rotate_left(min_at);
        }
        if self.seen_cycles.insert(canonical) {
            debug!(len = cycle.len(), "cycle detected");
            self.cycles.push(cycle);
        }
    }

    fn close_component(&mut self, node: &NodeId) {
        if self.low[node] != self.index[node] {
            return;
        }
        let mut component = Vec::new();
        while let Some(member) = self.scc_stack.pop() {
            self.on_stack.remove(&member);
            let done = member == *node;
            component.push(member);
            if done {
                break;
            }
        }
        if component.len() > 1 || self.self_loops.contains(node) {
            self.cyclic.extend(component);
        }
    }

    fn run(&mut self, walker: &Walker<'_>, budget: &Budget) -> Result<(), Cancelled> {
        loop {
            if budget.exhausted() {
                return Err(Cancelled);
            }
            if self.step(walker).is_none() {
                return Ok(());
            }
        }
    }

    fn report(&self) -> CycleReport {
        CycleReport { cycles: self.cycles.clone(), excluded: self.cyclic.iter().cloned().collect() }
    }
}

struct Bfs {
    queue: VecDeque<(NodeId, usize)>,
    seen: HashSet<NodeId>,
}

impl Bfs {
    fn new(roots: &[NodeId]) -> Self {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        for r in roots {
            if seen.insert(r.clone()) {
                queue.push_back((r.clone(), 0));
            }
        }
        Self { queue, seen }
    }

    fn step(&mut self, walker: &Walker<'_>) -> Option<NodeId> {
        let (node, depth) = self.queue.pop_front()?;
        for hop in walker.hops(&node, depth) {
            if self.seen.insert(hop.clone()) {
                self.queue.push_back((hop, depth + 1));
            }
        }
        Some(node)
    }
}

struct Kahn {
    ready: BTreeSet<NodeId>,
    indegree: HashMap<NodeId, usize>,
    successors: HashMap<NodeId, Vec<NodeId>>,
}

impl Kahn {
    fn new(walker: &Walker<'_>, nodes: &BTreeSet<NodeId>) -> Self {
        let mut indegree: HashMap<NodeId, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for u in nodes {
            for v in walker.graph.neighbors(u, walker.direction, walker.kinds.as_ref()) {
                if v != *u && nodes.contains(&v) {
                    if let Some(d) = indegree.get_mut(&v) {
                        *d += 1;
                    }
                    successors.entry(u.clone()).or_default().push(v);
                }
            }
        }
        let ready = indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| n.clone()).collect();
        Self { ready, indegree, successors }
    }

    fn step(&mut self) -> Option<NodeId> {
        let node = self.ready.pop_first()?;
        if let Some(next) = self.successors.remove(&node) {
            for v in next {
                if let Some(d) = self.indegree.get_mut(&v) {
                    *d -= 1;
                    if *d == 0 {
                        self.ready.insert(v);
                    }
                }
            }
        }
        Some(node)
    }
}

enum State {
    Dfs(Dfs),
    Bfs(Bfs),
    Topo(Option<Kahn>),
}

/// Lazy, restartable walk over a graph snapshot.
pub struct Traversal<'g> {
    graph: &'g CicdGraph,
    walker: Walker<'g>,
    roots: Vec<NodeId>,
    state: State,
    budget: Budget,
    yielded: Vec<NodeId>,
    report: Option<CycleReport>,
    cancelled: bool,
    finished: bool,
}

impl<'g> Traversal<'g> {
    #[must_use]
    pub fn new(graph: &'g CicdGraph, request: &TraversalRequest) -> Self {
        let mut roots: Vec<NodeId> =
            request.start.iter().filter(|id| graph.contains_node(id)).cloned().collect();
        roots.sort();
        roots.dedup();
        let walker = Walker {
            graph,
            direction: request.direction,
            kinds: request.edge_kinds.clone(),
            max_depth: request.max_depth,
            within: None,
        };
        let state = match request.order {
            Order::DepthFirst => State::Dfs(Dfs::new(roots.clone())),
            Order::BreadthFirst => State::Bfs(Bfs::new(&roots)),
            Order::Topological => State::Topo(None),
        };
        Self {
            graph,
            walker,
            roots,
            state,
            budget: Budget::default(),
            yielded: Vec::new(),
            report: None,
            cancelled: false,
            finished: false,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.budget.cancel = Some(token);
        self
    }

    /// Cancel the walk once `budget` has elapsed since the first step.
    #[must_use]
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget.limit = Some(budget);
        self
    }

    /// The cycle report, available only after the walk completed without cancellation.
    #[must_use]
    pub fn report(&self) -> Option<&CycleReport> {
        if self.cancelled {
            return None;
        }
        self.report.as_ref()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Drive the walk to the end and return the full visit order with its cycle report.
    ///
    /// # Errors
    /// Returns `AtlasGraphError::TraversalCancelled` if the token fired or the budget ran out.
    pub fn finish(mut self) -> Result<TraversalResult, AtlasGraphError> {
        while self.next().is_some() {}
        if self.cancelled {
            return Err(AtlasGraphError::TraversalCancelled);
        }
        Ok(TraversalResult { order: self.yielded, report: self.report.unwrap_or_default() })
    }

    fn cancel(&mut self) {
        warn!(visited = self.yielded.len(), "traversal cancelled");
        self.cancelled = true;
        self.report = None;
    }

    fn reachable(&self) -> Result<BTreeSet<NodeId>, Cancelled> {
        let mut bfs = Bfs::new(&self.roots);
        let mut out = BTreeSet::new();
        loop {
            if self.budget.exhausted() {
                return Err(Cancelled);
            }
            match bfs.step(&self.walker) {
                Some(n) => {
                    out.insert(n);
                }
                None => return Ok(out),
            }
        }
    }

    /// SCC and path-cycle analysis restricted to `nodes`.
    fn analyse(&self, nodes: &BTreeSet<NodeId>) -> Result<CycleReport, Cancelled> {
        let within: Arc<HashSet<NodeId>> = Arc::new(nodes.iter().cloned().collect());
        let analysis = self.walker.oriented(Some(within));
        let roots = match self.walker.direction {
            Direction::Both => nodes.iter().cloned().collect(),
            _ => self.roots.clone(),
        };
        let mut dfs = Dfs::new(roots);
        dfs.run(&analysis, &self.budget)?;
        Ok(dfs.report())
    }

    fn prepare_topo(&mut self) -> Result<Kahn, Cancelled> {
        let reachable = self.reachable()?;
        let report = self.analyse(&reachable)?;
        let excluded: HashSet<&NodeId> = report.excluded.iter().collect();
        let acyclic: BTreeSet<NodeId> =
            reachable.iter().filter(|n| !excluded.contains(n)).cloned().collect();
        let within: Arc<HashSet<NodeId>> = Arc::new(acyclic.iter().cloned().collect());
        let kahn = Kahn::new(&self.walker.oriented(Some(within)), &acyclic);
        self.report = Some(report);
        Ok(kahn)
    }

    fn complete(&mut self) {
        if self.report.is_none() {
            let report = match &self.state {
                State::Dfs(dfs)
                    if self.walker.direction != Direction::Both && self.walker.max_depth.is_none() =>
                {
                    Ok(dfs.report())
                }
                _ => {
                    let visited: BTreeSet<NodeId> = self.yielded.iter().cloned().collect();
                    self.analyse(&visited)
                }
            };
            match report {
                Ok(r) => self.report = Some(r),
                Err(Cancelled) => {
                    self.cancel();
                    return;
                }
            }
        }
        self.finished = true;
    }
}

impl<'g> Iterator for Traversal<'g> {
    type Item = &'g Node;

    fn next(&mut self) -> Option<&'g Node> {
        if self.finished || self.cancelled {
            return None;
        }
        self.budget.arm();
        if self.budget.exhausted() {
            self.cancel();
            return None;
        }
        if matches!(self.state, State::Topo(None)) {
            match self.prepare_topo() {
                Ok(kahn) => self.state = State::Topo(Some(kahn)),
                Err(Cancelled) => {
                    self.cancel();
                    return None;
                }
            }
        }
        let next = match &mut self.state {
            State::Dfs(dfs) => dfs.step(&self.walker),
            State::Bfs(bfs) => bfs.step(&self.walker),
            State::Topo(kahn) => kahn.as_mut().and_then(Kahn::step),
        };
        match next {
            Some(id) => {
                let node = self.graph.node(&id);
                self.yielded.push(id);
                node
            }
            None => {
                self.complete();
                None
            }
        }
    }
}

/// Start a lazy walk.
#[must_use]
pub fn traverse<'g>(graph: &'g CicdGraph, request: &TraversalRequest) -> Traversal<'g> {
    Traversal::new(graph, request)
}

/// Enumerate cycles over every node of the graph along outgoing edges.
#[must_use]
pub fn find_cycles(graph: &CicdGraph) -> CycleReport {
    let request = TraversalRequest::from_nodes(graph.node_ids().cloned());
    let walker = Walker {
        graph,
        direction: Direction::Outgoing,
        kinds: request.edge_kinds,
        max_depth: None,
        within: None,
    };
    let mut dfs = Dfs::new(request.start);
    while dfs.step(&walker).is_some() {}
    dfs.report()
}

/// BFS shortest path from `from` to `to`; ties resolve toward lower node ids.
#[must_use]
pub fn shortest_path(
    graph: &CicdGraph,
    from: &NodeId,
    to: &NodeId,
    direction: Direction,
    kinds: Option<&BTreeSet<EdgeKind>>,
) -> Option<Vec<NodeId>> {
    if !graph.contains_node(from) || !graph.contains_node(to) {
        return None;
    }
    if from == to {
        return Some(vec![from.clone()]);
    }
    let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
    let mut seen: HashSet<NodeId> = HashSet::from([from.clone()]);
    let mut queue: VecDeque<NodeId> = VecDeque::from([from.clone()]);
    while let Some(cur) = queue.pop_front() {
        for next in graph.neighbors(&cur, direction, kinds) {
            if !seen.insert(next.clone()) {
                continue;
            }
            parent.insert(next.clone(), cur.clone());
            if next == *to {
                let mut path = vec![next.clone()];
                let mut at = next;
                while let Some(p) = parent.get(&at) {
                    path.push(p.clone());
                    at = p.clone();
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }
    None
}

/// One-hop neighborhood of a node and its structural fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighborhood {
    pub members: Vec<(NodeId, NodeKind)>,
    pub fingerprint: String,
}

#[must_use]
pub fn neighborhood(graph: &CicdGraph, id: &NodeId) -> Neighborhood {
    let request = TraversalRequest::from_nodes([id.clone()])
        .direction(Direction::Both)
        .order(Order::BreadthFirst)
        .max_depth(1);
    let mut members: Vec<(NodeId, NodeKind)> = Traversal::new(graph, &request)
        .filter(|n| n.id != *id)
        .map(|n| (n.id.clone(), n.kind))
        .collect();
    members.sort();
    let fingerprint = fingerprint_of(&members);
    Neighborhood { members, fingerprint }
}

/// SHA-256 hex over sorted `(id, kind)` pairs.
#[must_use]
pub fn fingerprint_of(members: &[(NodeId, NodeKind)]) -> String {
    let mut hasher = Sha256::new();
    for (id, kind) in members {
        hasher.update(id.0.as_bytes());
        hasher.update(b":");
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}
