use std::collections::{BTreeSet, HashMap};

use atlas_graph::docs::{DocConfig, DocScorer};
use atlas_graph::graph::builder::{BuilderConfig, GraphBuilder, RawDocRef, RawEdge, RawNode, Record};
use atlas_graph::graph::identity::{node_id_for, ExternalRef};
use atlas_graph::graph::{Attributes, DocKind, EdgeKind, NodeKind};
use atlas_graph::traversal::{traverse, Direction, Order, TraversalRequest};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

const JOB_KEYS: [&str; 5] = ["script", "image", "environment", "artifacts", "when"];

fn node(i: usize) -> Record {
    Record::UpsertNode(RawNode {
        source_system: "ci".into(),
        external_key: Some(format!("n{i}")),
        kind: NodeKind::Job,
        name: format!("job-{i}"),
        attributes: Attributes::new(),
    })
}

fn edge(a: usize, b: usize, k: usize) -> Record {
    Record::UpsertEdge(RawEdge {
        from: ExternalRef::new("ci", &format!("n{a}")),
        to: ExternalRef::new("ci", &format!("n{b}")),
        kind: EdgeKind::ALL[k % EdgeKind::ALL.len()],
    })
}

fn graph_batch() -> impl Strategy<Value = (usize, Vec<Record>)> {
    (1usize..24).prop_flat_map(|n| {
        prop::collection::vec((0..n, 0..n, 0usize..8), 0..(n * 3)).prop_map(move |edges| {
            let mut batch: Vec<Record> = (0..n).map(node).collect();
            batch.extend(edges.into_iter().map(|(a, b, k)| edge(a, b, k)));
            (n, batch)
        })
    })
}

fn mask_to_keys(mask: u8) -> BTreeSet<String> {
    JOB_KEYS.iter().enumerate().filter(|(i, _)| mask & (1 << i) != 0).map(|(_, k)| (*k).to_string()).collect()
}

proptest! {
    #[test]
    fn ingesting_the_same_batch_twice_changes_nothing((_, batch) in graph_batch()) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let mut b = GraphBuilder::new("p", BuilderConfig::default());
        b.ingest_at(&batch, now);
        let first = b.snapshot();
        let again = b.ingest_at(&batch, now + chrono::Duration::seconds(1));
        prop_assert!(!again.changed);
        prop_assert_eq!(&*b.snapshot(), &*first);
    }

    #[test]
    fn every_walk_terminates_deterministically((n, batch) in graph_batch(), start in 0usize..24, dir in 0usize..3, ord in 0usize..3) {
        let mut b = GraphBuilder::new("p", BuilderConfig::default());
        b.ingest_at(&batch, Utc::now());
        let g = b.snapshot();
        let direction = [Direction::Outgoing, Direction::Incoming, Direction::Both][dir];
        let order = [Order::DepthFirst, Order::BreadthFirst, Order::Topological][ord];
        let req = TraversalRequest::from_nodes([node_id_for("ci", &format!("n{}", start % n))])
            .direction(direction)
            .order(order);

        let one = traverse(&g, &req).finish().unwrap();
        let two = traverse(&g, &req).finish().unwrap();
        prop_assert_eq!(&one, &two);
        let unique: BTreeSet<_> = one.order.iter().collect();
        prop_assert_eq!(unique.len(), one.order.len());
        prop_assert!(one.order.len() <= n);

        if order == Order::Topological && direction == Direction::Outgoing {
            let pos: HashMap<_, _> = one.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
            for e in g.edges() {
                if let (Some(a), Some(b)) = (pos.get(&e.from), pos.get(&e.to)) {
                    prop_assert!(a < b, "edge {} -> {} out of order", e.from, e.to);
                }
            }
        }
    }

    #[test]
    fn more_documentation_never_lowers_a_score(attr_mask in 0u8..32, first in 0u8..32, second in 0u8..32) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let attributes: Attributes = mask_to_keys(attr_mask)
            .into_iter()
            .map(|k| (k, serde_json::json!("x")))
            .collect();
        let job = Record::UpsertNode(RawNode {
            source_system: "ci".into(),
            external_key: Some("j".into()),
            kind: NodeKind::Job,
            name: "j".into(),
            attributes,
        });
        let doc = |key: &str, mask: u8| Record::UpsertDoc(RawDocRef {
            source_system: "wiki".into(),
            external_key: key.into(),
            node: ExternalRef::new("ci", "j"),
            kind: DocKind::ReadmeSection,
            content_hash: format!("h-{key}"),
            covers: mask_to_keys(mask),
            seen_at: None,
        });
        let scorer = DocScorer::new(DocConfig::default());
        let id = node_id_for("ci", "j");

        let mut b = GraphBuilder::new("p", BuilderConfig::default());
        b.ingest_at(&[job], now);
        let bare = scorer.score_node(&b.snapshot(), &id).unwrap().score;
        b.ingest_at(&[doc("a", first)], now);
        let one = scorer.score_node(&b.snapshot(), &id).unwrap().score;
        b.ingest_at(&[doc("b", second)], now);
        let two = scorer.score_node(&b.snapshot(), &id).unwrap().score;
        prop_assert_eq!(bare, 0.0);
        prop_assert!(bare < one, "first real doc must raise the score");
        prop_assert!(one <= two);
        prop_assert!((0.0..=1.0).contains(&two));
    }

    #[test]
    fn documenting_any_node_never_lowers_aggregate_coverage(
        (n, batch) in graph_batch(),
        documented in prop::collection::vec((0usize..24, 0u8..32), 0..6),
        target in 0usize..24,
        mask in 0u8..32,
    ) {
        let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let doc = |node: usize, key: String, mask: u8| Record::UpsertDoc(RawDocRef {
            source_system: "wiki".into(),
            external_key: key.clone(),
            node: ExternalRef::new("ci", &format!("n{}", node % n)),
            kind: DocKind::Adr,
            content_hash: format!("h-{key}"),
            covers: mask_to_keys(mask),
            seen_at: None,
        });
        let mut b = GraphBuilder::new("p", BuilderConfig::default());
        b.ingest_at(&batch, now);
        let existing: Vec<Record> =
            documented.iter().enumerate().map(|(i, (node, m))| doc(*node, format!("d{i}"), *m)).collect();
        b.ingest_at(&existing, now);
        let scorer = DocScorer::new(DocConfig::default());
        let before = scorer.score(&b.snapshot()).aggregate;

        b.ingest_at(&[doc(target, "extra".into(), mask)], now);
        let after = scorer.score(&b.snapshot()).aggregate;
        prop_assert!(before <= after + 1e-12, "aggregate fell from {} to {}", before, after);
    }
}
