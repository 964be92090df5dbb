use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use atlas_graph::docs::{DocConfig, DocScorer};
use atlas_graph::graph::builder::{BuilderConfig, GraphBuilder, RawDocRef, RawEdge, RawNode, Record};
use atlas_graph::graph::identity::ExternalRef;
use atlas_graph::graph::{Attributes, DocKind, EdgeKind, NodeKind};

/// One pipeline per 20 jobs; each job needs the previous one and every fifth has a runbook.
fn synthetic_batch(jobs: usize) -> Vec<Record> {
    let mut batch = Vec::with_capacity(jobs * 3);
    for p in 0..jobs.div_ceil(20) {
        batch.push(Record::UpsertNode(RawNode {
            source_system: "gitlab".into(),
            external_key: Some(format!("p{p}")),
            kind: NodeKind::Pipeline,
            name: format!("pipeline-{p}"),
            attributes: Attributes::new(),
        }));
    }
    for j in 0..jobs {
        let mut attributes = Attributes::new();
        attributes.insert("image".into(), serde_json::json!("rust:1"));
        batch.push(Record::UpsertNode(RawNode {
            source_system: "gitlab".into(),
            external_key: Some(format!("j{j}")),
            kind: NodeKind::Job,
            name: format!("job-{j}"),
            attributes,
        }));
        batch.push(Record::UpsertEdge(RawEdge {
            from: ExternalRef::new("gitlab", &format!("j{j}")),
            to: ExternalRef::new("gitlab", &format!("p{}", j / 20)),
            kind: EdgeKind::Contains,
        }));
        if j % 20 != 0 {
            batch.push(Record::UpsertEdge(RawEdge {
                from: ExternalRef::new("gitlab", &format!("j{j}")),
                to: ExternalRef::new("gitlab", &format!("j{}", j - 1)),
                kind: EdgeKind::Needs,
            }));
        }
        if j % 5 == 0 {
            batch.push(Record::UpsertDoc(RawDocRef {
                source_system: "wiki".into(),
                external_key: format!("runbook-{j}"),
                node: ExternalRef::new("gitlab", &format!("j{j}")),
                kind: DocKind::RunbookLink,
                content_hash: format!("h{j}"),
                covers: ["image".to_string()].into(),
                seen_at: None,
            }));
        }
    }
    batch
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    for jobs in [200usize, 2_000] {
        let batch = synthetic_batch(jobs);
        group.bench_function(BenchmarkId::new("fresh_scope", jobs), |b| {
            b.iter(|| {
                let mut builder = GraphBuilder::new("bench", BuilderConfig::default());
                let res = builder.ingest(black_box(&batch));
                black_box(res.accepted)
            })
        });

        // Replaying an already applied batch exercises the no-change path
        let mut warm = GraphBuilder::new("bench", BuilderConfig::default());
        warm.ingest(&batch);
        group.bench_function(BenchmarkId::new("replay", jobs), |b| {
            b.iter(|| black_box(warm.ingest(black_box(&batch)).changed))
        });

        // Edges first: everything waits in the pending area until nodes arrive
        let mut reversed = batch.clone();
        reversed.reverse();
        group.bench_function(BenchmarkId::new("edges_before_nodes", jobs), |b| {
            b.iter(|| {
                let mut builder = GraphBuilder::new("bench", BuilderConfig::default());
                black_box(builder.ingest(black_box(&reversed)).promoted)
            })
        });

        let scorer = DocScorer::new(DocConfig::default());
        let graph = warm.snapshot();
        group.bench_function(BenchmarkId::new("score_coverage", jobs), |b| {
            b.iter(|| black_box(scorer.score(black_box(&graph)).aggregate))
        });
    }
    group.finish();
}

criterion_group!(name = benches; config = Criterion::default().sample_size(20); targets = bench_ingest);
criterion_main!(benches);
