//! atlas-graph — CI/CD dependency graph builder
//!
//! Normalize pipelines, jobs, artifacts, images, secrets and environments from many source
//! systems into one dependency graph per scope, walk it without tripping over cycles, and score
//! how well it is documented.
//!
//! # Features
//! - Stable identities from `(source_system, external_key)`; idempotent batch ingestion
//! - Pending edges for out-of-order delivery, expired after a retention window
//! - DFS/BFS/topological traversal with cycle reports, cancellation and time budgets
//! - Coverage scoring weighted by centrality, and structural drift detection
//! - JSON-file persistence with retry and per-scope pause, JSON/GraphML/DOT export
//!
//! # Quickstart (Library)
//! ```no_run
//! use std::sync::Arc;
//! use atlas_graph::graph::builder::{RawNode, Record};
//! use atlas_graph::graph::NodeKind;
//! use atlas_graph::persistence::MemoryRepository;
//! use atlas_graph::store::{GraphService, ServiceSettings};
//!
//! let service = GraphService::new(Arc::new(MemoryRepository::new()), ServiceSettings::default());
//! let job = RawNode {
//!     source_system: "gitlab".into(),
//!     external_key: None,
//!     kind: NodeKind::Job,
//!     name: "build".into(),
//!     attributes: Default::default(),
//! };
//! let result = service.ingest("team/app", &[Record::UpsertNode(job)]).expect("ingest");
//! println!("revision {} accepted {}", result.revision, result.accepted);
//! ```
//!
//! # Quickstart (CLI)
//! ```text
//! atlas-graph ingest --state ./state --input events.jsonl
//! atlas-graph query traverse --state ./state --scope team/app --start deploy --direction incoming --order topo
//! atlas-graph query coverage --state ./state --scope team/app --limit 20
//! ```
pub mod app;
pub mod cli;
pub mod diff;
pub mod docs;
pub mod errors;
pub mod export;
pub mod graph;
pub mod linker;
pub mod persistence;
pub mod query;
pub mod store;
pub mod stream;
pub mod traversal;
pub mod utils;
