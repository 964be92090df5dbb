use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{ArtifactId, NodeId};

/// Why a single ingested record was not applied.
///
/// Rejections are reported per record in an `IngestResult`; they never abort the batch.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordRejection {
    #[error("identity conflict for {node}: kind is {existing}, record says {incoming}")]
    IdentityConflict { node: NodeId, existing: String, incoming: String },

    #[error("dangling edge {from} -> {to} ({kind}): {missing} never arrived")]
    DanglingEdge { from: NodeId, to: NodeId, kind: String, missing: NodeId },

    #[error("documentation {artifact} for {missing}: node never arrived")]
    DanglingDoc { artifact: ArtifactId, missing: NodeId },

    #[error("malformed record: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum AtlasGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Persistence failure for scope {scope} after {attempts} attempt(s): {message}")]
    Persistence { scope: String, attempts: u32, message: String },

    #[error("Scope {0} is paused after a persistence failure; resume it before ingesting")]
    ScopePaused(String),

    #[error("Ingest queue for scope {0} is full")]
    QueueFull(String),

    #[error("Ingest worker for scope {0} has stopped")]
    WorkerStopped(String),

    #[error("Unknown scope: {0}")]
    UnknownScope(String),

    #[error("Traversal cancelled")]
    TraversalCancelled,

    #[error("Export error: {0}")]
    Export(String),

    #[error("Invalid query: {0}")]
    Query(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
