//! Per-scope graph service: one writer, many snapshot readers.
//!
//! Every scope gets its own `ScopeHandle` holding the builder (the single writer), the published
//! snapshot and the cached coverage scores. Readers clone the snapshot `Arc` and never wait on an
//! ingest in progress.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::docs::{CoverageIndex, CoverageReport, DocConfig, DocScorer, DriftFinding, Invalidation};
use crate::errors::AtlasGraphError;
use crate::graph::builder::{BuilderConfig, GraphBuilder, IngestResult, Record};
use crate::graph::CicdGraph;
use crate::persistence::{GraphRepository, RetryPolicy};
use crate::traversal::{CancelToken, Traversal, TraversalRequest, TraversalResult};

/// Tunables for a `GraphService`.
#[derive(Debug, Clone, Default)]
pub struct ServiceSettings {
    pub builder: BuilderConfig,
    pub docs: DocConfig,
    pub retry: RetryPolicy,
    /// Upper bound for a single traversal.
    pub traversal_budget: Option<Duration>,
}

pub struct ScopeHandle {
    scope: String,
    builder: Mutex<GraphBuilder>,
    published: RwLock<Arc<CicdGraph>>,
    coverage: Mutex<CoverageIndex>,
    paused: AtomicBool,
}

impl ScopeHandle {
    fn new(builder: GraphBuilder) -> Self {
        let snapshot = builder.snapshot();
        Self {
            scope: snapshot.scope().to_string(),
            builder: Mutex::new(builder),
            published: RwLock::new(snapshot),
            coverage: Mutex::new(CoverageIndex::new()),
            paused: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<CicdGraph> {
        Arc::clone(&self.published.read())
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.builder.lock().pending_len()
    }
}

pub struct GraphService {
    scopes: RwLock<HashMap<String, Arc<ScopeHandle>>>,
    repo: Arc<dyn GraphRepository>,
    scorer: DocScorer,
    settings: ServiceSettings,
}

impl GraphService {
    #[must_use]
    pub fn new(repo: Arc<dyn GraphRepository>, settings: ServiceSettings) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            repo,
            scorer: DocScorer::new(settings.docs.clone()),
            settings,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    #[must_use]
    pub fn scorer(&self) -> &DocScorer {
        &self.scorer
    }

    /// Open a scope, loading its last flushed graph on first use.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` when the stored graph cannot be loaded.
    pub fn open_scope(&self, scope: &str) -> Result<Arc<ScopeHandle>, AtlasGraphError> {
        if let Some(h) = self.scopes.read().get(scope) {
            return Ok(Arc::clone(h));
        }
        let loaded = self.repo.load(scope)?;
        let mut scopes = self.scopes.write();
        // Another caller may have opened it while we were loading
        if let Some(h) = scopes.get(scope) {
            return Ok(Arc::clone(h));
        }
        let builder = match loaded {
            Some(mut graph) => {
                info!(scope, nodes = graph.node_count(), edges = graph.edge_count(), "scope loaded");
                graph.metadata.scope = scope.to_string();
                GraphBuilder::from_graph(graph, self.settings.builder.clone())
            }
            None => GraphBuilder::new(scope, self.settings.builder.clone()),
        };
        let handle = Arc::new(ScopeHandle::new(builder));
        scopes.insert(scope.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn handle(&self, scope: &str) -> Result<Arc<ScopeHandle>, AtlasGraphError> {
        self.scopes
            .read()
            .get(scope)
            .cloned()
            .ok_or_else(|| AtlasGraphError::UnknownScope(scope.to_string()))
    }

    /// Scopes opened in this service, sorted.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        let mut v: Vec<String> = self.scopes.read().keys().cloned().collect();
        v.sort();
        v
    }

    #[must_use]
    pub fn is_paused(&self, scope: &str) -> bool {
        self.scopes.read().get(scope).is_some_and(|h| h.is_paused())
    }

    pub fn ingest(&self, scope: &str, batch: &[Record]) -> Result<IngestResult, AtlasGraphError> {
        self.ingest_at(scope, batch, Utc::now())
    }

    /// Apply a batch, publish the new snapshot, then persist it.
    ///
    /// # Errors
    /// `ScopePaused` when an earlier flush failed, `Persistence` when this flush fails (the scope
    /// is paused in that case; the batch itself has been applied in memory).
    pub fn ingest_at(
        &self,
        scope: &str,
        batch: &[Record],
        now: DateTime<Utc>,
    ) -> Result<IngestResult, AtlasGraphError> {
        let handle = self.open_scope(scope)?;
        let mut builder = handle.builder.lock();
        if handle.is_paused() {
            return Err(AtlasGraphError::ScopePaused(scope.to_string()));
        }
        let result = builder.ingest_at(batch, now);
        let snapshot = builder.snapshot();
        *handle.published.write() = Arc::clone(&snapshot);
        handle.coverage.lock().invalidate(Invalidation::from_result(&result));

        let persisted = self
            .settings
            .retry
            .run(scope, "audit", || self.repo.append_audit(scope, &result))
            .and_then(|()| {
                if result.changed {
                    self.settings.retry.run(scope, "flush", || self.repo.flush(scope, &snapshot))
                } else {
                    Ok(())
                }
            });
        if let Err(e) = persisted {
            handle.paused.store(true, Ordering::SeqCst);
            error!(scope, error = %e, "persistence retries exhausted; scope paused");
            return Err(e);
        }
        Ok(result)
    }

    /// Flush the current snapshot and lift a pause.
    ///
    /// # Errors
    /// Returns `Persistence` if the flush still fails; the scope stays paused.
    pub fn resume(&self, scope: &str) -> Result<(), AtlasGraphError> {
        let handle = self.handle(scope)?;
        let _writer = handle.builder.lock();
        let snapshot = handle.snapshot();
        self.settings.retry.run(scope, "flush", || self.repo.flush(scope, &snapshot))?;
        if handle.paused.swap(false, Ordering::SeqCst) {
            info!(scope, "scope resumed");
        }
        Ok(())
    }

    /// Persist the current snapshot of a scope.
    ///
    /// # Errors
    /// Returns `Persistence` when retries are exhausted.
    pub fn flush(&self, scope: &str) -> Result<(), AtlasGraphError> {
        let snapshot = self.get_graph(scope)?;
        self.settings.retry.run(scope, "flush", || self.repo.flush(scope, &snapshot))
    }

    /// Point-in-time snapshot of a scope's graph.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` if the scope cannot be opened.
    pub fn get_graph(&self, scope: &str) -> Result<Arc<CicdGraph>, AtlasGraphError> {
        Ok(self.open_scope(scope)?.snapshot())
    }

    /// Run a traversal to completion on the current snapshot.
    ///
    /// # Errors
    /// `TraversalCancelled` if `cancel` fires or the configured budget runs out.
    pub fn traverse(
        &self,
        scope: &str,
        request: &TraversalRequest,
        cancel: Option<CancelToken>,
    ) -> Result<TraversalResult, AtlasGraphError> {
        let graph = self.get_graph(scope)?;
        let mut walk = Traversal::new(&graph, request);
        if let Some(token) = cancel {
            walk = walk.with_cancel(token);
        }
        if let Some(budget) = self.settings.traversal_budget {
            walk = walk.with_budget(budget);
        }
        walk.finish()
    }

    /// Coverage scores for the current snapshot, recomputing only what changed.
    ///
    /// # Errors
    /// Returns `AtlasGraphError` if the scope cannot be opened.
    pub fn get_coverage(&self, scope: &str) -> Result<CoverageReport, AtlasGraphError> {
        let handle = self.open_scope(scope)?;
        let graph = handle.snapshot();
        let mut index = handle.coverage.lock();
        Ok(index.refresh(&self.scorer, &graph).clone())
    }

    /// # Errors
    /// Returns `AtlasGraphError` if the scope cannot be opened.
    pub fn get_drift(&self, scope: &str) -> Result<Vec<DriftFinding>, AtlasGraphError> {
        let graph = self.get_graph(scope)?;
        Ok(self.scorer.detect_drift(&graph))
    }
}
