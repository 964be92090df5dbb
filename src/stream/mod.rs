//! Stream ingestion: message decoding and one worker thread per scope.
//!
//! Messages are routed by scope onto bounded channels. Each worker drains up to `batch_size`
//! queued messages into a single batch, so throughput grows with load while a slow scope only
//! backs up its own queue.
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::errors::{AtlasGraphError, RecordRejection};
use crate::graph::builder::{IngestResult, Record, RecordOutcome, RecordStatus};
use crate::store::GraphService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Node,
    Edge,
    Doc,
}

/// One message as delivered by the upstream transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub scope: String,
    pub op: Op,
    pub entity: Entity,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl StreamMessage {
    /// Decode a message envelope from JSON.
    ///
    /// # Errors
    /// Returns `AtlasGraphError::Json` if the envelope itself is invalid.
    pub fn parse(line: &str) -> Result<Self, AtlasGraphError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Decode the payload into a builder record.
    ///
    /// # Errors
    /// Returns `RecordRejection::Malformed` when the payload does not match the entity.
    pub fn to_record(&self) -> Result<Record, RecordRejection> {
        let p = self.payload.clone();
        let decoded = match (self.op, self.entity) {
            (Op::Upsert, Entity::Node) => serde_json::from_value(p).map(Record::UpsertNode),
            (Op::Upsert, Entity::Edge) => serde_json::from_value(p).map(Record::UpsertEdge),
            (Op::Upsert, Entity::Doc) => serde_json::from_value(p).map(Record::UpsertDoc),
            (Op::Delete, Entity::Node) => serde_json::from_value(p).map(Record::DeleteNode),
            (Op::Delete, Entity::Edge) => serde_json::from_value(p).map(Record::DeleteEdge),
            (Op::Delete, Entity::Doc) => serde_json::from_value(p).map(Record::DeleteDoc),
        };
        decoded.map_err(|e| {
            RecordRejection::Malformed(format!("{:?} {:?} payload: {e}", self.op, self.entity))
        })
    }
}

/// Messages read from a JSON-lines source plus the lines that could not be parsed.
#[derive(Debug, Default)]
pub struct JsonLines {
    pub messages: Vec<StreamMessage>,
    /// `(line number, error)` for undecodable envelopes.
    pub invalid: Vec<(usize, String)>,
}

/// Read stream messages, one JSON object per line. Blank lines and `#` comments are skipped.
///
/// # Errors
/// Returns `AtlasGraphError::Io` if reading fails.
pub fn read_json_lines<R: BufRead>(reader: R) -> Result<JsonLines, AtlasGraphError> {
    let mut out = JsonLines::default();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match StreamMessage::parse(trimmed) {
            Ok(m) => out.messages.push(m),
            Err(e) => {
                warn!(line = i + 1, error = %e, "skipping undecodable stream message");
                out.invalid.push((i + 1, e.to_string()));
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue_capacity: usize,
    pub batch_size: usize,
}

const PAUSE_POLL: Duration = Duration::from_millis(20);

impl Default for WorkerSettings {
    fn default() -> Self {
        Self { queue_capacity: 1024, batch_size: 256 }
    }
}

/// Totals for one scope worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub scope: String,
    pub batches: usize,
    pub messages: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub pending: usize,
    pub promoted: usize,
    pub dropped: usize,
    /// Messages still held because the scope was paused.
    pub deferred: usize,
    pub revision: u64,
    pub errors: Vec<String>,
}

impl ScopeSummary {
    fn absorb(&mut self, r: &IngestResult) {
        self.batches += 1;
        self.messages += r.outcomes.len();
        self.accepted += r.accepted;
        self.rejected += r.rejected;
        self.pending += r.pending;
        self.promoted += r.promoted;
        self.dropped += r.dropped_pending.len();
        self.revision = r.revision;
    }
}

struct Worker {
    tx: Sender<StreamMessage>,
    handle: JoinHandle<ScopeSummary>,
}

/// Routes messages to per-scope worker threads.
pub struct IngestWorkers {
    service: Arc<GraphService>,
    settings: WorkerSettings,
    workers: Mutex<HashMap<String, Worker>>,
    closing: Arc<AtomicBool>,
}

impl IngestWorkers {
    #[must_use]
    pub fn new(service: Arc<GraphService>, settings: WorkerSettings) -> Self {
        Self {
            service,
            settings,
            workers: Mutex::new(HashMap::new()),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn sender(&self, scope: &str) -> Result<Sender<StreamMessage>, AtlasGraphError> {
        let mut workers = self.workers.lock();
        if let Some(w) = workers.get(scope) {
            return Ok(w.tx.clone());
        }
        let (tx, rx) = bounded(self.settings.queue_capacity.max(1));
        let service = Arc::clone(&self.service);
        let closing = Arc::clone(&self.closing);
        let owned_scope = scope.to_string();
        let settings = self.settings.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ingest-{scope}"))
            .spawn(move || run_worker(&service, owned_scope, &rx, &settings, &closing))?;
        debug!(scope, "ingest worker started");
        workers.insert(scope.to_string(), Worker { tx: tx.clone(), handle });
        Ok(tx)
    }

    /// Queue a message without blocking.
    ///
    /// # Errors
    /// `QueueFull` when the scope's queue is at capacity; the transport should redeliver.
    pub fn try_submit(&self, msg: StreamMessage) -> Result<(), AtlasGraphError> {
        let scope = msg.scope.clone();
        match self.sender(&scope)?.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(AtlasGraphError::QueueFull(scope)),
            Err(TrySendError::Disconnected(_)) => Err(AtlasGraphError::WorkerStopped(scope)),
        }
    }

    /// Queue a message, waiting while the scope's queue is full.
    ///
    /// # Errors
    /// `WorkerStopped` if the scope worker has exited.
    pub fn submit(&self, msg: StreamMessage) -> Result<(), AtlasGraphError> {
        let scope = msg.scope.clone();
        self.sender(&scope)?.send(msg).map_err(|_| AtlasGraphError::WorkerStopped(scope))
    }

    /// Close every queue, wait for the workers to drain and return their summaries by scope.
    ///
    /// Workers of paused scopes stop without ingesting what they hold; it is reported as
    /// `deferred`.
    #[must_use]
    pub fn shutdown(self) -> Vec<ScopeSummary> {
        self.closing.store(true, Ordering::Release);
        let workers = self.workers.into_inner();
        let mut summaries: Vec<ScopeSummary> = workers
            .into_iter()
            .map(|(scope, w)| {
                drop(w.tx);
                w.handle.join().unwrap_or_else(|_| {
                    error!(scope = %scope, "ingest worker panicked");
                    ScopeSummary { scope, errors: vec!["worker panicked".into()], ..Default::default() }
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.scope.cmp(&b.scope));
        summaries
    }
}

/// Replay messages through per-scope workers and wait for them to finish.
///
/// # Errors
/// Returns `AtlasGraphError` if a worker cannot be started or has stopped.
pub fn replay(
    service: Arc<GraphService>,
    settings: WorkerSettings,
    messages: Vec<StreamMessage>,
) -> Result<Vec<ScopeSummary>, AtlasGraphError> {
    let workers = IngestWorkers::new(service, settings);
    for m in messages {
        workers.submit(m)?;
    }
    Ok(workers.shutdown())
}

fn run_worker(
    service: &GraphService,
    scope: String,
    rx: &Receiver<StreamMessage>,
    settings: &WorkerSettings,
    closing: &AtomicBool,
) -> ScopeSummary {
    let mut summary = ScopeSummary { scope: scope.clone(), ..Default::default() };
    let batch_size = settings.batch_size.max(1);
    // While paused, hold at most one queue's worth; the rest stays in the channel so
    // producers see backpressure.
    let hold = settings.queue_capacity.max(1);
    let mut deferred: Vec<StreamMessage> = Vec::new();
    loop {
        if service.is_paused(&scope) {
            if deferred.len() >= hold {
                if closing.load(Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(PAUSE_POLL);
                continue;
            }
            match rx.recv_timeout(PAUSE_POLL) {
                Ok(m) => deferred.push(m),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            continue;
        }
        let mut batch = std::mem::take(&mut deferred);
        if batch.is_empty() {
            match rx.recv() {
                Ok(m) => batch.push(m),
                Err(_) => break,
            }
        }
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(m) => batch.push(m),
                Err(_) => break,
            }
        }
        if let Some(held) = process_batch(service, &scope, batch, &mut summary) {
            deferred = held;
        }
    }
    if !deferred.is_empty() && !service.is_paused(&scope) {
        let batch = std::mem::take(&mut deferred);
        if let Some(held) = process_batch(service, &scope, batch, &mut summary) {
            deferred = held;
        }
    }
    summary.deferred = deferred.len() + rx.len();
    if summary.deferred > 0 {
        warn!(scope = %scope, held = summary.deferred, "scope paused; messages not ingested");
    }
    summary
}

/// Ingest one batch. Returns the batch back when the scope refused it.
fn process_batch(
    service: &GraphService,
    scope: &str,
    batch: Vec<StreamMessage>,
    summary: &mut ScopeSummary,
) -> Option<Vec<StreamMessage>> {
    let mut records = Vec::with_capacity(batch.len());
    let mut positions = Vec::with_capacity(batch.len());
    let mut malformed = Vec::new();
    for (i, m) in batch.iter().enumerate() {
        match m.to_record() {
            Ok(r) => {
                positions.push(i);
                records.push(r);
            }
            Err(reason) => {
                warn!(scope, index = i, %reason, "malformed stream message");
                malformed.push((i, reason));
            }
        }
    }
    match service.ingest(scope, &records) {
        Ok(mut result) => {
            for o in &mut result.outcomes {
                o.index = positions[o.index];
            }
            for (index, reason) in malformed {
                result.outcomes.push(RecordOutcome { index, status: RecordStatus::Rejected { reason } });
            }
            result.outcomes.sort_by_key(|o| o.index);
            result.recount();
            summary.absorb(&result);
            None
        }
        Err(AtlasGraphError::ScopePaused(_)) => Some(batch),
        Err(e) => {
            // Applied in memory but not persisted; the scope is now paused
            summary.batches += 1;
            summary.messages += batch.len();
            summary.errors.push(e.to_string());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryRepository, RetryPolicy};
    use crate::store::ServiceSettings;
    use serde_json::json;

    /// Service whose scope `s` is paused by a failed flush.
    fn paused_service() -> (Arc<MemoryRepository>, Arc<GraphService>) {
        let repo = Arc::new(MemoryRepository::new());
        let settings = ServiceSettings {
            retry: RetryPolicy { max_attempts: 1, initial_backoff: Duration::ZERO, ..Default::default() },
            ..Default::default()
        };
        let service = Arc::new(GraphService::new(repo.clone(), settings));
        repo.fail_next_flushes(1);
        let seed = job("s", "seed").to_record().unwrap();
        assert!(service.ingest("s", &[seed]).is_err());
        assert!(service.is_paused("s"));
        (repo, service)
    }

    fn msg(scope: &str, op: Op, entity: Entity, payload: serde_json::Value) -> StreamMessage {
        StreamMessage { scope: scope.into(), op, entity, payload }
    }

    fn job(scope: &str, name: &str) -> StreamMessage {
        msg(
            scope,
            Op::Upsert,
            Entity::Node,
            json!({"source_system": "ci", "external_key": name, "kind": "job", "name": name}),
        )
    }

    #[test]
    fn decodes_each_entity() {
        let edge = msg(
            "s",
            Op::Upsert,
            Entity::Edge,
            json!({"from": {"source_system": "ci", "external_key": "a"},
                   "to": {"source_system": "ci", "external_key": "b"}, "kind": "needs"}),
        );
        assert!(matches!(edge.to_record(), Ok(Record::UpsertEdge(_))));
        let del = msg("s", Op::Delete, Entity::Doc, json!({"source_system": "repo", "external_key": "README.md"}));
        assert!(matches!(del.to_record(), Ok(Record::DeleteDoc(_))));
        let bad = msg("s", Op::Upsert, Entity::Node, json!({"name": 3}));
        assert!(matches!(bad.to_record(), Err(RecordRejection::Malformed(_))));
    }

    #[test]
    fn json_lines_skip_comments_and_report_invalid() {
        let input = "# header\n{\"scope\":\"s\",\"op\":\"upsert\",\"entity\":\"node\",\"payload\":{}}\n\nnot json\n";
        let parsed = read_json_lines(input.as_bytes()).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.invalid.len(), 1);
        assert_eq!(parsed.invalid[0].0, 4);
    }

    #[test]
    fn replay_routes_by_scope_and_keeps_malformed_positions() {
        let service = Arc::new(GraphService::new(
            Arc::new(MemoryRepository::new()),
            ServiceSettings::default(),
        ));
        let messages = vec![
            job("alpha", "a"),
            msg("alpha", Op::Upsert, Entity::Node, json!({"kind": "job"})),
            job("beta", "b"),
            job("beta", "c"),
        ];
        let summaries = replay(Arc::clone(&service), WorkerSettings::default(), messages).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].scope, "alpha");
        assert_eq!(summaries[0].rejected, 1);
        assert_eq!(summaries[0].accepted, 1);
        assert_eq!(summaries[1].accepted, 2);
        assert_eq!(service.get_graph("beta").unwrap().node_count(), 2);
    }

    #[test]
    fn paused_scope_keeps_its_queue_bounded() {
        let (_, service) = paused_service();
        let workers = IngestWorkers::new(
            Arc::clone(&service),
            WorkerSettings { queue_capacity: 2, batch_size: 1 },
        );
        let mut queued = 0;
        let mut refused = 0;
        for i in 0..200 {
            match workers.try_submit(job("s", &format!("j{i}"))) {
                Ok(()) => queued += 1,
                Err(AtlasGraphError::QueueFull(_)) => refused += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
            if i % 20 == 0 {
                std::thread::sleep(Duration::from_millis(30));
            }
        }
        // Two held by the worker plus two in the channel
        assert!(queued <= 4, "queued {queued}");
        assert!(refused >= 196);

        service.resume("s").unwrap();
        let summaries = workers.shutdown();
        assert_eq!(summaries[0].deferred, 0);
        assert_eq!(summaries[0].accepted, queued);
        assert_eq!(service.get_graph("s").unwrap().node_count(), 1 + queued);
    }

    #[test]
    fn shutdown_of_paused_scope_reports_what_it_held() {
        let (_, service) = paused_service();
        let workers = IngestWorkers::new(
            Arc::clone(&service),
            WorkerSettings { queue_capacity: 3, batch_size: 8 },
        );
        for i in 0..3 {
            workers.submit(job("s", &format!("j{i}"))).unwrap();
        }
        let summaries = workers.shutdown();
        assert_eq!(summaries[0].deferred, 3);
        assert_eq!(summaries[0].accepted, 0);
        assert_eq!(service.get_graph("s").unwrap().node_count(), 1);
    }
}
