//! In-memory doubles shared by the integration tests
#![allow(dead_code, clippy::unwrap_used)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use purr_common::TaskStatus;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use purr_worker::bus::{ChunkTask, Project, ProjectCatalog, RawTask, TaskBody, TaskBus};
use purr_worker::codec::{ScalarType, TransformDirective, TransformFn};
use purr_worker::composer::Document;
use purr_worker::definition::{AssetDefinition, DefinitionService};
use purr_worker::error::{WorkerError, WorkerResult};
use purr_worker::notify::{Event, Notifier};
use purr_worker::sink::DocumentSink;
use purr_worker::source::{SourceConnection, SourceRow, SourceStore, SourceValue};
use purr_worker::WorkerContext;

pub const HOST: &str = "worker-1";
pub const SUITE: &str = "petra";
pub const PROJECT_ID: &str = "p1";

// ============================================================================
// Task bus
// ============================================================================

#[derive(Default)]
struct BusState {
    next_id: i64,
    tasks: BTreeMap<i64, RawTask>,
    ledger: BTreeMap<(String, i64), String>,
}

/// Task table and ledger in memory. Inserted tasks are announced to every
/// subscriber.
pub struct MemoryBus {
    state: Mutex<BusState>,
    subscribers: Mutex<Vec<async_channel::Sender<i64>>>,
    expired_calls: AtomicUsize,
    refreshes: AtomicUsize,
    fail_enqueue: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                next_id: 1,
                ..Default::default()
            }),
            subscribers: Mutex::new(Vec::new()),
            expired_calls: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            fail_enqueue: AtomicBool::new(false),
        }
    }

    /// Insert a PENDING task addressed to `worker`
    pub fn insert(&self, worker: &str, body: &TaskBody) -> i64 {
        let (directive, value) = body.to_columns().unwrap();
        self.insert_raw(worker, directive.as_str(), TaskStatus::Pending.as_str(), value)
    }

    pub fn insert_raw(&self, worker: &str, directive: &str, status: &str, body: Value) -> i64 {
        let id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.tasks.insert(
                id,
                RawTask {
                    id,
                    worker: worker.to_string(),
                    directive: directive.to_string(),
                    status: status.to_string(),
                    body,
                },
            );
            id
        };
        self.announce(id);
        id
    }

    fn announce(&self, id: i64) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.try_send(id).is_ok());
    }

    pub fn task(&self, id: i64) -> Option<RawTask> {
        self.state.lock().unwrap().tasks.get(&id).cloned()
    }

    pub fn tasks(&self) -> Vec<RawTask> {
        self.state.lock().unwrap().tasks.values().cloned().collect()
    }

    pub fn tasks_with_directive(&self, directive: &str) -> Vec<RawTask> {
        self.tasks()
            .into_iter()
            .filter(|t| t.directive == directive)
            .collect()
    }

    pub fn status(&self, id: i64) -> Option<String> {
        self.task(id).map(|t| t.status)
    }

    pub fn ledger(&self, batch_id: &str) -> Vec<(i64, String)> {
        self.state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .filter(|((b, _), _)| b == batch_id)
            .map(|((_, task), status)| (*task, status.clone()))
            .collect()
    }

    /// The next `calls` status updates fail with an expired session
    pub fn expire_session_for(&self, calls: usize) {
        self.expired_calls.store(calls, Ordering::SeqCst);
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn fail_enqueue(&self) {
        self.fail_enqueue.store(true, Ordering::SeqCst);
    }

    fn check_session(&self) -> WorkerResult<()> {
        let expired = self
            .expired_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if expired {
            Err(WorkerError::SessionExpired("JWT expired".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskBus for MemoryBus {
    async fn fetch_task(&self, id: i64) -> WorkerResult<Option<RawTask>> {
        Ok(self.task(id))
    }

    async fn pending_tasks(&self, worker: &str) -> WorkerResult<Vec<RawTask>> {
        Ok(self
            .tasks()
            .into_iter()
            .filter(|t| t.worker == worker && t.status == TaskStatus::Pending.as_str())
            .collect())
    }

    async fn claim_task(&self, id: i64) -> WorkerResult<bool> {
        self.check_session()?;
        let mut state = self.state.lock().unwrap();
        match state.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending.as_str() => {
                task.status = TaskStatus::Processing.as_str().to_string();
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn set_status(&self, id: i64, status: TaskStatus) -> WorkerResult<()> {
        self.check_session()?;
        if let Some(task) = self.state.lock().unwrap().tasks.get_mut(&id) {
            task.status = status.as_str().to_string();
        }
        Ok(())
    }

    async fn delete_task(&self, id: i64) -> WorkerResult<()> {
        self.check_session()?;
        self.state.lock().unwrap().tasks.remove(&id);
        Ok(())
    }

    async fn enqueue_chunks(&self, worker: &str, batch_id: &str, chunks: &[ChunkTask]) -> WorkerResult<Vec<i64>> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(WorkerError::Bus("enqueue rejected".into()));
        }

        let mut ids = Vec::with_capacity(chunks.len());
        {
            let mut state = self.state.lock().unwrap();
            for chunk in chunks {
                let (directive, body) = TaskBody::Chunk(Box::new(chunk.clone())).to_columns()?;
                let id = state.next_id;
                state.next_id += 1;
                state.tasks.insert(
                    id,
                    RawTask {
                        id,
                        worker: worker.to_string(),
                        directive: directive.as_str().to_string(),
                        status: TaskStatus::Pending.as_str().to_string(),
                        body,
                    },
                );
                state
                    .ledger
                    .insert((batch_id.to_string(), id), TaskStatus::Pending.as_str().to_string());
                ids.push(id);
            }
        }
        for id in &ids {
            self.announce(*id);
        }
        Ok(ids)
    }

    async fn delete_ledger_entry(&self, batch_id: &str, task_id: i64) -> WorkerResult<Option<i64>> {
        let mut state = self.state.lock().unwrap();
        if state.ledger.remove(&(batch_id.to_string(), task_id)).is_none() {
            return Ok(None);
        }
        let remaining = state.ledger.keys().filter(|(b, _)| b == batch_id).count();
        Ok(Some(remaining as i64))
    }

    async fn fail_ledger_entry(&self, batch_id: &str, task_id: i64) -> WorkerResult<()> {
        if let Some(status) = self
            .state
            .lock()
            .unwrap()
            .ledger
            .get_mut(&(batch_id.to_string(), task_id))
        {
            *status = TaskStatus::Failed.as_str().to_string();
        }
        Ok(())
    }

    async fn remaining_ledger_entries(&self, batch_id: &str) -> WorkerResult<i64> {
        Ok(self.ledger(batch_id).len() as i64)
    }

    async fn refresh_session(&self) -> WorkerResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn register_worker(&self, _worker: &str, _suite: &str) -> WorkerResult<()> {
        Ok(())
    }

    async fn subscribe(&self) -> WorkerResult<BoxStream<'static, WorkerResult<i64>>> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx.map(Ok).boxed())
    }
}

// ============================================================================
// Projects and definitions
// ============================================================================

pub struct MemoryCatalog {
    projects: HashMap<String, Project>,
}

impl MemoryCatalog {
    pub fn new(projects: Vec<Project>) -> Self {
        Self {
            projects: projects.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

#[async_trait]
impl ProjectCatalog for MemoryCatalog {
    async fn fetch_project(&self, id: &str) -> WorkerResult<Project> {
        self.projects
            .get(id)
            .cloned()
            .ok_or_else(|| WorkerError::ProjectNotFound(id.to_string()))
    }
}

pub struct StaticDefinitions {
    definitions: HashMap<(String, String), AssetDefinition>,
}

impl StaticDefinitions {
    pub fn new(entries: Vec<(&str, &str, AssetDefinition)>) -> Self {
        Self {
            definitions: entries
                .into_iter()
                .map(|(suite, asset, def)| ((suite.to_string(), asset.to_string()), def))
                .collect(),
        }
    }
}

#[async_trait]
impl DefinitionService for StaticDefinitions {
    async fn fetch(&self, suite: &str, asset: &str) -> WorkerResult<AssetDefinition> {
        self.definitions
            .get(&(suite.to_string(), asset.to_string()))
            .cloned()
            .ok_or_else(|| WorkerError::Definition(format!("no definition for {}/{}", suite, asset)))
    }
}

// ============================================================================
// Source store
// ============================================================================

/// Answers each query with the rows of the first response whose needle
/// occurs in the SQL text
#[derive(Default)]
pub struct StaticSource {
    responses: Mutex<Vec<(String, Vec<SourceRow>)>>,
    failures: Mutex<Vec<String>>,
    queries: Mutex<Vec<String>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, needle: &str, rows: Vec<SourceRow>) {
        self.responses.lock().unwrap().push((needle.to_string(), rows));
    }

    pub fn fail_on(&self, needle: &str) {
        self.failures.lock().unwrap().push(needle.to_string());
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceStore for StaticSource {
    async fn query_many(&self, _conn: &SourceConnection, statements: &[String]) -> WorkerResult<Vec<Vec<SourceRow>>> {
        let mut results = Vec::with_capacity(statements.len());
        for sql in statements {
            self.queries.lock().unwrap().push(sql.clone());
            if self.failures.lock().unwrap().iter().any(|n| sql.contains(n.as_str())) {
                return Err(WorkerError::SourceQuery(format!("table locked: {}", sql)));
            }
            let rows = self
                .responses
                .lock()
                .unwrap()
                .iter()
                .find(|(needle, _)| sql.contains(needle.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default();
            results.push(rows);
        }
        Ok(results)
    }
}

// ============================================================================
// Sink and notifier
// ============================================================================

#[derive(Default)]
pub struct MemorySink {
    rows: Mutex<BTreeMap<(String, String), Document>>,
    fail: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn documents(&self, asset: &str) -> Vec<Document> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|((a, _), _)| a == asset)
            .map(|(_, doc)| doc.clone())
            .collect()
    }
}

#[async_trait]
impl DocumentSink for MemorySink {
    async fn upsert(&self, asset: &str, docs: &[Document]) -> WorkerResult<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkerError::sink(asset, "connection reset"));
        }
        let mut rows = self.rows.lock().unwrap();
        for doc in docs {
            rows.insert((asset.to_string(), doc.id.clone()), doc.clone());
        }
        Ok(docs.len() as u64)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn done_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Done { job_id } => Some(job_id),
                _ => None,
            })
            .collect()
    }

    pub fn notes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Note { note, .. } => Some(note),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn project() -> Project {
    Project {
        id: PROJECT_ID.to_string(),
        name: "Interstate".to_string(),
        fs_path: "/projects/interstate".to_string(),
        conn: SourceConnection {
            url: "sqlite::memory:".to_string(),
        },
        suite: SUITE.to_string(),
        tag: Some("nightly".to_string()),
    }
}

/// Formation tests keyed by well serial number
pub fn fmtest_definition() -> AssetDefinition {
    AssetDefinition {
        select: "SELECT w.wsn AS w_wsn, w.uwi AS w_uwi, f.testnum AS f_testnum, f.depths AS f_depths \
                 FROM well w JOIN fmtest f ON f.wsn = w.wsn {purr_where}"
            .to_string(),
        identifier: "SELECT w.wsn AS key FROM well w JOIN fmtest f ON f.wsn = w.wsn {purr_where}".to_string(),
        purr_where: "{purr_where}".to_string(),
        prefixes: BTreeMap::from([("w_".to_string(), "well".to_string()), ("f_".to_string(), "fmtest".to_string())]),
        identifier_keys: vec!["w.wsn".to_string()],
        asset_id_keys: vec!["w_wsn".to_string(), "f_testnum".to_string()],
        well_id_keys: vec!["w_uwi".to_string()],
        xforms: BTreeMap::from([(
            "f_depths".to_string(),
            TransformDirective::with_function(
                TransformFn::DelimitedArray(purr_worker::codec::ElementDecoder::Scalar),
                ScalarType::Number,
            ),
        )]),
        purr_delimiter: Some("||".to_string()),
        purr_null: Some("~NULL~".to_string()),
        post_process: vec![],
        order: "ORDER BY w.wsn".to_string(),
        recency_column: "w.chgdate".to_string(),
    }
}

pub fn key_row(wsn: i64) -> SourceRow {
    SourceRow::new().with("key", SourceValue::Int(wsn))
}

pub fn fmtest_row(wsn: i64, test: i64) -> SourceRow {
    SourceRow::new()
        .with("w_wsn", SourceValue::Int(wsn))
        .with("w_uwi", SourceValue::Text(format!("05123{:05}", wsn)))
        .with("f_testnum", SourceValue::Int(test))
        .with("f_depths", SourceValue::Text("5100||~NULL~||5120".to_string()))
}

/// Every double plus the context wired from them
pub struct Harness {
    pub bus: Arc<MemoryBus>,
    pub source: Arc<StaticSource>,
    pub sink: Arc<MemorySink>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: Arc<WorkerContext>,
}

impl Harness {
    pub fn new() -> Self {
        let bus = Arc::new(MemoryBus::new());
        let source = Arc::new(StaticSource::new());
        let sink = Arc::new(MemorySink::new());
        let notifier = Arc::new(RecordingNotifier::new());

        let ctx = Arc::new(WorkerContext {
            host: HOST.to_string(),
            suite: SUITE.to_string(),
            bus: bus.clone(),
            projects: Arc::new(MemoryCatalog::new(vec![project()])),
            definitions: Arc::new(StaticDefinitions::new(vec![(SUITE, "fmtest", fmtest_definition())])),
            source: source.clone(),
            sink: sink.clone(),
            notifier: notifier.clone(),
        });

        Self {
            bus,
            source,
            sink,
            notifier,
            ctx,
        }
    }

    /// Serve identifiers `wsns` and one formation test row per identifier
    pub fn with_wells(self, wsns: &[i64]) -> Self {
        self.source
            .respond("AS key FROM", wsns.iter().copied().map(key_row).collect());
        for wsn in wsns {
            self.source
                .respond(&format!("IN ({})", wsn), vec![fmtest_row(*wsn, 1)]);
        }
        self
    }
}
