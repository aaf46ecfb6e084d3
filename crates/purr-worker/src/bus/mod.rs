//! Task bus, batch ledger and project catalog
//!
//! Tasks arrive as rows addressed to a worker host. A row is decoded into a
//! [`TaskRecord`] exactly once, at this boundary, after [`accepts`] has
//! decided the row is meant for this worker. Everything downstream matches on
//! the closed [`TaskBody`] union.

pub mod postgres;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::codec::TransformDirective;
use crate::error::{WorkerError, WorkerResult};
use crate::source::SourceConnection;
use purr_common::{Directive, TaskStatus};

pub use postgres::PgTaskBus;

/// An externally triggered load of one asset type from one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub asset: String,
    /// Preferred number of identifiers per chunk
    pub chunk: usize,
    /// Only rows changed in the last `recency` days; 0 disables the window
    #[serde(default)]
    pub recency: u32,
    #[serde(default)]
    pub where_clause: String,
    pub project_id: String,
    pub suite: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
}

/// One chunk of a batch: a self-contained selector plus everything needed to
/// turn its rows into documents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTask {
    pub asset: String,
    pub tag: String,
    pub batch_id: String,
    pub project_id: String,
    pub project_name: String,
    pub suite: String,
    pub conn: SourceConnection,
    pub selector: String,
    pub prefixes: BTreeMap<String, String>,
    pub asset_id_keys: Vec<String>,
    pub well_id_keys: Vec<String>,
    #[serde(default)]
    pub xforms: BTreeMap<String, TransformDirective>,
    #[serde(default)]
    pub purr_delimiter: Option<String>,
    #[serde(default)]
    pub purr_null: Option<String>,
    #[serde(default)]
    pub post_process: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconRequest {
    pub recon_root: String,
    pub suite: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub tag: String,
    pub terms: String,
    pub assets: Vec<String>,
    pub suites: Vec<String>,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub asset: String,
    pub file_format: String,
    pub sql: String,
    pub total_hits: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltRequest {
    pub suite: String,
}

/// Task payload, one variant per directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", content = "body", rename_all = "lowercase")]
pub enum TaskBody {
    Batch(BatchRequest),
    Chunk(Box<ChunkTask>),
    Recon(ReconRequest),
    Search(SearchRequest),
    Export(ExportRequest),
    Halt(HaltRequest),
}

impl TaskBody {
    pub fn directive(&self) -> Directive {
        match self {
            TaskBody::Batch(_) => Directive::Batch,
            TaskBody::Chunk(_) => Directive::Chunk,
            TaskBody::Recon(_) => Directive::Recon,
            TaskBody::Search(_) => Directive::Search,
            TaskBody::Export(_) => Directive::Export,
            TaskBody::Halt(_) => Directive::Halt,
        }
    }

    /// Split into the `(directive, body)` column pair stored on the bus
    pub fn to_columns(&self) -> WorkerResult<(Directive, Value)> {
        let mut tagged = serde_json::to_value(self)?;
        let body = tagged.get_mut("body").map(Value::take).unwrap_or(Value::Null);
        Ok((self.directive(), body))
    }
}

/// A task row exactly as stored, before acceptance and decoding
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RawTask {
    pub id: i64,
    pub worker: String,
    pub directive: String,
    pub status: String,
    pub body: Value,
}

/// A decoded task addressed to this worker
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: i64,
    pub worker: String,
    pub status: TaskStatus,
    pub body: TaskBody,
}

impl TaskRecord {
    pub fn directive(&self) -> Directive {
        self.body.directive()
    }
}

impl TryFrom<RawTask> for TaskRecord {
    type Error = WorkerError;

    fn try_from(raw: RawTask) -> WorkerResult<Self> {
        let status = raw
            .status
            .parse::<TaskStatus>()
            .map_err(|e| WorkerError::Decode(format!("task {}: {}", raw.id, e)))?;

        let tagged = serde_json::json!({ "directive": raw.directive, "body": raw.body });
        let body = serde_json::from_value::<TaskBody>(tagged)
            .map_err(|e| WorkerError::Decode(format!("task {} ({}): {}", raw.id, raw.directive, e)))?;

        Ok(Self {
            id: raw.id,
            worker: raw.worker,
            status,
            body,
        })
    }
}

/// Whether a raw task row is meant for this worker.
///
/// The row must be addressed to `host`, still be PENDING, and name `suite`
/// through its body's `suite`, its `suites` list, or the text of an export's
/// `sql`.
pub fn accepts(raw: &RawTask, host: &str, suite: &str) -> bool {
    if raw.worker != host || !raw.status.eq_ignore_ascii_case(TaskStatus::Pending.as_str()) {
        return false;
    }

    let body = &raw.body;
    let by_suite = body.get("suite").and_then(Value::as_str) == Some(suite);
    let by_suites = body
        .get("suites")
        .and_then(Value::as_array)
        .is_some_and(|suites| suites.iter().any(|s| s.as_str() == Some(suite)));
    let by_sql = body
        .get("sql")
        .and_then(Value::as_str)
        .is_some_and(|sql| sql.contains(suite));

    by_suite || by_suites || by_sql
}

/// A project known to the crawler: one source store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub fs_path: String,
    pub conn: SourceConnection,
    pub suite: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Shared task table plus the per-batch ledger
#[async_trait]
pub trait TaskBus: Send + Sync {
    async fn fetch_task(&self, id: i64) -> WorkerResult<Option<RawTask>>;

    /// PENDING tasks addressed to `worker`, oldest first
    async fn pending_tasks(&self, worker: &str) -> WorkerResult<Vec<RawTask>>;

    /// Move a PENDING task to PROCESSING. False when the task is gone or was
    /// already claimed by an earlier delivery.
    async fn claim_task(&self, id: i64) -> WorkerResult<bool>;

    async fn set_status(&self, id: i64, status: TaskStatus) -> WorkerResult<()>;

    async fn delete_task(&self, id: i64) -> WorkerResult<()>;

    /// Publish chunk tasks for `batch_id` together with one PENDING ledger
    /// row each. Either every task and row is written or none is.
    async fn enqueue_chunks(&self, worker: &str, batch_id: &str, chunks: &[ChunkTask]) -> WorkerResult<Vec<i64>>;

    /// Remove a completed chunk's ledger row.
    ///
    /// Returns the rows left for `batch_id` when this call removed the row,
    /// `None` when it was already gone. Removal and count are atomic per
    /// batch, so of all the chunks of one batch exactly one sees `Some(0)`.
    async fn delete_ledger_entry(&self, batch_id: &str, task_id: i64) -> WorkerResult<Option<i64>>;

    async fn fail_ledger_entry(&self, batch_id: &str, task_id: i64) -> WorkerResult<()>;

    /// Ledger rows still present for `batch_id`, whatever their status
    async fn remaining_ledger_entries(&self, batch_id: &str) -> WorkerResult<i64>;

    /// Re-establish the authenticated session after [`WorkerError::SessionExpired`]
    async fn refresh_session(&self) -> WorkerResult<()>;

    async fn register_worker(&self, worker: &str, suite: &str) -> WorkerResult<()>;

    /// Ids of tasks inserted or re-queued on the bus, as they happen
    async fn subscribe(&self) -> WorkerResult<BoxStream<'static, WorkerResult<i64>>>;
}

#[async_trait]
pub trait ProjectCatalog: Send + Sync {
    async fn fetch_project(&self, id: &str) -> WorkerResult<Project>;
}
