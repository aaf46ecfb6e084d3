//! Fan-out/fan-in coordinator
//!
//! Every task goes through [`Coordinator::handle_task`]:
//!
//! ```text
//! PENDING --claim--> PROCESSING --ok--> (deleted)
//!                               \--err--> FAILED
//! ```
//!
//! A batch task plans its chunks and publishes them with one ledger row each.
//! A chunk task loads its rows, removes its own ledger row, and announces the
//! batch as done once no rows remain. A failed chunk keeps its ledger row
//! (marked FAILED), so its batch never reports done until someone intervenes.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::{BatchRequest, ChunkTask, TaskBody, TaskRecord};
use crate::composer::compose_docs;
use crate::context::WorkerContext;
use crate::error::{WorkerError, WorkerResult};
use crate::notify::Event;
use crate::planner;
use purr_common::{TaskStatus, Workflow};

/// Attempts (not retries) for a status update hit by an expired session
pub const STATUS_UPDATE_ATTEMPTS: usize = 2;

/// Handles directives whose work lives outside the ETL engine
#[async_trait]
pub trait CollaboratorHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> WorkerResult<()>;
}

/// Fails every collaborator task so nothing is left in PROCESSING
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedCollaborator;

#[async_trait]
impl CollaboratorHandler for UnsupportedCollaborator {
    async fn handle(&self, task: &TaskRecord) -> WorkerResult<()> {
        Err(WorkerError::Unhandled(task.directive()))
    }
}

/// What became of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Handler succeeded and the task was removed
    Completed,
    /// Handler failed and the task was marked FAILED
    Failed,
    /// Another delivery already claimed the task, or the claim failed
    Skipped,
}

pub struct Coordinator {
    ctx: Arc<WorkerContext>,
    collaborator: Arc<dyn CollaboratorHandler>,
}

impl Coordinator {
    pub fn new(ctx: Arc<WorkerContext>, collaborator: Arc<dyn CollaboratorHandler>) -> Self {
        Self { ctx, collaborator }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Run one task through its status lifecycle. Never returns an error:
    /// handler failures end as a FAILED task and a log line.
    pub async fn handle_task(&self, task: TaskRecord) -> TaskOutcome {
        let task_id = task.id;
        let directive = task.directive();

        let bus = self.ctx.bus.clone();
        match self.with_session_retry("claim", || bus.claim_task(task_id)).await {
            Ok(true) => {},
            Ok(false) => {
                info!(task_id, directive = %directive, "task already claimed");
                return TaskOutcome::Skipped;
            },
            Err(e) => {
                error!(task_id, directive = %directive, error = %e, "could not claim task");
                return TaskOutcome::Skipped;
            },
        }

        let result = match &task.body {
            TaskBody::Batch(request) => self.handle_batch(task_id, request).await,
            TaskBody::Chunk(chunk) => self.handle_chunk(task_id, chunk).await,
            TaskBody::Recon(_) | TaskBody::Search(_) | TaskBody::Export(_) => {
                self.handle_collaborator(&task).await
            },
            // the dispatcher acts on halt itself; nothing to run
            TaskBody::Halt(_) => Ok(()),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.with_session_retry("delete", || bus.delete_task(task_id)).await {
                    error!(task_id, error = %e, "task succeeded but could not be removed");
                }
                TaskOutcome::Completed
            },
            Err(e) => {
                error!(task_id, directive = %directive, error = %e, "task failed");
                if let Err(status_err) = self
                    .with_session_retry("fail", || bus.set_status(task_id, TaskStatus::Failed))
                    .await
                {
                    error!(task_id, error = %status_err, "could not mark task FAILED");
                }
                TaskOutcome::Failed
            },
        }
    }

    /// Retry `op` once more after refreshing the session if it failed with
    /// an expired session
    async fn with_session_retry<T, F, Fut>(&self, what: &str, op: F) -> WorkerResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = WorkerResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_session_expired() && attempt < STATUS_UPDATE_ATTEMPTS => {
                    warn!(operation = what, attempt, "session expired; refreshing and retrying");
                    self.ctx.bus.refresh_session().await?;
                    attempt += 1;
                },
                other => return other,
            }
        }
    }

    /// Plan a batch and publish its chunks with their ledger rows
    pub async fn handle_batch(&self, task_id: i64, request: &BatchRequest) -> WorkerResult<()> {
        let ctx = &self.ctx;
        ctx.notifier.send(Event::busy(task_id)).await;

        let project = ctx.projects.fetch_project(&request.project_id).await?;
        let definition = ctx.definitions.fetch(&request.suite, &request.asset).await?;

        ctx.notifier
            .send(Event::note(
                format!("define batch tasks: {} @ {}", request.asset, project.fs_path),
                Some(project.id.as_str()),
                Workflow::Load,
            ))
            .await;

        let plan = planner::plan(
            ctx.source.as_ref(),
            request,
            &definition,
            &project,
            planner::excel_now(),
        )
        .await?;

        if plan.chunks.is_empty() {
            info!(task_id, batch_id = %plan.batch_id, asset = %request.asset, "no identifiers; nothing to load");
            ctx.notifier
                .send(Event::note(
                    format!("no {} to load @ {}", request.asset, project.fs_path),
                    Some(project.id.as_str()),
                    Workflow::Load,
                ))
                .await;
            ctx.notifier.send(Event::done(task_id)).await;
            return Ok(());
        }

        let ids = ctx.bus.enqueue_chunks(&ctx.host, &plan.batch_id, &plan.chunks).await?;

        info!(task_id, batch_id = %plan.batch_id, chunks = ids.len(), "batch published");
        ctx.notifier
            .send(Event::note(
                format!("set {} chunk tasks @ {}", ids.len(), project.fs_path),
                Some(project.id.as_str()),
                Workflow::Load,
            ))
            .await;
        ctx.notifier.send(Event::done(task_id)).await;
        Ok(())
    }

    /// Load one chunk and settle its ledger row
    pub async fn handle_chunk(&self, task_id: i64, chunk: &ChunkTask) -> WorkerResult<()> {
        let ctx = &self.ctx;
        ctx.notifier.send(Event::busy(&chunk.batch_id)).await;

        if let Err(e) = self.load_chunk(chunk).await {
            if let Err(ledger_err) = ctx.bus.fail_ledger_entry(&chunk.batch_id, task_id).await {
                warn!(task_id, batch_id = %chunk.batch_id, error = %ledger_err, "could not mark ledger row FAILED");
            }
            return Err(e);
        }

        let remaining = ctx.bus.delete_ledger_entry(&chunk.batch_id, task_id).await?;

        if remaining == Some(0) {
            info!(batch_id = %chunk.batch_id, asset = %chunk.asset, "batch finished");
            ctx.notifier.send(Event::done(&chunk.batch_id)).await;
        }
        Ok(())
    }

    async fn load_chunk(&self, chunk: &ChunkTask) -> WorkerResult<()> {
        let ctx = &self.ctx;
        let rows = ctx.source.query(&chunk.conn, &chunk.selector).await?;
        let docs = compose_docs(&rows, chunk)?;

        ctx.notifier
            .send(Event::note(
                format!("composed {} {} docs @ {}", docs.len(), chunk.asset, chunk.project_name),
                Some(chunk.project_id.as_str()),
                Workflow::Load,
            ))
            .await;

        let written = ctx.sink.upsert(&chunk.asset, &docs).await?;

        ctx.notifier
            .send(Event::note(
                format!("upsert: {} of {} {}", written, docs.len(), chunk.asset),
                Some(chunk.project_id.as_str()),
                Workflow::Load,
            ))
            .await;
        Ok(())
    }

    async fn handle_collaborator(&self, task: &TaskRecord) -> WorkerResult<()> {
        self.ctx.notifier.send(Event::busy(task.id)).await;
        self.collaborator.handle(task).await?;
        self.ctx.notifier.send(Event::done(task.id)).await;
        Ok(())
    }

    /// True once no ledger rows remain for `batch_id`
    pub async fn is_batch_finished(&self, batch_id: &str) -> WorkerResult<bool> {
        Ok(self.ctx.bus.remaining_ledger_entries(batch_id).await? == 0)
    }
}
