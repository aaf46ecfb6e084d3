//! Worker pools and the task dispatcher
//!
//! The dispatcher turns bus notifications into decoded tasks and routes them
//! to one of two bounded pools: search and export run on their own pool so a
//! long batch never delays an interactive request. Each task occupies one
//! pool worker until its handler returns.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{accepts, RawTask, TaskBody, TaskRecord};
use crate::context::WorkerContext;
use crate::coordinator::{Coordinator, TaskOutcome};
use crate::error::{WorkerError, WorkerResult};

/// Queued tasks allowed per pool worker before `submit` waits
const QUEUE_DEPTH_PER_WORKER: usize = 16;

/// Something that can run a decoded task to completion
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: TaskRecord) -> TaskOutcome;
}

#[async_trait]
impl TaskHandler for Coordinator {
    async fn handle(&self, task: TaskRecord) -> TaskOutcome {
        self.handle_task(task).await
    }
}

/// Fixed number of workers draining one bounded queue
pub struct WorkerPool {
    name: String,
    sender: async_channel::Sender<TaskRecord>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize, handler: Arc<dyn TaskHandler>) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = async_channel::bounded::<TaskRecord>(size * QUEUE_DEPTH_PER_WORKER);

        let workers = (0..size)
            .map(|worker| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let pool = name.clone();
                tokio::spawn(async move {
                    while let Ok(task) = receiver.recv().await {
                        let task_id = task.id;
                        let outcome = handler.handle(task).await;
                        debug!(pool = %pool, worker, task_id, ?outcome, "task handled");
                    }
                    debug!(pool = %pool, worker, "worker stopped");
                })
            })
            .collect();

        info!(pool = %name, size, "worker pool started");
        Self { name, sender, workers }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task; waits while the queue is full
    pub async fn submit(&self, task: TaskRecord) -> WorkerResult<()> {
        self.sender
            .send(task)
            .await
            .map_err(|e| WorkerError::Bus(format!("{} pool is closed (task {})", self.name, e.0.id)))
    }

    /// Tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Stop intake and wait for queued and running tasks. Returns false if
    /// `timeout` elapsed first; remaining work is abandoned.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.sender.close();
        let name = self.name;
        let all = futures::future::join_all(self.workers);
        match tokio::time::timeout(timeout, all).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(pool = %name, error = %e, "worker panicked");
                    }
                }
                info!(pool = %name, "worker pool drained");
                true
            },
            Err(_) => {
                warn!(pool = %name, timeout_secs = timeout.as_secs(), "shutdown timed out; abandoning tasks");
                false
            },
        }
    }
}

/// What the dispatcher did with one raw task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Not addressed to this worker, not PENDING, or another suite
    Ignored,
    /// Addressed here but undecodable; marked FAILED
    Rejected,
    Work,
    Search,
    Halt,
}

pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    work: WorkerPool,
    search: WorkerPool,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<WorkerContext>,
        handler: Arc<dyn TaskHandler>,
        work_workers: usize,
        search_workers: usize,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            work: WorkerPool::new("work", work_workers, handler.clone()),
            search: WorkerPool::new("search", search_workers, handler),
            ctx,
            shutdown: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Cancelling this token stops intake; `run` then drains the pools
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept, decode and route one raw task
    pub async fn route(&self, raw: RawTask) -> Routed {
        if !accepts(&raw, &self.ctx.host, &self.ctx.suite) {
            debug!(task_id = raw.id, worker = %raw.worker, status = %raw.status, "task not for this worker");
            return Routed::Ignored;
        }

        let task_id = raw.id;
        let task = match TaskRecord::try_from(raw) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id, error = %e, "undecodable task");
                if let Err(status_err) = self
                    .ctx
                    .bus
                    .set_status(task_id, purr_common::TaskStatus::Failed)
                    .await
                {
                    error!(task_id, error = %status_err, "could not mark task FAILED");
                }
                return Routed::Rejected;
            },
        };

        if let TaskBody::Halt(_) = task.body {
            info!(task_id, "halt requested");
            if let Err(e) = self.ctx.bus.delete_task(task_id).await {
                warn!(task_id, error = %e, "could not remove halt task");
            }
            self.shutdown.cancel();
            return Routed::Halt;
        }

        let (pool, routed) = if task.directive().is_latency_sensitive() {
            (&self.search, Routed::Search)
        } else {
            (&self.work, Routed::Work)
        };

        debug!(task_id, directive = %task.directive(), pool = pool.name(), "queueing task");
        if let Err(e) = pool.submit(task).await {
            error!(task_id, error = %e, "could not queue task");
        }
        routed
    }

    /// Catch up on PENDING tasks, then follow the bus until halted.
    ///
    /// The subscription is opened before the catch-up query so a task
    /// published in between is seen at least once; the claim step in the
    /// coordinator drops the duplicate.
    pub async fn run(self) -> WorkerResult<()> {
        let mut notifications = self.ctx.bus.subscribe().await?;

        let backlog = self.ctx.bus.pending_tasks(&self.ctx.host).await?;
        if !backlog.is_empty() {
            info!(count = backlog.len(), "catching up on pending tasks");
        }
        for raw in backlog {
            if self.shutdown.is_cancelled() || self.route(raw).await == Routed::Halt {
                break;
            }
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,
                next = notifications.next() => match next {
                    Some(Ok(task_id)) => match self.ctx.bus.fetch_task(task_id).await {
                        Ok(Some(raw)) => {
                            self.route(raw).await;
                        },
                        Ok(None) => debug!(task_id, "notified task no longer exists"),
                        Err(e) => warn!(task_id, error = %e, "could not fetch notified task"),
                    },
                    Some(Err(e)) => warn!(error = %e, "task subscription error"),
                    None => {
                        warn!("task subscription ended");
                        break;
                    },
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Close both pools and wait for in-flight work
    pub async fn shutdown(self) -> bool {
        info!(timeout_secs = self.shutdown_timeout.as_secs(), "stopping worker pools");
        let (work, search) = tokio::join!(
            self.work.shutdown(self.shutdown_timeout),
            self.search.shutdown(self.shutdown_timeout)
        );
        work && search
    }
}
