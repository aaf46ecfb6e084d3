//! Postgres-backed task bus and project catalog
//!
//! Tasks, ledger rows and projects live in the control database. New or
//! re-queued tasks are announced with `NOTIFY <channel>, '<task id>'` by a
//! trigger on the task table (see `migrations/`), which [`PgTaskBus::subscribe`]
//! turns into a stream of ids.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use purr_common::{Directive, TaskStatus};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ChunkTask, Project, ProjectCatalog, RawTask, TaskBody, TaskBus};
use crate::error::{WorkerError, WorkerResult};
use crate::source::SourceConnection;

/// How to (re)build the control-database pool
#[derive(Debug, Clone)]
pub struct PgBusOptions {
    pub connect: PgConnectOptions,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub channel: String,
}

/// Control-database pool handle that follows session refreshes.
///
/// Clones share one slot: when [`PgTaskBus::refresh_session`] swaps in a new
/// pool, every holder sees it on its next [`SharedPool::get`].
#[derive(Clone)]
pub struct SharedPool(Arc<RwLock<PgPool>>);

impl SharedPool {
    pub fn new(pool: PgPool) -> Self {
        Self(Arc::new(RwLock::new(pool)))
    }

    /// Current pool; cheap to clone
    pub async fn get(&self) -> PgPool {
        self.0.read().await.clone()
    }

    /// Install `fresh` and hand back the pool it replaced
    async fn replace(&self, fresh: PgPool) -> PgPool {
        let mut guard = self.0.write().await;
        std::mem::replace(&mut *guard, fresh)
    }
}

impl From<PgPool> for SharedPool {
    fn from(pool: PgPool) -> Self {
        Self::new(pool)
    }
}

pub struct PgTaskBus {
    pool: SharedPool,
    options: PgBusOptions,
}

impl PgTaskBus {
    pub async fn connect(options: PgBusOptions) -> WorkerResult<Self> {
        let pool = build_pool(&options).await?;
        Ok(Self {
            pool: SharedPool::new(pool),
            options,
        })
    }

    /// Wrap an existing pool; `refresh_session` rebuilds from `options.connect`
    pub fn from_pool(pool: PgPool, options: PgBusOptions) -> Self {
        Self {
            pool: SharedPool::new(pool),
            options,
        }
    }

    /// Current pool handle; cheap to clone
    pub async fn pool(&self) -> PgPool {
        self.pool.get().await
    }

    /// Handle for components that must keep writing after a session refresh
    pub fn shared_pool(&self) -> SharedPool {
        self.pool.clone()
    }
}

async fn build_pool(options: &PgBusOptions) -> WorkerResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(options.connect_timeout)
        .connect_with(options.connect.clone())
        .await
        .map_err(WorkerError::from_bus)
}

#[async_trait]
impl TaskBus for PgTaskBus {
    async fn fetch_task(&self, id: i64) -> WorkerResult<Option<RawTask>> {
        let pool = self.pool().await;
        sqlx::query_as::<_, RawTask>(
            r#"
            SELECT id, worker, directive, status, body
            FROM task
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&pool)
        .await
        .map_err(WorkerError::from_bus)
    }

    async fn pending_tasks(&self, worker: &str) -> WorkerResult<Vec<RawTask>> {
        let pool = self.pool().await;
        sqlx::query_as::<_, RawTask>(
            r#"
            SELECT id, worker, directive, status, body
            FROM task
            WHERE worker = $1 AND status = $2
            ORDER BY id
            "#,
        )
        .bind(worker)
        .bind(TaskStatus::Pending.as_str())
        .fetch_all(&pool)
        .await
        .map_err(WorkerError::from_bus)
    }

    async fn claim_task(&self, id: i64) -> WorkerResult<bool> {
        let pool = self.pool().await;
        let result = sqlx::query(
            r#"
            UPDATE task
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(TaskStatus::Processing.as_str())
        .bind(id)
        .bind(TaskStatus::Pending.as_str())
        .execute(&pool)
        .await
        .map_err(WorkerError::from_bus)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_status(&self, id: i64, status: TaskStatus) -> WorkerResult<()> {
        let pool = self.pool().await;
        sqlx::query(
            r#"
            UPDATE task
            SET status = $1, updated_at = NOW()
            WHERE id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&pool)
        .await
        .map_err(WorkerError::from_bus)?;

        Ok(())
    }

    async fn delete_task(&self, id: i64) -> WorkerResult<()> {
        let pool = self.pool().await;
        sqlx::query("DELETE FROM task WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await
            .map_err(WorkerError::from_bus)?;

        Ok(())
    }

    async fn enqueue_chunks(&self, worker: &str, batch_id: &str, chunks: &[ChunkTask]) -> WorkerResult<Vec<i64>> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await.map_err(WorkerError::from_bus)?;
        let mut ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let (directive, body) = TaskBody::Chunk(Box::new(chunk.clone())).to_columns()?;
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO task (worker, directive, status, body)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(worker)
            .bind(directive.as_str())
            .bind(TaskStatus::Pending.as_str())
            .bind(body)
            .fetch_one(&mut *tx)
            .await
            .map_err(WorkerError::from_bus)?;

            sqlx::query(
                r#"
                INSERT INTO batch_ledger (batch_id, task_id, status)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(batch_id)
            .bind(id)
            .bind(TaskStatus::Pending.as_str())
            .execute(&mut *tx)
            .await
            .map_err(WorkerError::from_bus)?;

            ids.push(id);
        }

        tx.commit().await.map_err(WorkerError::from_bus)?;
        debug!(batch_id = %batch_id, chunks = ids.len(), "enqueued chunk tasks");
        Ok(ids)
    }

    async fn delete_ledger_entry(&self, batch_id: &str, task_id: i64) -> WorkerResult<Option<i64>> {
        let pool = self.pool().await;
        let mut tx = pool.begin().await.map_err(WorkerError::from_bus)?;

        // chunks of one batch settle one at a time
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('purr_ledger'), hashtext($1))")
            .bind(batch_id)
            .execute(&mut *tx)
            .await
            .map_err(WorkerError::from_bus)?;

        let deleted = sqlx::query("DELETE FROM batch_ledger WHERE batch_id = $1 AND task_id = $2")
            .bind(batch_id)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(WorkerError::from_bus)?
            .rows_affected();

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM batch_ledger WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(WorkerError::from_bus)?;

        tx.commit().await.map_err(WorkerError::from_bus)?;
        Ok((deleted == 1).then_some(remaining))
    }

    async fn fail_ledger_entry(&self, batch_id: &str, task_id: i64) -> WorkerResult<()> {
        let pool = self.pool().await;
        sqlx::query(
            r#"
            UPDATE batch_ledger
            SET status = $1
            WHERE batch_id = $2 AND task_id = $3
            "#,
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(batch_id)
        .bind(task_id)
        .execute(&pool)
        .await
        .map_err(WorkerError::from_bus)?;

        Ok(())
    }

    async fn remaining_ledger_entries(&self, batch_id: &str) -> WorkerResult<i64> {
        let pool = self.pool().await;
        sqlx::query_scalar("SELECT COUNT(*) FROM batch_ledger WHERE batch_id = $1")
            .bind(batch_id)
            .fetch_one(&pool)
            .await
            .map_err(WorkerError::from_bus)
    }

    async fn refresh_session(&self) -> WorkerResult<()> {
        let fresh = build_pool(&self.options).await?;
        let stale = self.pool.replace(fresh).await;
        stale.close().await;
        info!("control database session refreshed");
        Ok(())
    }

    async fn register_worker(&self, worker: &str, suite: &str) -> WorkerResult<()> {
        let pool = self.pool().await;
        sqlx::query(
            r#"
            INSERT INTO worker (hostname, suite)
            VALUES ($1, $2)
            ON CONFLICT (hostname) DO UPDATE
            SET suite = EXCLUDED.suite, registered_at = NOW()
            "#,
        )
        .bind(worker)
        .bind(suite)
        .execute(&pool)
        .await
        .map_err(WorkerError::from_bus)?;

        Ok(())
    }

    async fn subscribe(&self) -> WorkerResult<BoxStream<'static, WorkerResult<i64>>> {
        let pool = self.pool().await;
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(WorkerError::from_bus)?;
        listener
            .listen(&self.options.channel)
            .await
            .map_err(WorkerError::from_bus)?;
        info!(channel = %self.options.channel, "listening for tasks");

        let stream = listener.into_stream().filter_map(|notification| async move {
            match notification {
                Ok(n) => match n.payload().trim().parse::<i64>() {
                    Ok(id) => Some(Ok(id)),
                    Err(_) => {
                        warn!(payload = %n.payload(), "ignoring non-numeric task notification");
                        None
                    },
                },
                Err(e) => Some(Err(WorkerError::from_bus(e))),
            }
        });

        Ok(stream.boxed())
    }
}

#[async_trait]
impl ProjectCatalog for PgTaskBus {
    async fn fetch_project(&self, id: &str) -> WorkerResult<Project> {
        let pool = self.pool().await;
        let row = sqlx::query(
            r#"
            SELECT id, name, fs_path, conn, suite, tag
            FROM project
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&pool)
        .await
        .map_err(WorkerError::from_bus)?
        .ok_or_else(|| WorkerError::ProjectNotFound(id.to_string()))?;

        let conn: serde_json::Value = row.try_get("conn").map_err(WorkerError::from_bus)?;
        Ok(Project {
            id: row.try_get("id").map_err(WorkerError::from_bus)?,
            name: row.try_get("name").map_err(WorkerError::from_bus)?,
            fs_path: row.try_get("fs_path").map_err(WorkerError::from_bus)?,
            conn: serde_json::from_value::<SourceConnection>(conn)?,
            suite: row.try_get("suite").map_err(WorkerError::from_bus)?,
            tag: row.try_get("tag").map_err(WorkerError::from_bus)?,
        })
    }
}

/// Insert a task row; used to publish batch requests and by tests
pub async fn publish(pool: &PgPool, worker: &str, body: &TaskBody) -> WorkerResult<i64> {
    let (directive, value): (Directive, serde_json::Value) = body.to_columns()?;
    sqlx::query_scalar(
        r#"
        INSERT INTO task (worker, directive, status, body)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(worker)
    .bind(directive.as_str())
    .bind(TaskStatus::Pending.as_str())
    .bind(value)
    .fetch_one(pool)
    .await
    .map_err(WorkerError::from_bus)
}
