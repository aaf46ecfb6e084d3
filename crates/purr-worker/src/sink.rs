//! Idempotent document sink
//!
//! Every asset type gets its own table in the analytical store with the same
//! column shape. A chunk's documents are written in one transaction; a
//! conflicting id overwrites every column, so re-running a batch converges on
//! the same rows.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::composer::Document;
use crate::error::{WorkerError, WorkerResult};

#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Write all of `docs` or none of them; returns the rows written
    async fn upsert(&self, asset: &str, docs: &[Document]) -> WorkerResult<u64>;
}

/// Asset names become table names, so only plain identifiers are allowed
pub fn table_name(asset: &str) -> WorkerResult<String> {
    let mut chars = asset.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && asset.len() <= 63;

    if valid {
        Ok(asset.to_string())
    } else {
        Err(WorkerError::config(format!("'{}' is not a valid asset table name", asset)))
    }
}

pub struct PgUpsertSink {
    pool: PgPool,
    /// Tables this process has already created or found
    ready: Mutex<HashSet<String>>,
}

impl PgUpsertSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ready: Mutex::new(HashSet::new()),
        }
    }

    /// Create `table` once, outside any chunk transaction.
    ///
    /// Concurrent `CREATE TABLE IF NOT EXISTS` of the same name races on the
    /// catalog, so creation is serialised by a transaction-scoped advisory
    /// lock keyed on the table name. That covers other worker processes too.
    async fn ensure_table(&self, table: &str) -> Result<(), sqlx::Error> {
        let mut ready = self.ready.lock().await;
        if ready.contains(table) {
            return Ok(());
        }

        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                project_name TEXT NOT NULL,
                well_id TEXT NOT NULL,
                suite TEXT NOT NULL,
                tag TEXT NOT NULL DEFAULT '',
                doc JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        );

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('purr_sink'), hashtext($1))")
            .bind(table)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&ddl).execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(table = %table, "asset table ready");
        ready.insert(table.to_string());
        Ok(())
    }
}

async fn write_all(tx: &mut Transaction<'_, Postgres>, table: &str, docs: &[Document]) -> Result<u64, sqlx::Error> {
    let sql = format!(
        r#"
        INSERT INTO {table} (id, project_id, project_name, well_id, suite, tag, doc)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE SET
            project_id = EXCLUDED.project_id,
            project_name = EXCLUDED.project_name,
            well_id = EXCLUDED.well_id,
            suite = EXCLUDED.suite,
            tag = EXCLUDED.tag,
            doc = EXCLUDED.doc,
            updated_at = NOW()
        "#
    );

    let mut written = 0;
    for doc in docs {
        let result = sqlx::query(&sql)
            .bind(&doc.id)
            .bind(&doc.project_id)
            .bind(&doc.project_name)
            .bind(&doc.well_id)
            .bind(&doc.suite)
            .bind(&doc.tag)
            .bind(Json(&doc.doc))
            .execute(&mut **tx)
            .await?;
        written += result.rows_affected();
    }
    Ok(written)
}

#[async_trait]
impl DocumentSink for PgUpsertSink {
    async fn upsert(&self, asset: &str, docs: &[Document]) -> WorkerResult<u64> {
        if docs.is_empty() {
            return Ok(0);
        }
        let table = table_name(asset)?;
        self.ensure_table(&table)
            .await
            .map_err(|e| WorkerError::sink(asset, e))?;

        let mut tx = self.pool.begin().await.map_err(|e| WorkerError::sink(asset, e))?;
        match write_all(&mut tx, &table, docs).await {
            Ok(written) => {
                tx.commit().await.map_err(|e| WorkerError::sink(asset, e))?;
                debug!(asset = %asset, written, "upserted documents");
                Ok(written)
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(asset = %asset, error = %rollback, "rollback failed");
                }
                Err(WorkerError::sink(asset, e))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(table_name("well").is_ok());
        assert!(table_name("raster_log").is_ok());
        assert!(table_name("_x1").is_ok());
        assert!(table_name("Well").is_err());
        assert!(table_name("1well").is_err());
        assert!(table_name("well; DROP TABLE task").is_err());
        assert!(table_name("").is_err());
    }
}
