//! Source store execution through the sqlx `Any` driver

use anyhow::Result;
use purr_worker::error::WorkerError;
use purr_worker::source::{SourceConnection, SourceStore, SourceValue, SqlxSourceStore};

fn memory() -> SourceConnection {
    SourceConnection {
        url: "sqlite::memory:".to_string(),
    }
}

#[tokio::test]
async fn test_query_many_runs_statements_on_one_connection() -> Result<()> {
    let store = SqlxSourceStore::new();
    let statements = vec![
        "CREATE TABLE well (wsn INTEGER, uwi TEXT, elev REAL, log BLOB)".to_string(),
        "INSERT INTO well VALUES (1, '42001', 1250.5, x'0a0b'), (2, NULL, NULL, NULL)".to_string(),
        "SELECT wsn, uwi, elev, log FROM well ORDER BY wsn".to_string(),
    ];

    let results = store.query_many(&memory(), &statements).await?;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_empty());

    let rows = &results[2];
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("wsn"), Some(&SourceValue::Int(1)));
    assert_eq!(rows[0].get("uwi"), Some(&SourceValue::Text("42001".to_string())));
    assert_eq!(rows[0].get("elev"), Some(&SourceValue::Float(1250.5)));
    assert_eq!(rows[0].get("log"), Some(&SourceValue::Bytes(vec![0x0a, 0x0b])));
    assert_eq!(rows[1].get("uwi"), Some(&SourceValue::Null));
    Ok(())
}

#[tokio::test]
async fn test_each_call_gets_a_fresh_connection() -> Result<()> {
    let store = SqlxSourceStore::new();
    store
        .query_many(&memory(), &["CREATE TABLE scratch (x INTEGER)".to_string()])
        .await?;

    // a new in-memory database: the table from the previous call is gone
    let err = store.query(&memory(), "SELECT x FROM scratch").await.unwrap_err();
    assert!(matches!(err, WorkerError::SourceQuery(_)));
    Ok(())
}

#[tokio::test]
async fn test_unreachable_store_is_a_source_error() {
    let store = SqlxSourceStore::new();
    let conn = SourceConnection {
        url: "sqlite:///nonexistent/dir/project.db".to_string(),
    };
    let err = store.query(&conn, "SELECT 1").await.unwrap_err();
    assert!(matches!(err, WorkerError::SourceQuery(_)));
}
