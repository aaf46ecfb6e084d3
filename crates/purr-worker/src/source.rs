//! Source store access
//!
//! Projects keep their well data in legacy relational stores. The worker only
//! ever reads from them, one connection per query execution: connections are
//! opened, used for one statement (or one ordered list of statements) and
//! closed again. They are never pooled or shared between chunk tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Column, Connection, Row};
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};

/// Connection parameters for a project's source store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConnection {
    /// sqlx connection URL, e.g. `sqlite:///projects/interstate/db.sqlite`
    pub url: String,
}

/// A single column value as read from the source store
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SourceValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SourceValue::Null)
    }

    /// Render the value the way the legacy worker stringified hash inputs.
    ///
    /// Document ids are digests over these strings, so `1.0` must stay
    /// `"1.0"` and a missing value must stay `"None"`.
    pub fn key_text(&self) -> String {
        match self {
            SourceValue::Null => "None".to_string(),
            SourceValue::Bool(true) => "True".to_string(),
            SourceValue::Bool(false) => "False".to_string(),
            SourceValue::Int(i) => i.to_string(),
            SourceValue::Float(f) => key_float(*f),
            SourceValue::Text(s) => s.clone(),
            SourceValue::Bytes(b) => hex::encode(b),
        }
    }

    /// Untransformed JSON representation; bytes become lowercase hex.
    pub fn to_json(&self) -> Value {
        match self {
            SourceValue::Null => Value::Null,
            SourceValue::Bool(b) => Value::Bool(*b),
            SourceValue::Int(i) => Value::from(*i),
            SourceValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SourceValue::Text(s) => Value::String(s.clone()),
            SourceValue::Bytes(b) => Value::String(hex::encode(b)),
        }
    }
}

fn key_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let rendered = format!("{:e}", f);
        if let Some((mantissa, exponent)) = rendered.split_once('e') {
            if let Ok(exp) = exponent.parse::<i32>() {
                let sign = if exp < 0 { '-' } else { '+' };
                return format!("{}e{}{:02}", mantissa, sign, exp.abs());
            }
        }
        return rendered;
    }

    let rendered = f.to_string();
    if rendered.contains('.') {
        rendered
    } else {
        format!("{}.0", rendered)
    }
}

/// One result row: column names and values in select-list order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceRow {
    fields: Vec<(String, SourceValue)>,
}

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: SourceValue) -> Self {
        self.fields.push((column.into(), value));
        self
    }

    /// Case-sensitive lookup; first match wins
    pub fn get(&self, column: &str) -> Option<&SourceValue> {
        self.fields.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SourceValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, SourceValue)> for SourceRow {
    fn from_iter<I: IntoIterator<Item = (String, SourceValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Synchronous-per-call query execution against a project's source store
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Execute `statements` in order on a single connection and return one
    /// result set per statement.
    async fn query_many(
        &self,
        conn: &SourceConnection,
        statements: &[String],
    ) -> WorkerResult<Vec<Vec<SourceRow>>>;

    async fn query(&self, conn: &SourceConnection, sql: &str) -> WorkerResult<Vec<SourceRow>> {
        let mut sets = self.query_many(conn, &[sql.to_string()]).await?;
        Ok(sets.pop().unwrap_or_default())
    }
}

/// [`SourceStore`] backed by a fresh sqlx `AnyConnection` per call
#[derive(Debug, Clone, Copy)]
pub struct SqlxSourceStore;

impl SqlxSourceStore {
    pub fn new() -> Self {
        sqlx::any::install_default_drivers();
        Self
    }
}

impl Default for SqlxSourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceStore for SqlxSourceStore {
    async fn query_many(
        &self,
        conn: &SourceConnection,
        statements: &[String],
    ) -> WorkerResult<Vec<Vec<SourceRow>>> {
        let mut connection = AnyConnection::connect(&conn.url)
            .await
            .map_err(|e| WorkerError::SourceQuery(format!("connect failed: {}", e)))?;

        let mut results = Vec::with_capacity(statements.len());
        for sql in statements {
            debug!(sql = %sql, "executing source query");
            match sqlx::query(sql.as_str()).fetch_all(&mut connection).await {
                Ok(rows) => results.push(rows.iter().map(decode_row).collect()),
                Err(e) => {
                    // the query error is the one worth reporting
                    let _ = connection.close().await;
                    return Err(WorkerError::SourceQuery(e.to_string()));
                },
            }
        }

        connection
            .close()
            .await
            .map_err(|e| WorkerError::SourceQuery(format!("close failed: {}", e)))?;

        Ok(results)
    }
}

fn decode_row(row: &AnyRow) -> SourceRow {
    row.columns()
        .iter()
        .map(|column| {
            let value = decode_value(row, column.ordinal());
            (column.name().to_string(), value)
        })
        .collect()
}

fn decode_value(row: &AnyRow, index: usize) -> SourceValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map_or(SourceValue::Null, SourceValue::Int);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map_or(SourceValue::Null, SourceValue::Float);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map_or(SourceValue::Null, SourceValue::Text);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return v.map_or(SourceValue::Null, SourceValue::Bytes);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map_or(SourceValue::Null, SourceValue::Bool);
    }
    SourceValue::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_text_numbers() {
        assert_eq!(SourceValue::Int(621).key_text(), "621");
        assert_eq!(SourceValue::Float(1.0).key_text(), "1.0");
        assert_eq!(SourceValue::Float(0.5).key_text(), "0.5");
        assert_eq!(SourceValue::Float(-0.0).key_text(), "-0.0");
        assert_eq!(SourceValue::Float(1e30).key_text(), "1e+30");
        assert_eq!(SourceValue::Float(1.5e-5).key_text(), "1.5e-05");
    }

    #[test]
    fn test_key_text_other() {
        assert_eq!(SourceValue::Null.key_text(), "None");
        assert_eq!(SourceValue::Bool(true).key_text(), "True");
        assert_eq!(SourceValue::Text("1-62".into()).key_text(), "1-62");
        assert_eq!(SourceValue::Bytes(vec![0xab, 0x01]).key_text(), "ab01");
    }

    #[test]
    fn test_to_json_drops_non_finite() {
        assert_eq!(SourceValue::Float(f64::NAN).to_json(), Value::Null);
        assert_eq!(SourceValue::Float(2.5).to_json(), serde_json::json!(2.5));
        assert_eq!(SourceValue::Bytes(vec![0xff]).to_json(), serde_json::json!("ff"));
    }

    #[test]
    fn test_row_lookup_keeps_order() {
        let row = SourceRow::new()
            .with("w_wsn", SourceValue::Int(42))
            .with("w_uwi", SourceValue::Text("4201".into()));

        assert_eq!(row.get("w_wsn"), Some(&SourceValue::Int(42)));
        assert_eq!(row.get("missing"), None);
        assert_eq!(row.columns().collect::<Vec<_>>(), vec!["w_wsn", "w_uwi"]);
        assert_eq!(row.len(), 2);
    }
}
