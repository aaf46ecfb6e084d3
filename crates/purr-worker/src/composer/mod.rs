//! Document composition
//!
//! A chunk's rows become documents: decoded columns are grouped into
//! subdocuments by column prefix, each document gets a deterministic id, and
//! any post-process steps run over the chunk's own output.

pub mod aggregate;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::bus::ChunkTask;
use crate::codec::{self, Decoded, Tokens};
use crate::error::{WorkerError, WorkerResult};
use crate::source::{SourceRow, SourceValue};
pub use aggregate::PostProcess;

/// One analytical-store row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub project_name: String,
    pub well_id: String,
    pub suite: String,
    pub tag: String,
    pub doc: Map<String, Value>,
}

fn key_values<'a>(row: &'a SourceRow, keys: &[String], what: &str) -> WorkerResult<Vec<&'a SourceValue>> {
    keys.iter()
        .map(|k| {
            row.get(k)
                .ok_or_else(|| WorkerError::config(format!("{} column '{}' missing from row", what, k)))
        })
        .collect()
}

/// Deterministic document id.
///
/// Digest of project id, asset, suite, the project id again, then each
/// asset-id key value, all concatenated and lowercased.
pub fn document_id(task: &ChunkTask, row: &SourceRow) -> WorkerResult<String> {
    let keys = key_values(row, &task.asset_id_keys, "asset id")?;
    let mut parts: Vec<String> = vec![
        task.project_id.clone(),
        task.asset.clone(),
        task.suite.clone(),
        task.project_id.clone(),
    ];
    parts.extend(keys.iter().map(|v| v.key_text()));
    Ok(purr_common::hash::hashify_parts(parts))
}

/// Hyphen-joined well identity key values
pub fn well_id(task: &ChunkTask, row: &SourceRow) -> WorkerResult<String> {
    let keys = key_values(row, &task.well_id_keys, "well id")?;
    Ok(keys.iter().map(|v| v.key_text()).collect::<Vec<_>>().join("-"))
}

/// The declared prefix a column belongs to, if any
fn owning_prefix<'a>(prefixes: &'a BTreeMap<String, String>, column: &str) -> WorkerResult<Option<&'a str>> {
    let mut matches = prefixes.keys().filter(|p| column.starts_with(p.as_str()));
    let first = matches.next();
    if let Some(second) = matches.next() {
        return Err(WorkerError::config(format!(
            "column '{}' matches prefixes '{}' and '{}'",
            column,
            first.map(String::as_str).unwrap_or_default(),
            second
        )));
    }
    Ok(first.map(String::as_str))
}

#[derive(Default)]
struct Diagnostics {
    by_column: BTreeMap<String, (usize, String)>,
}

impl Diagnostics {
    fn record(&mut self, column: &str, diagnostic: &str) {
        let entry = self
            .by_column
            .entry(column.to_string())
            .or_insert_with(|| (0, diagnostic.to_string()));
        entry.0 += 1;
    }

    fn log(&self, task: &ChunkTask) {
        for (column, (count, first)) in &self.by_column {
            warn!(
                batch_id = %task.batch_id,
                asset = %task.asset,
                column = %column,
                count = count,
                diagnostic = %first,
                "degraded column values"
            );
        }
    }
}

fn compose_row(task: &ChunkTask, row: &SourceRow, diagnostics: &mut Diagnostics) -> WorkerResult<Document> {
    // ids hash the raw values, before any transform
    let id = document_id(task, row)?;
    let well_id = well_id(task, row)?;

    let tokens = Tokens {
        delimiter: task.purr_delimiter.as_deref(),
        null: task.purr_null.as_deref(),
    };

    let mut values: Vec<(String, Value)> = row
        .iter()
        .map(|(column, value)| -> WorkerResult<(String, Value)> {
            let decoded = match task.xforms.get(column) {
                Some(directive) => codec::transform(value, directive, tokens)?,
                None => Decoded::Value(value.to_json()),
            };
            if let Some(d) = decoded.diagnostic() {
                diagnostics.record(column, d);
            }
            Ok((column.to_string(), decoded.into_value()))
        })
        .collect::<WorkerResult<_>>()?;

    // directives for columns the selector did not return decode a null
    for column in task.xforms.keys() {
        if row.get(column).is_none() {
            values.push((column.clone(), Value::Null));
        }
    }

    let mut doc = Map::new();
    for subdoc in task.prefixes.values() {
        doc.entry(subdoc.clone()).or_insert_with(|| Value::Object(Map::new()));
    }
    for (column, value) in values {
        let Some(prefix) = owning_prefix(&task.prefixes, &column)? else {
            continue;
        };
        let Some(subdoc) = task.prefixes.get(prefix) else {
            continue;
        };
        if let Some(Value::Object(fields)) = doc.get_mut(subdoc) {
            fields.insert(column[prefix.len()..].to_string(), value);
        }
    }

    Ok(Document {
        id,
        project_id: task.project_id.clone(),
        project_name: task.project_name.clone(),
        well_id,
        suite: task.suite.clone(),
        tag: task.tag.clone(),
        doc,
    })
}

/// Compose every row of a chunk, then run its post-process steps.
///
/// A configuration problem (unknown post-process step, ambiguous prefix,
/// missing key column, fatal directive) aborts the whole chunk.
pub fn compose_docs(rows: &[SourceRow], task: &ChunkTask) -> WorkerResult<Vec<Document>> {
    let steps = task
        .post_process
        .iter()
        .map(|name| name.parse::<PostProcess>())
        .collect::<WorkerResult<Vec<_>>>()?;

    let mut diagnostics = Diagnostics::default();
    let mut docs = rows
        .iter()
        .map(|row| compose_row(task, row, &mut diagnostics))
        .collect::<WorkerResult<Vec<_>>>()?;
    diagnostics.log(task);

    for step in &steps {
        docs = step.apply(docs);
    }
    Ok(docs)
}
