//! Identifier chunking
//!
//! Source stores we read from cannot page with OFFSET/FETCH, so a batch is cut
//! into chunks by listing its identifiers and selecting each chunk with an IN
//! clause. Compound identifiers (`"<well>-<test>"`) must never straddle two
//! chunks: every row of a well has to land in the same chunk or aggregation
//! would produce partial documents that overwrite each other.

use std::collections::HashMap;
use std::fmt;

use crate::source::SourceValue;

/// One identifier returned by an asset's identifier query
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdKey {
    Int(i64),
    /// Unquoted text; quoted only when rendered into SQL
    Text(String),
}

impl IdKey {
    /// Integer when the text parses as one, otherwise trimmed text
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<i64>() {
            Ok(n) => IdKey::Int(n),
            Err(_) => IdKey::Text(trimmed.to_string()),
        }
    }

    pub fn from_source(value: &SourceValue) -> Self {
        match value {
            SourceValue::Int(n) => IdKey::Int(*n),
            SourceValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => IdKey::Int(*f as i64),
            SourceValue::Text(s) => IdKey::parse(s),
            other => IdKey::parse(&other.key_text()),
        }
    }

    /// Grouping token: text before the first `-` for compound keys, the whole
    /// value for integers
    pub fn group(&self) -> String {
        match self {
            IdKey::Int(n) => n.to_string(),
            IdKey::Text(s) => s.split('-').next().unwrap_or_default().to_string(),
        }
    }

    /// SQL string literal, single quotes doubled
    pub fn quoted(&self) -> String {
        match self {
            IdKey::Int(n) => format!("'{}'", n),
            IdKey::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for IdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKey::Int(n) => write!(f, "{}", n),
            IdKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for IdKey {
    fn from(n: i64) -> Self {
        IdKey::Int(n)
    }
}

impl From<&str> for IdKey {
    fn from(s: &str) -> Self {
        IdKey::parse(s)
    }
}

/// Partition `ids` into chunks of about `chunk` keys without splitting a group.
///
/// Groups are formed by [`IdKey::group`] and kept in first-appearance order.
/// A group larger than `chunk` becomes a chunk of its own. Empty chunks are
/// never emitted. `chunk` must be non-zero; the planner rejects zero before
/// calling this.
pub fn chunk_ids(ids: &[IdKey], chunk: usize) -> Vec<Vec<IdKey>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<IdKey>> = HashMap::new();
    for id in ids {
        let token = id.group();
        groups
            .entry(token.clone())
            .or_insert_with(|| {
                order.push(token);
                Vec::new()
            })
            .push(id.clone());
    }

    let mut chunks = Vec::new();
    let mut running: Vec<IdKey> = Vec::new();
    for token in order {
        let Some(group) = groups.remove(&token) else {
            continue;
        };
        if running.len() + group.len() > chunk && !running.is_empty() {
            chunks.push(std::mem::take(&mut running));
        }
        running.extend(group);
    }
    if !running.is_empty() {
        chunks.push(running);
    }
    chunks
}

/// IN predicate selecting one chunk's rows.
///
/// A single identifier key with integer ids compares the column directly;
/// otherwise the key columns are cast to text, joined with `-`, and compared
/// against the compound strings.
pub fn in_clause(identifier_keys: &[String], ids: &[IdKey]) -> String {
    let numeric = matches!(ids.first(), Some(IdKey::Int(_)));
    if let ([key], true) = (identifier_keys, numeric) {
        let values: Vec<String> = ids
            .iter()
            .map(|id| match id {
                IdKey::Int(n) => n.to_string(),
                text => text.quoted(),
            })
            .collect();
        return format!("{} IN ({})", key, values.join(","));
    }

    let columns: Vec<String> = identifier_keys
        .iter()
        .map(|k| format!("CAST({} AS VARCHAR(10))", k))
        .collect();
    let values: Vec<String> = ids.iter().map(IdKey::quoted).collect();
    format!("{} IN ({})", columns.join(" || '-' || "), values.join(","))
}
