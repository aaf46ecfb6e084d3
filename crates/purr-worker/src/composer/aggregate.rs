//! Post-process aggregation within one chunk
//!
//! Some one-to-many facets (formation tests, production tests, perforations)
//! are stored as one source row per item, each with a binary payload the
//! store's own list aggregation cannot combine. Those rows become one
//! document each; aggregation folds documents of the same well back into a
//! single document whose facet is an array.

use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

use super::Document;
use crate::error::WorkerError;

/// Subdocument holding the well identity
pub const WELL_SUBDOC: &str = "well";
/// Field inside [`WELL_SUBDOC`] that identifies a well
pub const WELL_IDENTITY: &str = "wsn";

const AGGREGATE_PREFIX: &str = "aggregate_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostProcess {
    /// Merge documents per well, collecting `facet` into an array
    Aggregate { facet: String },
}

impl FromStr for PostProcess {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(AGGREGATE_PREFIX) {
            Some(facet) if !facet.is_empty() => Ok(PostProcess::Aggregate {
                facet: facet.to_string(),
            }),
            _ => Err(WorkerError::config(format!("unknown post-process step '{}'", s))),
        }
    }
}

impl PostProcess {
    pub fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        match self {
            PostProcess::Aggregate { facet } => aggregate(docs, facet),
        }
    }
}

fn identity(doc: &Document) -> Option<String> {
    doc.doc
        .get(WELL_SUBDOC)
        .and_then(|well| well.get(WELL_IDENTITY))
        .filter(|v| !v.is_null())
        .map(Value::to_string)
}

/// Merge documents sharing a well identity, first-seen order.
///
/// The first document of each well keeps all of its subdocuments and its
/// facet becomes an array; later documents contribute only their facet.
/// Documents without an identity are never merged.
pub fn aggregate(docs: Vec<Document>, facet: &str) -> Vec<Document> {
    let mut out: Vec<Document> = Vec::with_capacity(docs.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for mut doc in docs {
        let item = doc.doc.remove(facet).unwrap_or(Value::Null);
        let key = identity(&doc);

        if let Some(&at) = key.as_ref().and_then(|k| index.get(k)) {
            if let Some(Value::Array(items)) = out[at].doc.get_mut(facet) {
                items.push(item);
            }
            continue;
        }

        doc.doc.insert(facet.to_string(), Value::Array(vec![item]));
        if let Some(k) = key {
            index.insert(k, out.len());
        }
        out.push(doc);
    }

    out
}
